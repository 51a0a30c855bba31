//! state-sync demo binary.
//!
//! Wires a button group, a state transformation, a record list, an address
//! map and a template-bound banner onto one bus, selects a button and prints
//! how the selection propagates.
//!
//! # Environment Variables
//!
//! - `STATE_SYNC_CATCH_PANICS` : isolate panicking bus handlers (default: true)
//! - `STATE_SYNC_FIRST_ID` : first participant id (default: 1)
//! - `RUST_LOG` : Log filter (default: "info,state_sync=debug")
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin state-sync-demo
//! # or with a config file:
//! cargo run --bin state-sync-demo -- config.yaml
//! ```

use std::rc::Rc;

use anyhow::Context;
use serde_json::json;
use state_sync::consumers::address_map::AddressMapSettings;
use state_sync::consumers::record_list::RecordListSettings;
use state_sync::consumers::transformation::{InMemoryRuleSource, TransformationRule};
use state_sync::consumers::InMemoryRecordService;
use state_sync::{
    DeclarativeAddressMap, DeclarativeButtonGroup, DeclarativeRecordList, DeclarativeStateTransformation,
    DynamicPropertySpec, MemoryHost, StartOptions, StateBus, StateParticipant, StateSyncConfig,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,state_sync=debug".into()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => StateSyncConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => StateSyncConfig::default(),
    }
    .with_env_overrides()?;
    tracing::info!("configuration: {:?}", config);

    let bus = StateBus::with_config(config);

    let rules = InMemoryRuleSource::new().with_rule_set(
        "industryToCriteria",
        vec![
            TransformationRule::dynamic("accountCriteria", "Industry = '{industry}'"),
            TransformationRule::fixed("industry", "Finance", "regulated", true),
        ],
    );
    let accounts = InMemoryRecordService::new().with_records(
        "Account",
        vec![
            json!({
                "Id": "001A",
                "Name": "Acme Bank",
                "Industry": "Finance",
                "BillingAddress": { "street": "1 Main St", "city": "Frankfurt", "country": "DE" }
            }),
            json!({ "Id": "001B", "Name": "Globex Capital", "Industry": "Finance", "BillingAddress": null }),
        ],
    );

    let transformation = DeclarativeStateTransformation::new(&bus, "industryToCriteria");
    transformation
        .connect(&rules)
        .await
        .context("connecting the state transformation")?;

    let list = DeclarativeRecordList::new(
        &bus,
        RecordListSettings {
            object_name: "Account".into(),
            fields: "Name, Industry".into(),
            criteria: "{accountCriteria}".into(),
            record_limit: "10".into(),
            selected_record_ids_property: Some("selectedAccountIds".into()),
            ..RecordListSettings::default()
        },
    );
    list.connect()?;

    let map = DeclarativeAddressMap::new(
        &bus,
        AddressMapSettings {
            card_title: "Selected accounts".into(),
            object_name: "Account".into(),
            address_field_name: "BillingAddress".into(),
            record_ids: "{selectedAccountIds}".into(),
            selected_marker_value_property: Some("selectedAccountId".into()),
            ..AddressMapSettings::default()
        },
    );
    map.connect()?;

    let banner_host = Rc::new(
        MemoryHost::new("Banner")
            .with_property("title", "Accounts in {industry} (regulated: {regulated})")
            .with_property("selection", "Selected: {selectedAccountIds}"),
    );
    let banner = StateParticipant::new(&bus, banner_host.clone());
    banner.start(
        StartOptions::new()
            .dynamic_property(DynamicPropertySpec::new("title"))
            .dynamic_property(DynamicPropertySpec::new("selection").empty_if_not_resolvable()),
    )?;

    let group = DeclarativeButtonGroup::new(&bus, "Technology, Finance, Retail", Some("industry".into()))
        .with_selected_label("Finance");
    group.connect()?;

    let outcome = list.refresh(&accounts).await;
    tracing::info!("record list refresh: {:?}", outcome);
    let first_row: Vec<_> = list.records().into_iter().take(1).collect();
    list.select_rows(&first_row);

    if map.needs_refresh() {
        let outcome = map.refresh(&accounts).await;
        tracing::info!("address map refresh: {:?}", outcome);
    }
    if let Some(marker) = map.markers().first() {
        map.select_marker(&marker.value);
    }

    println!("selected button : {:?}", group.selected_label());
    println!("criteria        : {:?}", list.property("criteria"));
    println!("records         : {}", list.records().len());
    println!("banner title    : {:?}", banner_host.get("title"));
    println!("banner selection: {:?}", banner_host.get("selection"));
    println!("map markers     : {:?}", map.markers());

    group.disconnect();
    list.disconnect();
    map.disconnect();
    transformation.disconnect();
    banner.stop();
    Ok(())
}
