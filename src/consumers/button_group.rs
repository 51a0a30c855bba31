//! Declarative button group: a single-choice selector that publishes the
//! selected label.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EventLog, LOG_TARGET};
use crate::events::StateBus;
use crate::state::{DynamicPropertySpec, HostEvent, ParticipantError, StartOptions, StateHost, StateParticipant};
use crate::utilities::merge_fields::render_value;

pub const BUTTON_LABELS: &str = "button_labels";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonVariant {
    Brand,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub index: usize,
    pub label: String,
    pub selected: bool,
    pub variant: ButtonVariant,
}

struct ButtonGroupHost {
    button_labels: RefCell<Value>,
    buttons: RefCell<Vec<Button>>,
    selected_index: Cell<Option<usize>>,
    preselected: RefCell<Option<String>>,
    events: EventLog,
}

impl ButtonGroupHost {
    fn calculate_buttons(&self) {
        let labels = render_value(&self.button_labels.borrow());
        if self.selected_index.get().is_none() {
            if let Some(wanted) = self.preselected.borrow().as_deref() {
                let index = labels.split(',').map(str::trim).position(|l| l == wanted);
                self.selected_index.set(index);
            }
        }
        let selected = self.selected_index.get();
        let buttons = if labels.is_empty() {
            Vec::new()
        } else {
            labels
                .split(',')
                .map(str::trim)
                .enumerate()
                .map(|(index, label)| {
                    let is_selected = selected == Some(index);
                    Button {
                        index,
                        label: label.to_string(),
                        selected: is_selected,
                        variant: if is_selected {
                            ButtonVariant::Brand
                        } else {
                            ButtonVariant::Neutral
                        },
                    }
                })
                .collect()
        };
        *self.buttons.borrow_mut() = buttons;
    }
}

impl StateHost for ButtonGroupHost {
    fn type_name(&self) -> &str {
        "DeclarativeButtonGroup"
    }

    fn property(&self, name: &str) -> Option<Value> {
        (name == BUTTON_LABELS).then(|| self.button_labels.borrow().clone())
    }

    fn set_property(&self, name: &str, value: Value) {
        if name != BUTTON_LABELS {
            log::warn!(target: LOG_TARGET, "DeclarativeButtonGroup: unknown property '{}'", name);
            return;
        }
        *self.button_labels.borrow_mut() = value;
        self.calculate_buttons();
    }

    fn dispatch_event(&self, event: HostEvent) {
        self.events.push(event);
    }
}

pub struct DeclarativeButtonGroup {
    host: Rc<ButtonGroupHost>,
    participant: StateParticipant,
    selected_property: Option<String>,
}

impl DeclarativeButtonGroup {
    /// `button_labels` is a comma-separated list and may hold merge fields.
    /// The selected label is published under `selected_property` when set.
    pub fn new(bus: &StateBus, button_labels: impl Into<String>, selected_property: Option<String>) -> Self {
        let host = Rc::new(ButtonGroupHost {
            button_labels: RefCell::new(Value::String(button_labels.into())),
            buttons: RefCell::new(Vec::new()),
            selected_index: Cell::new(None),
            preselected: RefCell::new(None),
            events: EventLog::default(),
        });
        host.calculate_buttons();
        let participant = StateParticipant::new(bus, host.clone());
        Self {
            host,
            participant,
            selected_property,
        }
    }

    /// Preselect the button labelled `label`.
    ///
    /// The selection is taken as soon as a matching label exists and is
    /// published on `connect`.
    pub fn with_selected_label(self, label: impl Into<String>) -> Self {
        *self.host.preselected.borrow_mut() = Some(label.into());
        self.host.calculate_buttons();
        self
    }

    pub fn participant(&self) -> &StateParticipant {
        &self.participant
    }

    pub fn connect(&self) -> Result<(), ParticipantError> {
        self.participant
            .start(StartOptions::new().dynamic_property(DynamicPropertySpec::new(BUTTON_LABELS)))?;
        if let (Some(property), Some(label)) = (&self.selected_property, self.selected_label()) {
            self.participant.publish(property.clone(), label);
        }
        Ok(())
    }

    pub fn disconnect(&self) {
        self.participant.stop();
    }

    pub fn buttons(&self) -> Vec<Button> {
        self.host.buttons.borrow().clone()
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.host.selected_index.get()
    }

    pub fn selected_label(&self) -> Option<String> {
        let index = self.selected_index()?;
        self.host.buttons.borrow().get(index).map(|b| b.label.clone())
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.host.events.snapshot()
    }

    /// Select the button at `index`.
    ///
    /// Returns `false` when the index is out of range or already selected.
    pub fn select(&self, index: usize) -> bool {
        if self.host.selected_index.get() == Some(index) {
            return false;
        }
        let label = {
            let mut buttons = self.host.buttons.borrow_mut();
            if index >= buttons.len() {
                return false;
            }
            if let Some(previous) = self.host.selected_index.get() {
                if let Some(button) = buttons.get_mut(previous) {
                    button.selected = false;
                    button.variant = ButtonVariant::Neutral;
                }
            }
            let button = &mut buttons[index];
            button.selected = true;
            button.variant = ButtonVariant::Brand;
            button.label.clone()
        };
        self.host.selected_index.set(Some(index));

        if let Some(property) = &self.selected_property {
            self.participant.publish(property.clone(), label);
        }
        true
    }

    /// Select the first button labelled `label`.
    pub fn select_label(&self, label: &str) -> bool {
        let index = self
            .host
            .buttons
            .borrow()
            .iter()
            .position(|b| b.label == label);
        index.map_or(false, |i| self.select(i))
    }
}
