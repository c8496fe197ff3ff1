use super::{ActiveCycle, CycleDefinition, CycleError, CycleMap, CycleStatus, CycleTrigger};
use crate::shared::ids::{CycleName, TriggerName};
use crate::shared::time::now_millis;
use crate::store::{records, StateStore};
use std::collections::BTreeSet;

/// Changes cycle content and starts or stops the active cycle. Never moves
/// the step index of a running cycle.
#[derive(Debug, Clone)]
pub struct CycleEditor {
    store: StateStore,
}

impl CycleEditor {
    pub(super) fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn create(
        &self,
        name: &CycleName,
        kind: &str,
        description: &str,
    ) -> Result<(), CycleError> {
        self.store
            .try_update_json(records::CYCLES, |cycles: &mut CycleMap| {
                if cycles.contains_key(name.as_str()) {
                    return Err(CycleError::AlreadyExists(name.to_string()));
                }
                cycles.insert(
                    name.to_string(),
                    CycleDefinition {
                        name: name.to_string(),
                        kind: if kind.trim().is_empty() {
                            "prompt".to_string()
                        } else {
                            kind.trim().to_string()
                        },
                        description: description.to_string(),
                        triggers: Vec::new(),
                        repeat: false,
                    },
                );
                Ok(())
            })
    }

    pub fn delete(&self, name: &str) -> Result<(), CycleError> {
        self.edit(name, |_| Ok(()))?;
        self.store
            .update_json(records::CYCLES, |cycles: &mut CycleMap| {
                cycles.remove(name);
            })?;
        // A deleted cycle cannot keep running.
        self.store
            .update_json(records::ACTIVE_CYCLE, |active: &mut Option<ActiveCycle>| {
                if let Some(active) = active.as_mut().filter(|active| active.name == name) {
                    if active.status == CycleStatus::Running {
                        active.status = CycleStatus::Stopped;
                        active.updated_at_ms = now_millis();
                    }
                }
            })?;
        Ok(())
    }

    pub fn set_description(&self, name: &str, description: &str) -> Result<(), CycleError> {
        self.edit(name, |cycle| {
            cycle.description = description.to_string();
            Ok(())
        })
    }

    pub fn set_loop(&self, name: &str, repeat: bool) -> Result<(), CycleError> {
        self.edit(name, |cycle| {
            cycle.repeat = repeat;
            Ok(())
        })
    }

    /// Adds a trigger at the end, or replaces the prompt of an existing trigger
    /// with the same name in place.
    pub fn add_trigger(
        &self,
        cycle: &str,
        trigger: &TriggerName,
        prompt: &str,
    ) -> Result<(), CycleError> {
        self.edit(cycle, |definition| {
            match definition
                .triggers
                .iter_mut()
                .find(|existing| existing.name == trigger.as_str())
            {
                Some(existing) => existing.prompt = prompt.to_string(),
                None => definition.triggers.push(CycleTrigger {
                    name: trigger.to_string(),
                    prompt: prompt.to_string(),
                }),
            }
            Ok(())
        })
    }

    pub fn delete_trigger(&self, cycle: &str, trigger: &str) -> Result<(), CycleError> {
        self.edit(cycle, |definition| {
            let before = definition.triggers.len();
            definition.triggers.retain(|existing| existing.name != trigger);
            if definition.triggers.len() == before {
                return Err(CycleError::TriggerNotFound {
                    cycle: cycle.to_string(),
                    trigger: trigger.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Reorders triggers; `order` must name every trigger exactly once.
    pub fn reorder_triggers(&self, cycle: &str, order: &[String]) -> Result<(), CycleError> {
        self.edit(cycle, |definition| {
            let current: BTreeSet<&str> = definition
                .triggers
                .iter()
                .map(|trigger| trigger.name.as_str())
                .collect();
            let requested: BTreeSet<&str> = order.iter().map(String::as_str).collect();
            if requested.len() != order.len() || current != requested {
                return Err(CycleError::InvalidOrder(format!(
                    "expected each of [{}] exactly once",
                    current.into_iter().collect::<Vec<_>>().join(", ")
                )));
            }
            let mut reordered = Vec::with_capacity(order.len());
            for name in order {
                if let Some(trigger) = definition.triggers.iter().find(|t| &t.name == name) {
                    reordered.push(trigger.clone());
                }
            }
            definition.triggers = reordered;
            Ok(())
        })
    }

    /// Starts `name` from its first trigger, replacing any active cycle.
    pub fn activate(&self, name: &str) -> Result<ActiveCycle, CycleError> {
        let exists = self
            .store
            .read_json::<CycleMap>(records::CYCLES)?
            .unwrap_or_default()
            .contains_key(name);
        if !exists {
            return Err(CycleError::NotFound(name.to_string()));
        }
        let now = now_millis();
        let active = ActiveCycle {
            name: name.to_string(),
            status: CycleStatus::Running,
            current_step: 0,
            started_at_ms: now,
            updated_at_ms: now,
            rounds: 0,
            last_error: None,
        };
        self.store.write_json(records::ACTIVE_CYCLE, &active)?;
        Ok(active)
    }

    /// Pauses the running cycle where it is.
    pub fn stop(&self) -> Result<ActiveCycle, CycleError> {
        self.set_status(CycleStatus::Running, CycleStatus::Stopped)
    }

    /// Continues a stopped cycle from its current step.
    pub fn resume(&self) -> Result<ActiveCycle, CycleError> {
        self.set_status(CycleStatus::Stopped, CycleStatus::Running)
    }

    fn set_status(&self, from: CycleStatus, to: CycleStatus) -> Result<ActiveCycle, CycleError> {
        self.store.try_update_json(
            records::ACTIVE_CYCLE,
            |active: &mut Option<ActiveCycle>| {
                let active = active.as_mut().ok_or(CycleError::NoActiveCycle)?;
                if active.status == from {
                    active.status = to;
                    active.updated_at_ms = now_millis();
                }
                Ok(active.clone())
            },
        )
    }

    fn edit(
        &self,
        name: &str,
        f: impl FnOnce(&mut CycleDefinition) -> Result<(), CycleError>,
    ) -> Result<(), CycleError> {
        self.store
            .try_update_json(records::CYCLES, |cycles: &mut CycleMap| {
                let definition = cycles
                    .get_mut(name)
                    .ok_or_else(|| CycleError::NotFound(name.to_string()))?;
                f(definition)
            })
    }
}
