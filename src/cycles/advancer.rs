use super::{ActiveCycle, CycleError, CycleMap, CycleStatus, CycleTrigger};
use crate::shared::time::now_millis;
use crate::store::{records, StateStore};

/// A step chosen from one snapshot of the active cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub cycle: String,
    pub activation_ms: i64,
    pub step_index: usize,
    pub total_steps: usize,
    pub repeat: bool,
    pub trigger: CycleTrigger,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CyclePlan {
    /// Nothing is running.
    Idle,
    Step(PlannedStep),
    /// The running cycle is missing or has no triggers; it must be stopped.
    Invalid { cycle: String, activation_ms: i64 },
    /// The index ran past the end, e.g. after triggers were deleted.
    Overrun {
        cycle: String,
        activation_ms: i64,
        repeat: bool,
    },
}

/// The only writer of `current_step`.
#[derive(Debug, Clone)]
pub struct CycleAdvancer {
    store: StateStore,
}

impl CycleAdvancer {
    pub(super) fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn plan(&self) -> Result<CyclePlan, CycleError> {
        let Some(active) = self.store.read_json::<ActiveCycle>(records::ACTIVE_CYCLE)? else {
            return Ok(CyclePlan::Idle);
        };
        if active.status != CycleStatus::Running {
            return Ok(CyclePlan::Idle);
        }
        let definition = self
            .store
            .read_json::<CycleMap>(records::CYCLES)?
            .unwrap_or_default()
            .remove(&active.name);
        let Some(definition) = definition.filter(|cycle| !cycle.triggers.is_empty()) else {
            return Ok(CyclePlan::Invalid {
                cycle: active.name,
                activation_ms: active.started_at_ms,
            });
        };
        let Some(trigger) = definition.triggers.get(active.current_step).cloned() else {
            return Ok(CyclePlan::Overrun {
                cycle: active.name,
                activation_ms: active.started_at_ms,
                repeat: definition.repeat,
            });
        };
        Ok(CyclePlan::Step(PlannedStep {
            cycle: active.name,
            activation_ms: active.started_at_ms,
            step_index: active.current_step,
            total_steps: definition.triggers.len(),
            repeat: definition.repeat,
            trigger,
        }))
    }

    /// Moves past `step` if the active cycle is still exactly where the step
    /// was planned. Returns the updated record, or `None` when the cycle was
    /// stopped, restarted or advanced by someone else in the meantime.
    pub fn advance(&self, step: &PlannedStep) -> Result<Option<ActiveCycle>, CycleError> {
        self.update_matching(&step.cycle, step.activation_ms, |active| {
            if active.current_step != step.step_index {
                return false;
            }
            let next = step.step_index + 1;
            if next < step.total_steps {
                active.current_step = next;
            } else {
                wrap_or_complete(active, step.total_steps, step.repeat);
            }
            true
        })
    }

    /// Resolves an index past the end: wrap to the first step or complete.
    pub fn finish_overrun(
        &self,
        cycle: &str,
        activation_ms: i64,
        repeat: bool,
    ) -> Result<Option<ActiveCycle>, CycleError> {
        self.update_matching(cycle, activation_ms, |active| {
            let end = active.current_step;
            wrap_or_complete(active, end, repeat);
            true
        })
    }

    /// Stops the running cycle, recording why.
    pub fn halt(
        &self,
        cycle: &str,
        activation_ms: i64,
        reason: &str,
    ) -> Result<Option<ActiveCycle>, CycleError> {
        self.update_matching(cycle, activation_ms, |active| {
            active.status = CycleStatus::Stopped;
            active.last_error = Some(reason.to_string());
            true
        })
    }

    fn update_matching(
        &self,
        cycle: &str,
        activation_ms: i64,
        f: impl FnOnce(&mut ActiveCycle) -> bool,
    ) -> Result<Option<ActiveCycle>, CycleError> {
        Ok(self.store.update_json(
            records::ACTIVE_CYCLE,
            |active: &mut Option<ActiveCycle>| {
                let active = active.as_mut()?;
                let matches = active.name == cycle
                    && active.started_at_ms == activation_ms
                    && active.status == CycleStatus::Running;
                if !matches || !f(active) {
                    return None;
                }
                active.updated_at_ms = now_millis();
                Some(active.clone())
            },
        )?)
    }
}

fn wrap_or_complete(active: &mut ActiveCycle, end: usize, repeat: bool) {
    if repeat {
        active.current_step = 0;
        active.rounds += 1;
    } else {
        active.current_step = end;
        active.status = CycleStatus::Complete;
    }
}
