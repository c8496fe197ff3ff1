use super::{Watcher, WatcherError, WatcherKind};
use crate::cycles::{CycleAdvancer, CyclePlan, PlannedStep};
use crate::runtime::append_runtime_log;
use crate::sequencer::{DispatchRequest, Dispatcher};
use crate::shared::time::now_millis;
use crate::store::{records, StateStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleAction {
    Dispatch(PlannedStep),
    Halt {
        cycle: String,
        activation_ms: i64,
        reason: String,
    },
    FinishOverrun {
        cycle: String,
        activation_ms: i64,
        repeat: bool,
    },
}

/// Runs the active cycle one trigger at a time, only while the model is idle.
pub struct CycleWatcher {
    store: StateStore,
    advancer: CycleAdvancer,
    dispatcher: Dispatcher,
    stop: Arc<AtomicBool>,
}

impl CycleWatcher {
    pub fn new(
        store: StateStore,
        advancer: CycleAdvancer,
        dispatcher: Dispatcher,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            advancer,
            dispatcher,
            stop,
        }
    }

    fn run_step(&self, step: PlannedStep) -> Result<(), WatcherError> {
        let transcript = self.store.read(records::TURN_RECORD)?.unwrap_or_default();
        let owner = WatcherKind::Cycle.owner();
        let label = format!("{}/{}", step.cycle, step.trigger.name);
        let stop = &self.stop;
        let output = self.dispatcher.dispatch(
            DispatchRequest {
                owner: &owner,
                label: &label,
                trigger: &step.trigger.prompt,
                instructions: None,
                transcript,
            },
            &|| stop.load(Ordering::Relaxed),
        )?;

        let line = serde_json::json!({
            "at_ms": now_millis(),
            "cycle": step.cycle,
            "step": step.step_index,
            "trigger": step.trigger.name,
            "output": output,
        });
        self.store
            .append_line(records::CYCLE_TRANSCRIPT, &line.to_string())?;

        match self.advancer.advance(&step)? {
            Some(active) => append_runtime_log(
                self.store.paths(),
                "info",
                "cycle.step_completed",
                &format!(
                    "cycle={} step={} next={} status={}",
                    step.cycle,
                    step.step_index,
                    active.current_step,
                    active.status.as_str()
                ),
            ),
            None => append_runtime_log(
                self.store.paths(),
                "info",
                "cycle.step_discarded",
                &format!(
                    "cycle={} step={} cycle changed while the step ran",
                    step.cycle, step.step_index
                ),
            ),
        }
        Ok(())
    }
}

impl Watcher for CycleWatcher {
    type Action = CycleAction;

    fn kind(&self) -> WatcherKind {
        WatcherKind::Cycle
    }

    fn poll(&mut self) -> Result<Option<CycleAction>, WatcherError> {
        Ok(match self.advancer.plan()? {
            CyclePlan::Idle => None,
            CyclePlan::Step(step) => {
                if self.dispatcher.gate().is_idle()? {
                    Some(CycleAction::Dispatch(step))
                } else {
                    None
                }
            }
            CyclePlan::Invalid {
                cycle,
                activation_ms,
            } => Some(CycleAction::Halt {
                cycle,
                activation_ms,
                reason: "cycle is missing or has no triggers".to_string(),
            }),
            CyclePlan::Overrun {
                cycle,
                activation_ms,
                repeat,
            } => Some(CycleAction::FinishOverrun {
                cycle,
                activation_ms,
                repeat,
            }),
        })
    }

    fn apply(&mut self, action: CycleAction) -> Result<(), WatcherError> {
        match action {
            CycleAction::Dispatch(step) => self.run_step(step),
            CycleAction::Halt {
                cycle,
                activation_ms,
                reason,
            } => {
                self.advancer.halt(&cycle, activation_ms, &reason)?;
                append_runtime_log(
                    self.store.paths(),
                    "warn",
                    "cycle.stopped",
                    &format!("cycle={cycle} reason={reason}"),
                );
                Ok(())
            }
            CycleAction::FinishOverrun {
                cycle,
                activation_ms,
                repeat,
            } => {
                if let Some(active) = self.advancer.finish_overrun(&cycle, activation_ms, repeat)? {
                    append_runtime_log(
                        self.store.paths(),
                        "info",
                        "cycle.wrapped",
                        &format!("cycle={cycle} status={}", active.status.as_str()),
                    );
                }
                Ok(())
            }
        }
    }
}
