use crate::gate::{GateError, GateWait, ModelGate};
use crate::model::{load_system_prompt, ModelBackend, ModelContext, ModelError};
use crate::runtime::{append_runtime_log, StatePaths};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

impl DispatchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Gate(GateError::Cancelled))
    }
}

#[derive(Debug, Clone)]
pub struct DispatchRequest<'a> {
    /// Recorded as the gate owner, e.g. `sequencer` or `watcher:cycle`.
    pub owner: &'a str,
    /// Job or cycle step name, used for the busy flag and logs.
    pub label: &'a str,
    /// Text handed to the model as the trigger.
    pub trigger: &'a str,
    pub instructions: Option<String>,
    pub transcript: String,
}

/// The only path to the model: claim the gate, generate, release.
#[derive(Clone)]
pub struct Dispatcher {
    gate: ModelGate,
    model: Arc<dyn ModelBackend>,
    wait: GateWait,
    system_prompt_file: Option<PathBuf>,
    paths: StatePaths,
}

impl Dispatcher {
    pub fn new(
        paths: &StatePaths,
        gate: ModelGate,
        model: Arc<dyn ModelBackend>,
        wait: GateWait,
        system_prompt_file: Option<PathBuf>,
    ) -> Self {
        Self {
            gate,
            model,
            wait,
            system_prompt_file,
            paths: paths.clone(),
        }
    }

    pub fn gate(&self) -> &ModelGate {
        &self.gate
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn dispatch(
        &self,
        request: DispatchRequest<'_>,
        should_stop: &dyn Fn() -> bool,
    ) -> Result<String, DispatchError> {
        let claim = self
            .gate
            .claim(request.owner, request.label, self.wait, should_stop)?;
        let context = ModelContext {
            system_prompt: load_system_prompt(self.system_prompt_file.as_deref())?,
            instructions: request.instructions,
            transcript: request.transcript,
        };

        let started = Instant::now();
        let generated = self.model.generate(&context, request.trigger);
        let released = claim.release();
        let elapsed_ms = started.elapsed().as_millis();

        match &generated {
            Ok(output) => append_runtime_log(
                &self.paths,
                "info",
                "model.dispatch.ok",
                &format!(
                    "owner={} label={} elapsed_ms={elapsed_ms} chars={}",
                    request.owner,
                    request.label,
                    output.chars().count()
                ),
            ),
            Err(err) => append_runtime_log(
                &self.paths,
                "error",
                "model.dispatch.failed",
                &format!(
                    "owner={} label={} elapsed_ms={elapsed_ms} error={err}",
                    request.owner, request.label
                ),
            ),
        }

        // The claim retries on drop as well; a failed reset must not discard the output.
        if let Err(err) = released {
            append_runtime_log(
                &self.paths,
                "error",
                "model.dispatch.release_failed",
                &format!("owner={} label={} error={err}", request.owner, request.label),
            );
        }
        Ok(generated?)
    }
}
