pub mod command;

pub use command::CommandModel;

use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model binary `{binary}` was not found")]
    MissingBinary { binary: String },
    #[error("model `{binary}` exited with status {exit_code}: {stderr}")]
    NonZeroExit {
        binary: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("model `{binary}` timed out after {timeout_ms}ms")]
    Timeout { binary: String, timeout_ms: u64 },
    #[error("model `{binary}` produced no output")]
    EmptyOutput { binary: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("model backend failed: {0}")]
    Backend(String),
}

/// Everything a single generation request sees.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelContext {
    pub system_prompt: Option<String>,
    pub instructions: Option<String>,
    /// Current Turn Record text, or whatever conversation the caller supplies.
    pub transcript: String,
}

impl ModelContext {
    pub fn render(&self, trigger: &str) -> String {
        let mut out = String::new();
        if let Some(system) = self.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
            out.push_str("[SYSTEM]\n");
            out.push_str(system.trim_end());
            out.push_str("\n\n");
        }
        if !self.transcript.trim().is_empty() {
            out.push_str("[CONVERSATION]\n");
            out.push_str(self.transcript.trim_end());
            out.push_str("\n\n");
        }
        if let Some(instructions) = self.instructions.as_deref().filter(|s| !s.trim().is_empty()) {
            out.push_str("[INSTRUCTIONS]\n");
            out.push_str(instructions.trim_end());
            out.push_str("\n\n");
        }
        out.push_str("[TRIGGER]\n");
        out.push_str(trigger);
        out.push('\n');
        out
    }
}

/// The shared generation resource. Callers serialize access through the gate;
/// implementations need not be reentrant-safe against the model itself.
pub trait ModelBackend: Send + Sync {
    fn generate(&self, context: &ModelContext, trigger: &str) -> Result<String, ModelError>;
}

pub fn load_system_prompt(path: Option<&Path>) -> Result<Option<String>, ModelError> {
    let Some(path) = path else {
        return Ok(None);
    };
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ModelError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_orders_sections_and_skips_blank_ones() {
        let context = ModelContext {
            system_prompt: Some("be brief".to_string()),
            instructions: Some("   ".to_string()),
            transcript: "#USER_START#\nhi\n#USER_END#\n".to_string(),
        };
        let rendered = context.render("summary_job");
        assert_eq!(
            rendered,
            "[SYSTEM]\nbe brief\n\n[CONVERSATION]\n#USER_START#\nhi\n#USER_END#\n\n[TRIGGER]\nsummary_job\n"
        );
    }
}
