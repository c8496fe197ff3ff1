//! Job definitions, the per-turn job sequence and the job queue.

pub mod queue;

pub use queue::{JobQueue, QueuedJob};

use crate::shared::ids::JobName;
use crate::store::{records, StateStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobDefinition {
    pub instructions: String,
    /// Text sent as the trigger when the job is dispatched; the job name when empty.
    #[serde(default)]
    pub trigger: String,
    /// Store record (under `outputs/`) that receives a copy of each output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl JobDefinition {
    pub fn trigger_text<'a>(&'a self, name: &'a str) -> &'a str {
        if self.trigger.trim().is_empty() {
            name
        } else {
            &self.trigger
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobSequence {
    #[serde(default)]
    pub jobs: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("job `{0}` is not defined")]
    Unknown(String),
    #[error("invalid job sequence: {0}")]
    InvalidSequence(String),
}

pub const DEFAULT_REPLY_JOB: &str = "reply_job";

pub fn default_jobs() -> BTreeMap<String, JobDefinition> {
    let entries = [
        (
            DEFAULT_REPLY_JOB,
            "Answer the user's latest message directly and helpfully.",
            "Respond to the user.",
        ),
        (
            "summary_job",
            "Create a concise, factual summary of the provided text. Focus on key decisions, outcomes, and open items.",
            "Summarize the previous text.",
        ),
        (
            "keyword_job",
            "Extract the main keywords from the provided text as a JSON-formatted list. Example: [\"keyword1\", \"keyword2\"]",
            "Extract keywords from the previous text.",
        ),
        (
            "reflection_job",
            "Reflect on the conversation so far. Identify key insights, contradictions, or areas for future exploration. Propose next steps if applicable.",
            "Reflect on the conversation.",
        ),
    ];
    entries
        .into_iter()
        .map(|(name, instructions, trigger)| {
            (
                name.to_string(),
                JobDefinition {
                    instructions: instructions.to_string(),
                    trigger: trigger.to_string(),
                    output: None,
                },
            )
        })
        .collect()
}

/// Renders a job's instruction prompt with `{key}` placeholders substituted.
pub fn render_job_prompt(
    name: &str,
    definition: &JobDefinition,
    args: &BTreeMap<String, String>,
) -> String {
    let mut instructions = definition.instructions.clone();
    for (key, value) in args {
        instructions = instructions.replace(&format!("{{{key}}}"), value);
    }
    format!(
        "###JOB_START: {}###\n{}\n###_END###",
        name.to_uppercase(),
        instructions
    )
}

/// Read and edit access to `jobs.json` and `job_sequence.json`. Every read goes
/// to the store, so edits from another process are seen on the next call.
#[derive(Debug, Clone)]
pub struct JobCatalog {
    store: StateStore,
}

impl JobCatalog {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Seeds the default jobs and a one-job sequence when neither file exists.
    pub fn ensure_defaults(&self) -> Result<bool, JobError> {
        let mut seeded = false;
        if !self.store.exists(records::JOBS)? {
            self.store.write_json(records::JOBS, &default_jobs())?;
            seeded = true;
        }
        if !self.store.exists(records::JOB_SEQUENCE)? {
            self.store.write_json(
                records::JOB_SEQUENCE,
                &JobSequence {
                    jobs: vec![DEFAULT_REPLY_JOB.to_string()],
                },
            )?;
            seeded = true;
        }
        Ok(seeded)
    }

    pub fn load_all(&self) -> Result<BTreeMap<String, JobDefinition>, JobError> {
        Ok(self
            .store
            .read_json::<BTreeMap<String, JobDefinition>>(records::JOBS)?
            .unwrap_or_default())
    }

    pub fn get(&self, name: &str) -> Result<Option<JobDefinition>, JobError> {
        Ok(self.load_all()?.remove(name))
    }

    pub fn save(&self, name: &JobName, definition: JobDefinition) -> Result<(), JobError> {
        self.store.update_json(
            records::JOBS,
            |jobs: &mut BTreeMap<String, JobDefinition>| {
                jobs.insert(name.to_string(), definition);
            },
        )?;
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<bool, JobError> {
        Ok(self.store.update_json(
            records::JOBS,
            |jobs: &mut BTreeMap<String, JobDefinition>| jobs.remove(name).is_some(),
        )?)
    }

    pub fn load_sequence(&self) -> Result<Vec<String>, JobError> {
        Ok(self
            .store
            .read_json::<JobSequence>(records::JOB_SEQUENCE)?
            .unwrap_or_default()
            .jobs)
    }

    /// Replaces the sequence. Names must be defined and unique.
    pub fn save_sequence(&self, jobs: &[String]) -> Result<(), JobError> {
        let defined = self.load_all()?;
        let mut seen = std::collections::BTreeSet::new();
        for name in jobs {
            if !defined.contains_key(name) {
                return Err(JobError::Unknown(name.clone()));
            }
            if !seen.insert(name.as_str()) {
                return Err(JobError::InvalidSequence(format!(
                    "trigger `{name}` appears more than once"
                )));
            }
        }
        self.store.write_json(
            records::JOB_SEQUENCE,
            &JobSequence {
                jobs: jobs.to_vec(),
            },
        )?;
        Ok(())
    }
}
