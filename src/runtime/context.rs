use super::{bootstrap_state_root, RuntimeError, StatePaths};
use crate::archive::ArchiveInbox;
use crate::config::Settings;
use crate::cycles::CycleBook;
use crate::gate::{GateWait, ModelGate};
use crate::jobs::{JobCatalog, JobQueue};
use crate::lock::{FileLock, LockPolicy};
use crate::model::{CommandModel, ModelBackend};
use crate::schedule::ScheduleBook;
use crate::sequencer::{Dispatcher, Sequencer, SequencerOptions};
use crate::store::StateStore;
use crate::watchers::{TopicIndex, WorkItemBook};
use std::sync::Arc;

/// Everything one process needs to act on a state root, wired from settings.
#[derive(Clone)]
pub struct RuntimeContext {
    pub paths: StatePaths,
    pub settings: Settings,
    pub store: StateStore,
    pub sequencer: Arc<Sequencer>,
    pub queue: JobQueue,
    pub cycles: CycleBook,
    pub schedules: ScheduleBook,
    pub inbox: ArchiveInbox,
}

impl RuntimeContext {
    /// Creates the state layout if needed and seeds default job definitions.
    pub fn open(
        paths: StatePaths,
        settings: Settings,
        model: Arc<dyn ModelBackend>,
    ) -> Result<Self, RuntimeError> {
        bootstrap_state_root(&paths)?;
        let locks = FileLock::new(&paths, LockPolicy::from(&settings.locks));
        let store = StateStore::new(&paths, locks);
        let dispatcher = Dispatcher::new(
            &paths,
            ModelGate::new(store.clone()),
            model,
            GateWait::from(&settings.sequencer),
            settings.model.system_prompt_file.clone(),
        );
        let inbox = ArchiveInbox::new(store.clone(), settings.archive.enabled);
        let sequencer = Sequencer::new(
            store.clone(),
            dispatcher,
            inbox.clone(),
            SequencerOptions::from(&settings.sequencer),
        );
        sequencer.jobs().ensure_defaults()?;

        Ok(Self {
            queue: JobQueue::new(store.clone()),
            cycles: CycleBook::new(store.clone()),
            schedules: ScheduleBook::new(store.clone()),
            sequencer: Arc::new(sequencer),
            inbox,
            store,
            paths,
            settings,
        })
    }

    /// Same as [`RuntimeContext::open`] with the configured command-line model.
    pub fn with_command_model(paths: StatePaths, settings: Settings) -> Result<Self, RuntimeError> {
        let model = Arc::new(CommandModel::from_settings(&settings.model));
        Self::open(paths, settings, model)
    }

    pub fn gate(&self) -> &ModelGate {
        self.sequencer.dispatcher().gate()
    }

    pub fn jobs(&self) -> &JobCatalog {
        self.sequencer.jobs()
    }

    pub fn work_items(&self) -> WorkItemBook {
        WorkItemBook::new(self.store.clone())
    }

    pub fn topics(&self) -> TopicIndex {
        TopicIndex::new(self.store.clone())
    }
}
