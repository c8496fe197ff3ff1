pub mod error;
pub mod load;
pub mod paths;
pub mod save;
pub mod settings;

pub use error::ConfigError;
pub use load::{load_global_settings, load_settings};
pub use paths::{
    default_global_config_path, default_state_root, GLOBAL_SETTINGS_FILE_NAME, GLOBAL_STATE_DIR,
    STATE_ROOT_ENV,
};
pub use save::save_settings;
pub use settings::{
    ArchiveSettings, LockSettings, ModelSettings, SequencerSettings, Settings, WatcherConfig,
    WatcherSettings,
};
