pub mod app;
pub mod archive;
pub mod config;
pub mod cycles;
pub mod gate;
pub mod jobs;
pub mod lock;
pub mod model;
pub mod runtime;
pub mod schedule;
pub mod sequencer;
pub mod shared;
pub mod store;
pub mod watchers;
