use jobloop::config::{load_settings, save_settings, ConfigError, Settings};
use std::fs;
use tempfile::tempdir;

#[test]
fn missing_file_loads_defaults() {
    let dir = tempdir().expect("tempdir");
    let settings = load_settings(&dir.path().join("config.yaml")).expect("defaults");
    assert_eq!(settings, Settings::default());
    assert_eq!(settings.archive.block_capacity, 50);
    assert!(settings.archive.enabled);
    assert_eq!(settings.locks.stale_after_ms, 30_000);
}

#[test]
fn partial_yaml_overrides_only_what_it_names() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("config.yaml");
    fs::write(
        &path,
        r#"
model:
  command: my-llm
  args: ["--prompt-trigger", "{trigger}"]
archive:
  block_capacity: 5
watchers:
  topic:
    enabled: false
    poll_interval_ms: 9000
"#,
    )
    .expect("write");

    let settings = load_settings(&path).expect("load");
    assert_eq!(settings.model.command, "my-llm");
    assert_eq!(settings.model.args, vec!["--prompt-trigger", "{trigger}"]);
    assert_eq!(settings.archive.block_capacity, 5);
    assert!(settings.archive.enabled);
    assert!(!settings.watchers.topic.enabled);
    assert_eq!(settings.watchers.topic.poll_interval_ms, 9000);
    assert_eq!(settings.watchers.cycle, Settings::default().watchers.cycle);
}

#[test]
fn invalid_yaml_reports_the_path() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("config.yaml");
    fs::write(&path, "archive: [unterminated").expect("write");
    let err = load_settings(&path).expect_err("parse error");
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().contains("config.yaml"));
}

#[test]
fn zero_values_fail_validation() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("config.yaml");
    fs::write(&path, "watchers:\n  verbatim:\n    poll_interval_ms: 0\n").expect("write");
    let err = load_settings(&path).expect_err("validation");
    assert!(err.to_string().contains("watchers.verbatim.poll_interval_ms"));

    let mut settings = Settings::default();
    settings.model.command = "  ".to_string();
    assert!(matches!(settings.validate(), Err(ConfigError::Settings(_))));
}

#[test]
fn saved_settings_round_trip_through_yaml() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("nested/config.yaml");
    let mut settings = Settings::default();
    settings.sequencer.turn_wait_timeout_seconds = 3;
    settings.watchers.job_queue.enabled = false;
    save_settings(&settings, &path).expect("save");
    assert_eq!(load_settings(&path).expect("load"), settings);
}
