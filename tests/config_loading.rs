// tests/config_loading.rs

use std::io::Write;
use std::time::Duration;

use serde_json::json;
use tempfile::NamedTempFile;

use workforce::config::{
    load_and_validate, load_from_path, parse_str, ConfigFile, HandlerSection, TasksSection,
};
use workforce::errors::WorkforceError;
use workforce::handler::HandlerOptions;
use workforce::task::TaskFactory;
use workforce::types::LogLevel;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

#[test]
fn full_config_is_loaded() {
    let file = config_file(
        r#"
[handler]
channel_capacity = 8
terminate_timeout_secs = 2.5
shutdown_timeout_secs = 10

[tasks]
default_timeout_secs = 30.0

[logging]
level = "debug"
"#,
    );

    let config = load_and_validate(file.path()).unwrap();
    assert_eq!(config.handler().channel_capacity, 8);
    assert_eq!(
        config.handler().terminate_timeout(),
        Some(Duration::from_millis(2500))
    );
    assert_eq!(config.handler().shutdown_timeout(), Some(Duration::from_secs(10)));
    assert_eq!(config.tasks().default_timeout(), Some(Duration::from_secs(30)));
    assert_eq!(config.logging().level, Some(LogLevel::Debug));

    let options = HandlerOptions::from(&config);
    assert_eq!(options.channel_capacity, 8);
    assert_eq!(options.terminate_timeout, Some(Duration::from_millis(2500)));
    assert_eq!(options.shutdown_timeout, Some(Duration::from_secs(10)));
}

#[test]
fn empty_config_uses_defaults() {
    let file = config_file("");
    let config = load_and_validate(file.path()).unwrap();

    assert_eq!(HandlerOptions::from(&config), HandlerOptions::default());
    assert_eq!(config.tasks().default_timeout(), None);
    assert_eq!(config.logging().level, None);
}

#[test]
fn zero_channel_capacity_is_rejected() {
    let file = config_file("[handler]\nchannel_capacity = 0\n");

    match load_and_validate(file.path()) {
        Err(WorkforceError::ConfigError(msg)) => assert!(msg.contains("channel_capacity")),
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn non_positive_deadlines_are_rejected() {
    for (section, field, value) in [
        ("handler", "terminate_timeout_secs", "0"),
        ("handler", "shutdown_timeout_secs", "-1.5"),
        ("tasks", "default_timeout_secs", "nan"),
    ] {
        let file = config_file(&format!("[{section}]\n{field} = {value}\n"));
        match load_and_validate(file.path()) {
            Err(WorkforceError::ConfigError(msg)) => assert!(msg.contains(field), "{msg}"),
            Err(e) => panic!("Expected ConfigError for {field}, got: {:?}", e),
            Ok(_) => panic!("Expected error for {field}, got Ok"),
        }
    }
}

#[test]
fn raw_loading_skips_validation() {
    let file = config_file("[handler]\nchannel_capacity = 0\n");
    let raw = load_from_path(file.path()).unwrap();
    assert_eq!(raw.handler.channel_capacity, 0);
    assert!(ConfigFile::try_from(raw).is_err());
}

#[test]
fn partial_sections_keep_the_other_defaults() {
    let raw = parse_str("[handler]\nshutdown_timeout_secs = 3\n").unwrap();
    assert_eq!(raw.handler.channel_capacity, 64);
    assert_eq!(raw.handler.terminate_timeout(), None);
    assert_eq!(raw.handler.shutdown_timeout(), Some(Duration::from_secs(3)));
}

#[test]
fn unvalidated_sections_never_yield_a_bad_deadline() {
    let handler = HandlerSection {
        terminate_timeout_secs: Some(-1.0),
        shutdown_timeout_secs: Some(f64::NAN),
        ..HandlerSection::default()
    };
    assert_eq!(handler.terminate_timeout(), None);
    assert_eq!(handler.shutdown_timeout(), None);

    let tasks = TasksSection {
        default_timeout_secs: Some(f64::INFINITY),
    };
    assert_eq!(tasks.default_timeout(), None);
}

#[test]
fn default_config_converts_into_default_options() {
    assert_eq!(
        HandlerOptions::from(&ConfigFile::default()),
        HandlerOptions::default()
    );
}

#[test]
fn malformed_toml_is_a_toml_error() {
    let file = config_file("[handler\nchannel_capacity = ");
    assert!(matches!(
        load_and_validate(file.path()),
        Err(WorkforceError::TomlError(_))
    ));
}

#[test]
fn unknown_log_level_is_a_toml_error() {
    let file = config_file("[logging]\nlevel = \"loud\"\n");
    assert!(matches!(
        load_and_validate(file.path()),
        Err(WorkforceError::TomlError(_))
    ));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        load_and_validate(dir.path().join("Workforce.toml")),
        Err(WorkforceError::IoError(_))
    ));
}

#[test]
fn factory_applies_the_configured_task_timeout() {
    let file = config_file("[tasks]\ndefault_timeout_secs = 4\n");
    let config = load_and_validate(file.path()).unwrap();

    let mut factory = TaskFactory::from_config(&config);
    let task = factory
        .new_task("f", json!([]), json!({}), 0, None, None)
        .unwrap();
    assert_eq!(task.timeout(), Some(Duration::from_secs(4)));
}

#[tokio::test]
async fn start_from_path_wires_handler_and_factory() {
    let file = config_file("[tasks]\ndefault_timeout_secs = 1\n\n[logging]\nlevel = \"warn\"\n");

    let (handler, mut factory) = workforce::start_from_path(file.path()).unwrap();
    assert!(handler.is_running().await.unwrap());
    assert!(handler.roster(None).await.unwrap().is_empty());

    let task = factory
        .new_task("f", json!([1]), json!({}), 0, Some("s".into()), None)
        .unwrap();
    assert_eq!(task.timeout(), Some(Duration::from_secs(1)));
}
