use printlink_settings::{Config, SettingsError};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

fn custom_config() -> Config {
    let mut config = Config::default();
    config.serial.port = "/dev/ttyUSB1".to_string();
    config.serial.baud_rate = 250_000;
    config.queue.failure_gcodes = vec!["M117 Link lost".to_string()];
    config.planner.heap_ratio = 0.9;
    config.planner.threshold_file = Some(PathBuf::from("/var/lib/printlink/threshold.data"));
    config.watchdog.timeout_secs = 40;
    config.recovery.boot_grace_period_secs = 12;
    config
}

#[test]
fn test_toml_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let config = custom_config();
    config.save_to_file(&path).unwrap();
    let loaded = Config::load_from_file(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_json_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");

    let config = custom_config();
    config.save_to_file(&path).unwrap();
    assert_eq!(Config::load_from_file(&path).unwrap(), config);
}

#[test]
fn test_unsupported_extension() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");
    let err = Config::default().save_to_file(&path).unwrap_err();
    assert!(matches!(err, SettingsError::UnsupportedFormat(ext) if ext == "yaml"));
}

#[test]
fn test_missing_file_loads_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.toml");
    assert_eq!(Config::load_or_default(&path).unwrap(), Config::default());
    assert!(matches!(
        Config::load_from_file(&path),
        Err(SettingsError::LoadError { .. })
    ));
}

#[test]
fn test_invalid_values_are_rejected_on_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[planner]\nheap_ratio = 1.5\n").unwrap();

    let err = Config::load_from_file(&path).unwrap_err();
    assert!(matches!(err, SettingsError::InvalidSetting { ref key, .. } if key == "planner.heap_ratio"));
}

#[test]
fn test_malformed_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
        Config::load_from_file(&path),
        Err(SettingsError::JsonError(_))
    ));
}

#[test]
fn test_link_config_conversion() {
    let link = custom_config().link_config();
    assert_eq!(link.serial.port, "/dev/ttyUSB1");
    assert_eq!(link.serial.baud_rate, 250_000);
    assert_eq!(link.queue.failure_gcodes, vec!["M117 Link lost".to_string()]);
    assert_eq!(link.queue.planner.heap_ratio, 0.9);
    assert_eq!(
        link.queue.planner.threshold_path,
        Some(PathBuf::from("/var/lib/printlink/threshold.data"))
    );
    assert_eq!(link.watchdog.timeout, Duration::from_secs(40));
    assert_eq!(link.recovery.boot_grace_period, Duration::from_secs(12));
}
