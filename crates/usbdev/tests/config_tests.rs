//! Configuration file tests
//!
//! Run with: `cargo test -p usbdev --test config_tests`

use common::UsbId;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;
use usbdev::config::{DriverConfig, load_config};
use usbdev::{ControllerSettings, EventSender, HotplugController, Minor};

#[test]
fn test_save_and_load_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("driver.toml");

    let mut config = DriverConfig::default();
    config.usb.id_table.push("1d6b:0104".to_string());
    config.transfer.read_timeout_ms = 2_500;
    config.save(&path).unwrap();

    let loaded = DriverConfig::load(Some(path)).unwrap();
    assert_eq!(loaded.usb.id_table, config.usb.id_table);
    assert_eq!(loaded.transfer.read_timeout(), Duration::from_millis(2_500));
    assert!(loaded.usb.ids().unwrap().matches(UsbId::new(0x1d6b, 0x0104)));
}

#[test]
fn test_partial_file_keeps_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("driver.toml");
    fs::write(
        &path,
        r#"
[usb]
minor_base = 64
max_minors = 4
"#,
    )
    .unwrap();

    let config = load_config(path.to_str().unwrap()).unwrap();
    assert_eq!(config.usb.minor_base, 64);
    assert_eq!(config.usb.max_minors, 4);
    assert_eq!(config.usb.id_table, vec!["0781:5567".to_string()]);
    assert_eq!(config.transfer.write_queue_depth, 64);
    assert_eq!(config.driver.log_level, "info");
}

#[test]
fn test_invalid_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("driver.toml");
    fs::write(&path, "[usb]\nid_table = [\"not-an-id\"]\n").unwrap();

    let err = DriverConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", err).contains("not-an-id"));
}

#[test]
fn test_malformed_toml_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("driver.toml");
    fs::write(&path, "[transfer\nread_timeout_ms = ").unwrap();

    assert!(DriverConfig::load(Some(path)).is_err());
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    assert!(DriverConfig::load(Some(dir.path().join("absent.toml"))).is_err());
}

#[test]
fn test_controller_uses_configured_minor_range() {
    let mut config = DriverConfig::default();
    config.usb.minor_base = 32;
    config.usb.max_minors = 1;
    config.transfer.read_timeout_ms = 50;

    let settings = ControllerSettings::from(&config);
    assert_eq!(settings.read_timeout, Duration::from_millis(50));

    let ctl = HotplugController::new(settings, EventSender::discarding());
    let iface = usbdev::test_utils::LoopbackInterface::builder()
        .bulk_pair(64)
        .build();
    assert_eq!(ctl.on_attach(iface).unwrap(), Minor(32));
}
