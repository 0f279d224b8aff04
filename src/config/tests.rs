#![cfg(test)]

use std::path::Path;

use crate::config::config::{Config, ConfigError};

/// Parse a TOML string into a `Config` and run the project's validation logic.
fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let cfg: Config = toml::from_str(toml_str)?;
    cfg.validate()?;
    Ok(cfg)
}

#[test]
fn test_basic_config() {
    let toml = r#"
        [node]
        ae_title = "QR_SCP"
        port = 4242
        enable_get = true
        allow_shutdown = true

        [logging]
        level = "debug"

        [storage]
        path = "/var/lib/dimse"

        [remotes.pacs]
        ae_title = "PACS"
        host = "10.0.0.5"
        port = 104
        connect_timeout_ms = 5000
    "#;

    let config = load_config_from_str(toml).expect("Configuration should parse and validate");

    assert_eq!(config.node.ae_title, "QR_SCP");
    assert_eq!(config.node.port, 4242);
    assert!(config.node.enable_get);
    assert!(config.node.allow_shutdown);
    // defaults still apply inside [node]
    assert_eq!(config.node.max_pdu, 16384);
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.storage.path, Path::new("/var/lib/dimse"));

    let pacs = config.remote("pacs").unwrap();
    assert_eq!(pacs.ae_title, "PACS");
    assert_eq!(pacs.connect_timeout_ms, Some(5000));
    assert!(matches!(config.remote("missing"), Err(ConfigError::UnknownRemote(_))));
}

#[test]
fn test_empty_config_uses_defaults() {
    let config = load_config_from_str("").expect("defaults are valid");
    assert_eq!(config.node.ae_title, "DIMSE_NODE");
    assert_eq!(config.logging.level, "info");
    assert!(config.remotes.is_empty());
}

#[test]
fn test_invalid_node_rejected() {
    let toml = r#"
        [node]
        ae_title = "THIS_TITLE_IS_TOO_LONG"
    "#;
    assert!(matches!(load_config_from_str(toml), Err(ConfigError::InvalidNode(_))));
}

#[test]
fn test_invalid_remote_rejected() {
    let toml = r#"
        [remotes.broken]
        ae_title = "PACS"
        host = ""
        port = 104
    "#;
    match load_config_from_str(toml) {
        Err(ConfigError::InvalidRemote { name, .. }) => assert_eq!(name, "broken"),
        other => panic!("expected InvalidRemote, got {:?}", other),
    }
}

#[test]
fn test_log_file_required_when_enabled() {
    let toml = r#"
        [logging]
        log_to_file = true
    "#;
    assert!(matches!(load_config_from_str(toml), Err(ConfigError::MissingLogFilePath)));
}
