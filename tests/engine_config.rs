//! Integration tests for loading engine configuration from disk

mod common;

use braid::{EngineConfig, ProcessEngine};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_engine_runs_with_loaded_config() -> anyhow::Result<()> {
    common::init_tracing();
    let temp = TempDir::new()?;
    let path = temp.path().join("engine.json");
    fs::write(&path, r#"{ "name": "orders", "operation_limit": 0 }"#)?;

    let config = EngineConfig::load(&path)?;
    assert_eq!(config.name, "orders");
    assert_eq!(config.operation_limit, 0);
    // missing keys fall back to defaults
    assert!(!config.trace_operations);

    let engine = ProcessEngine::new(config.clone())?;
    assert_eq!(engine.config(), &config);
    Ok(())
}

#[test]
fn test_saved_config_survives_reload() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let path = temp.path().join("nested/dir/engine.json");
    let config = EngineConfig {
        name: "audit".to_string(),
        operation_limit: 42,
        trace_operations: true,
    };

    config.save(&path)?;
    assert!(!path.with_extension("tmp").exists());
    assert_eq!(EngineConfig::load(&path)?, config);
    Ok(())
}

#[test]
fn test_blank_name_is_rejected_on_load() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let path = temp.path().join("engine.json");
    fs::write(&path, r#"{ "name": "   " }"#)?;

    let err = EngineConfig::load(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("engine name must not be empty"));
    Ok(())
}
