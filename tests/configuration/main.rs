//! Configuration integration tests
//!
//! `stead.toml` files loaded from disk drive factory and broker behavior.

#[path = "../common/mod.rs"]
mod common;

use common::*;
use stead::kernel::{DetachMode, CONFIG_FILE_NAME};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn write_config(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join(CONFIG_FILE_NAME);
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_default_file_loads_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, KernelConfig::default_toml());
    assert_eq!(KernelConfig::from_file(&path).unwrap(), KernelConfig::default());
}

#[test]
fn test_partial_file_overrides_only_named_keys() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
retain_state = false

[detach]
state = "all"

[inverse]
enabled = true
action = "warn"
"#,
    );
    let config = KernelConfig::from_file(&path).unwrap();
    assert!(!config.retain_state);
    assert!(config.optimistic);
    assert_eq!(config.detach.state, DetachMode::All);
    assert!(config.inverse.enabled);
    assert_eq!(config.inverse.action, InverseAction::Warn);
    assert!(config.compatibility.copy_on_detach);
}

#[test]
fn test_saved_config_reloads_identically() {
    let dir = TempDir::new().unwrap();
    let mut config = KernelConfig::default();
    config.callbacks.fail_fast = true;
    config.fetch_groups.push("summary".to_string());
    let path = write_config(&dir, &config.to_toml_string().unwrap());
    assert_eq!(KernelConfig::from_file(&path).unwrap(), config);
}

#[test]
fn test_bad_files_are_config_errors() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[detach]\nstate = \"sometimes\"\n");
    assert!(matches!(
        KernelConfig::from_file(&path),
        Err(SteadError::Config(_))
    ));
    assert!(matches!(
        KernelConfig::from_file(&dir.path().join("missing.toml")),
        Err(SteadError::Config(_))
    ));
}

#[test]
fn test_file_config_drives_in_place_detach() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[compatibility]\ncopy_on_detach = false\n");
    let mut b = factory(KernelConfig::from_file(&path).unwrap())
        .new_broker()
        .unwrap();
    let p = committed_person(&mut b, 1, "Ann", 30);
    assert_eq!(b.detach(p, None).unwrap(), p);
    assert!(!b.is_managed(p));
    assert!(b.is_detached(p).unwrap());
}

#[test]
fn test_file_config_drives_commit_state() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "retain_state = false\n");
    let mut b = factory(KernelConfig::from_file(&path).unwrap())
        .new_broker()
        .unwrap();
    let p = committed_person(&mut b, 1, "Ann", 30);
    assert_eq!(b.state(p).unwrap(), Some(PCState::Hollow));
}

#[test]
fn test_factory_config_is_frozen_after_first_broker() {
    let f = factory(KernelConfig::default());
    f.configure(|c| c.inverse.enabled = true).unwrap();
    let b = f.new_broker().unwrap();
    assert!(b.config().inverse.enabled);
    assert!(matches!(
        f.configure(|c| c.inverse.enabled = false),
        Err(SteadError::InvalidState { .. })
    ));
    assert!(f.config().inverse.enabled);
}
