//! Integration tests for configuration resolution.
//!
//! Covers the four-level precedence chain (CLI > env > file > default),
//! template generation on first run, and the overwrite refusal.

use std::sync::Mutex;

use provision::config::{write_template, DEFAULT_APP_PORT};
use provision::{ConfigOverrides, EffectiveConfig};
use tempfile::TempDir;

// Environment variables are process-global; resolution tests that touch
// them must not interleave.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn file_overrides(dir: &TempDir, content: &str) -> ConfigOverrides {
    let path = dir.path().join("provision.conf");
    std::fs::write(&path, content).unwrap();
    ConfigOverrides {
        config_path: Some(path),
        ..Default::default()
    }
}

#[test]
fn precedence_peels_one_level_at_a_time() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = TempDir::new().unwrap();
    let work_dir = dir.path().join("work");
    let config_line = format!("WORK_DIR={}\nAPP_PORT=9100\n", work_dir.display());

    // All four levels set: CLI wins.
    std::env::set_var("APP_PORT", "9200");
    let mut cli = file_overrides(&dir, &config_line);
    cli.app_port = Some(9300);
    let resolved = EffectiveConfig::resolve(cli).unwrap();
    assert_eq!(resolved.app_port, 9300);

    // Drop the CLI value: env wins.
    let resolved = EffectiveConfig::resolve(file_overrides(&dir, &config_line)).unwrap();
    assert_eq!(resolved.app_port, 9200);

    // Drop the env value: file wins.
    std::env::remove_var("APP_PORT");
    let resolved = EffectiveConfig::resolve(file_overrides(&dir, &config_line)).unwrap();
    assert_eq!(resolved.app_port, 9100);

    // Drop the file value: built-in default.
    let resolved =
        EffectiveConfig::resolve(file_overrides(&dir, &format!("WORK_DIR={}\n", work_dir.display())))
            .unwrap();
    assert_eq!(resolved.app_port, DEFAULT_APP_PORT);
}

#[test]
fn file_values_expand_earlier_keys() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = TempDir::new().unwrap();
    let content = format!(
        "WORK_DIR={}\nINSTALL_DIR=${{WORK_DIR}}/engine\n",
        dir.path().display()
    );
    let resolved = EffectiveConfig::resolve(file_overrides(&dir, &content)).unwrap();
    assert_eq!(resolved.install_dir, dir.path().join("engine"));
}

#[test]
fn install_dir_follows_work_dir_unless_explicit() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = TempDir::new().unwrap();
    let content = format!("WORK_DIR={}\n", dir.path().display());
    let resolved = EffectiveConfig::resolve(file_overrides(&dir, &content)).unwrap();
    assert_eq!(resolved.install_dir, dir.path().join("app"));
}

#[test]
fn template_is_written_when_no_config_exists() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = TempDir::new().unwrap();
    let absent = dir.path().join("provision.conf");
    let cli = ConfigOverrides {
        config_path: Some(absent.clone()),
        work_dir: Some(dir.path().join("work")),
        ..Default::default()
    };
    EffectiveConfig::resolve(cli).unwrap();

    let template = std::fs::read_to_string(&absent).unwrap();
    assert!(template.contains("WORK_DIR="));
    assert!(template.contains("APP_PORT="));
}

#[test]
fn dry_run_does_not_write_a_template() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = TempDir::new().unwrap();
    let absent = dir.path().join("provision.conf");
    let cli = ConfigOverrides {
        config_path: Some(absent.clone()),
        work_dir: Some(dir.path().join("work")),
        dry_run: Some(true),
        ..Default::default()
    };
    EffectiveConfig::resolve(cli).unwrap();
    assert!(!absent.exists());
}

#[test]
fn template_never_overwrites_an_existing_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("provision.conf");
    std::fs::write(&path, "APP_PORT=9999\n").unwrap();
    assert!(write_template(&path).is_err());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "APP_PORT=9999\n");
}

#[test]
fn work_dir_under_a_file_is_a_fatal_config_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    for dry_run in [false, true] {
        let cli = ConfigOverrides {
            config_path: Some(dir.path().join("absent.conf")),
            work_dir: Some(blocker.join("work")),
            dry_run: Some(dry_run),
            ..Default::default()
        };
        let result = EffectiveConfig::resolve(cli);
        assert!(result.is_err(), "dry_run={} should still fail", dry_run);
    }
}
