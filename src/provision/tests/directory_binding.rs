//! Integration tests for directory binding.
//!
//! Covers the exactly-one-of invariant, backup-before-overwrite, direct
//! symlink replacement, local fallback, and dry-run behavior.

#![cfg(unix)]

use std::path::Path;

use provision::{BindingTarget, DirectoryBinder};
use tempfile::TempDir;

fn is_symlink(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

fn is_real_dir(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_dir())
        .unwrap_or(false)
}

#[test]
fn external_subpath_becomes_symlink_local_fallback_otherwise() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("app");
    let mount = tmp.path().join("mount");
    // Only one of the two subpaths exists on the mount.
    std::fs::create_dir_all(mount.join("models/checkpoints")).unwrap();

    let binder = DirectoryBinder::new(root.clone(), Some(mount.clone()), false);
    let bindings = binder
        .bind_directories(&["models/checkpoints", "models/vae"])
        .unwrap();

    // Exactly one of {symlink, local dir} at every canonical path.
    for binding in &bindings {
        let symlinked = is_symlink(&binding.canonical_path);
        let local = is_real_dir(&binding.canonical_path);
        assert!(
            symlinked ^ local,
            "{} must be exactly one of symlink/local dir",
            binding.canonical_path.display()
        );
    }

    assert_eq!(
        bindings[0].target,
        BindingTarget::Symlink(mount.join("models/checkpoints"))
    );
    assert!(is_symlink(&root.join("models/checkpoints")));
    assert_eq!(bindings[1].target, BindingTarget::LocalDir);
    assert!(is_real_dir(&root.join("models/vae")));
}

#[test]
fn existing_directory_is_backed_up_before_linking() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("app");
    let mount = tmp.path().join("mount");
    std::fs::create_dir_all(mount.join("models/loras")).unwrap();

    // A real directory with data already sits at the canonical path.
    let canonical = root.join("models/loras");
    std::fs::create_dir_all(&canonical).unwrap();
    std::fs::write(canonical.join("precious.safetensors"), b"weights").unwrap();

    let binder = DirectoryBinder::new(root.clone(), Some(mount), false);
    binder.bind_directories(&["models/loras"]).unwrap();

    assert!(is_symlink(&canonical));

    // The original contents survive under a backup name next to it.
    let backups: Vec<_> = std::fs::read_dir(root.join("models"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("loras.bak."))
        .collect();
    assert_eq!(backups.len(), 1);
    let rescued = backups[0].path().join("precious.safetensors");
    assert_eq!(std::fs::read(rescued).unwrap(), b"weights");
}

#[test]
fn existing_symlink_is_replaced_without_backup() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("app");
    let old_mount = tmp.path().join("old-mount");
    let new_mount = tmp.path().join("new-mount");
    std::fs::create_dir_all(old_mount.join("output")).unwrap();
    std::fs::create_dir_all(new_mount.join("output")).unwrap();

    let canonical = root.join("output");
    std::fs::create_dir_all(&root).unwrap();
    std::os::unix::fs::symlink(old_mount.join("output"), &canonical).unwrap();

    let binder = DirectoryBinder::new(root.clone(), Some(new_mount.clone()), false);
    binder.bind_directories(&["output"]).unwrap();

    assert_eq!(
        std::fs::read_link(&canonical).unwrap(),
        new_mount.join("output")
    );

    // A symlink carries no data, so no backup should appear.
    let backups = std::fs::read_dir(&root)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".bak."))
        .count();
    assert_eq!(backups, 0);
}

#[test]
fn missing_external_mount_is_not_an_error() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("app");

    let binder = DirectoryBinder::new(root.clone(), Some(tmp.path().join("nonexistent")), false);
    let bindings = binder.bind_directories(&["models/vae", "input"]).unwrap();

    for binding in &bindings {
        assert_eq!(binding.target, BindingTarget::LocalDir);
        assert!(is_real_dir(&binding.canonical_path));
    }
}

#[test]
fn dry_run_reports_bindings_without_touching_the_filesystem() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("app");
    let mount = tmp.path().join("mount");
    std::fs::create_dir_all(mount.join("models/vae")).unwrap();

    let binder = DirectoryBinder::new(root.clone(), Some(mount.clone()), true);
    let bindings = binder
        .bind_directories(&["models/vae", "output"])
        .unwrap();

    assert_eq!(
        bindings[0].target,
        BindingTarget::Symlink(mount.join("models/vae"))
    );
    assert_eq!(bindings[1].target, BindingTarget::LocalDir);
    assert!(!root.exists(), "dry-run must not create anything");
}
