//! Directory and symlink management for the provisioned tree.
//!
//! When a fast external mount is present, model and output directories are
//! redirected there via symlinks so the same tree works with and without
//! shared storage. Pre-existing real directories are renamed to a
//! timestamped backup before a symlink replaces them; data is never deleted
//! silently.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::provisioner::ProvisionError;

/// Subpaths of the install tree that hold models, plugins, and run output.
/// These are the directories worth redirecting to shared storage.
pub const MANAGED_SUBPATHS: &[&str] = &[
    "models/checkpoints",
    "models/clip",
    "models/controlnet",
    "models/loras",
    "models/upscale_models",
    "models/vae",
    "custom_nodes",
    "input",
    "output",
];

/// Where a canonical subpath ended up after binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingTarget {
    /// Symlink into the external mount.
    Symlink(PathBuf),
    /// Plain local directory, no external mount available.
    LocalDir,
}

/// One resolved directory binding.
#[derive(Debug, Clone)]
pub struct DirectoryBinding {
    pub subpath: String,
    pub canonical_path: PathBuf,
    pub target: BindingTarget,
}

/// Binds canonical subpaths to the external mount or local directories.
pub struct DirectoryBinder {
    canonical_root: PathBuf,
    external_mount: Option<PathBuf>,
    dry_run: bool,
}

impl DirectoryBinder {
    pub fn new(canonical_root: PathBuf, external_mount: Option<PathBuf>, dry_run: bool) -> Self {
        Self {
            canonical_root,
            external_mount,
            dry_run,
        }
    }

    /// Bind every subpath. After this returns Ok, exactly one of
    /// {symlink to external mount, local directory} exists at each
    /// canonical path. Permission errors are fatal; a missing external
    /// directory for an individual subpath is not.
    pub fn bind_directories(
        &self,
        subpaths: &[&str],
    ) -> Result<Vec<DirectoryBinding>, ProvisionError> {
        let mut bindings = Vec::with_capacity(subpaths.len());
        for subpath in subpaths {
            bindings.push(self.bind_one(subpath)?);
        }
        Ok(bindings)
    }

    fn bind_one(&self, subpath: &str) -> Result<DirectoryBinding, ProvisionError> {
        let canonical = self.canonical_root.join(subpath);
        let external = self
            .external_mount
            .as_ref()
            .map(|mount| mount.join(subpath))
            .filter(|dir| dir.is_dir());

        match external {
            Some(external_dir) => {
                if self.dry_run {
                    tracing::info!(
                        "[Directories] dry-run: would link {} -> {}",
                        canonical.display(),
                        external_dir.display()
                    );
                } else {
                    self.link_to_external(&canonical, &external_dir)?;
                }
                Ok(DirectoryBinding {
                    subpath: subpath.to_string(),
                    canonical_path: canonical,
                    target: BindingTarget::Symlink(external_dir),
                })
            }
            None => {
                if self.dry_run {
                    tracing::info!(
                        "[Directories] dry-run: would create local dir {}",
                        canonical.display()
                    );
                } else {
                    ensure_local_dir(&canonical)?;
                }
                Ok(DirectoryBinding {
                    subpath: subpath.to_string(),
                    canonical_path: canonical,
                    target: BindingTarget::LocalDir,
                })
            }
        }
    }

    /// Replace whatever sits at `canonical` with a symlink to
    /// `external_dir`. A real directory is renamed to a timestamped backup
    /// first; an existing symlink carries no data and is replaced directly.
    fn link_to_external(
        &self,
        canonical: &Path,
        external_dir: &Path,
    ) -> Result<(), ProvisionError> {
        if let Some(parent) = canonical.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ProvisionError::Directory(format!(
                    "failed to create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        match std::fs::symlink_metadata(canonical) {
            Ok(meta) if meta.file_type().is_symlink() => {
                std::fs::remove_file(canonical).map_err(|e| {
                    ProvisionError::Directory(format!(
                        "failed to remove stale symlink {}: {}",
                        canonical.display(),
                        e
                    ))
                })?;
            }
            Ok(_) => {
                let backup = backup_path(canonical);
                tracing::info!(
                    "[Directories] Backing up {} to {}",
                    canonical.display(),
                    backup.display()
                );
                std::fs::rename(canonical, &backup).map_err(|e| {
                    ProvisionError::Directory(format!(
                        "failed to back up {} to {}: {}",
                        canonical.display(),
                        backup.display(),
                        e
                    ))
                })?;
            }
            Err(_) => {}
        }

        make_symlink(external_dir, canonical)?;
        tracing::info!(
            "[Directories] Linked {} -> {}",
            canonical.display(),
            external_dir.display()
        );
        Ok(())
    }
}

fn ensure_local_dir(path: &Path) -> Result<(), ProvisionError> {
    // A dangling symlink here would shadow the directory; clear it first.
    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.file_type().is_symlink() && !path.exists() {
            std::fs::remove_file(path).map_err(|e| {
                ProvisionError::Directory(format!(
                    "failed to remove dangling symlink {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }
    }
    std::fs::create_dir_all(path).map_err(|e| {
        ProvisionError::Directory(format!("failed to create {}: {}", path.display(), e))
    })
}

/// Sibling backup name: `<name>.bak.<epoch-secs>`.
fn backup_path(path: &Path) -> PathBuf {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dir".to_string());
    path.with_file_name(format!("{}.bak.{}", name, epoch))
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> Result<(), ProvisionError> {
    std::os::unix::fs::symlink(target, link).map_err(|e| {
        ProvisionError::Directory(format!(
            "failed to create symlink {} -> {}: {}",
            link.display(),
            target.display(),
            e
        ))
    })
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, link: &Path) -> Result<(), ProvisionError> {
    Err(ProvisionError::Directory(format!(
        "symlink binding for {} is only supported on unix hosts",
        link.display()
    )))
}
