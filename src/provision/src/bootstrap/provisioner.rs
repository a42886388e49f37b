//! Top-level provisioning driver.
//!
//! Runs the sequential workflow: directory binding, host detection, asset
//! fetching, script generation, launch + readiness poll. Components report
//! success/failure signals; this driver is the single place that decides
//! whether a condition aborts the run or degrades it to a warning.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use crate::config::EffectiveConfig;
use crate::provisioner::{ProgressReporter, ProvisionError};

use super::directories::{DirectoryBinder, DirectoryBinding, MANAGED_SUBPATHS};
use super::fetcher::{AssetFetcher, CleanupRegistry, FetchOutcome};
use super::host::{self, HostCapabilities, MemoryProfile};
use super::manifest::Manifest;
use super::startup::{self, Readiness, ServiceHandle};

/// What a provisioning run produced.
pub struct ProvisionSummary {
    pub bindings: Vec<DirectoryBinding>,
    pub capabilities: HostCapabilities,
    pub runtime_flags: BTreeMap<String, String>,
    pub outcomes: Vec<(String, FetchOutcome)>,
    pub startup_script: Option<PathBuf>,
    pub supervisor_config: Option<PathBuf>,
    pub readiness: Option<Readiness>,
}

impl ProvisionSummary {
    pub fn downloaded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o == FetchOutcome::Downloaded)
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o == FetchOutcome::Skipped)
            .count()
    }
}

/// Drives one provisioning run against a resolved configuration.
pub struct StudioProvisioner {
    config: EffectiveConfig,
    cleanup: CleanupRegistry,
}

impl StudioProvisioner {
    pub fn new(config: EffectiveConfig, cleanup: CleanupRegistry) -> Self {
        Self { config, cleanup }
    }

    pub fn config(&self) -> &EffectiveConfig {
        &self.config
    }

    /// Run the full workflow. Fatal conditions return Err; degraded ones
    /// are logged and the run continues. The readiness poll result is
    /// reported in the summary for the caller to judge.
    pub async fn run(
        &self,
        reporter: &dyn ProgressReporter,
    ) -> Result<ProvisionSummary, ProvisionError> {
        let started = Instant::now();
        if self.config.dry_run {
            tracing::info!("[Provisioner] Dry-run: no mutation will be performed");
        }

        reporter.emit(5, "Binding directories".to_string());
        let binder = DirectoryBinder::new(
            self.config.install_dir.clone(),
            self.config.external_mount.clone(),
            self.config.dry_run,
        );
        let bindings = binder.bind_directories(MANAGED_SUBPATHS)?;

        reporter.emit(15, "Detecting host capabilities".to_string());
        let capabilities = host::detect();
        if let Ok(json) = serde_json::to_string(&capabilities) {
            tracing::debug!("[Provisioner] Host capabilities: {}", json);
        }
        let runtime_flags = host::derive_runtime_flags(&capabilities);
        let profile = capabilities
            .accelerator_present
            .then(|| MemoryProfile::from_memory_mb(capabilities.accelerator_memory_mb));

        let manifest = Manifest::embedded()?;
        let descriptors = manifest.descriptors_for(&self.config)?;
        let fetcher = AssetFetcher::from_config(&self.config, self.cleanup.clone())?;

        let mut outcomes = Vec::with_capacity(descriptors.len());
        let total = descriptors.len() as u32;
        for (index, desc) in descriptors.iter().enumerate() {
            let progress = 20 + 60u32.saturating_mul(index as u32) / total.max(1);
            reporter.emit(progress, format!("Fetching {}", desc.name));

            let outcome = fetcher.fetch(desc).await;
            if let FetchOutcome::Failed(reason) = &outcome {
                if desc.required {
                    return Err(ProvisionError::Asset(format!(
                        "required asset {} failed: {}",
                        desc.name, reason
                    )));
                }
                tracing::warn!(
                    "[Provisioner] Optional asset {} failed ({}), continuing",
                    desc.name,
                    reason
                );
            }
            outcomes.push((desc.name.clone(), outcome));
        }

        reporter.emit(85, "Generating startup script".to_string());
        let script_text =
            startup::render_startup_script(&self.config, &runtime_flags, profile)?;
        let supervisor_text = startup::render_supervisor_config(&self.config)?;
        let script_path = self.config.work_dir.join("start_service.sh");
        let supervisor_path = self.config.work_dir.join("supervisord.conf");

        let (startup_script, supervisor_config) = if self.config.dry_run {
            tracing::info!(
                "[Provisioner] dry-run: would write {} and {}",
                script_path.display(),
                supervisor_path.display()
            );
            (None, None)
        } else {
            startup::write_executable(&script_path, &script_text)?;
            std::fs::write(&supervisor_path, &supervisor_text).map_err(ProvisionError::Io)?;
            std::fs::create_dir_all(self.config.work_dir.join("logs"))
                .map_err(ProvisionError::Io)?;
            tracing::info!("[Provisioner] Wrote {}", script_path.display());
            tracing::info!("[Provisioner] Wrote {}", supervisor_path.display());
            (Some(script_path.clone()), Some(supervisor_path))
        };

        let readiness = if self.config.dry_run || self.config.skip_launch {
            None
        } else {
            reporter.emit(90, "Launching service".to_string());
            let (mut handle, readiness) =
                startup::launch_and_await_ready(&script_path, &self.config).await?;
            if let Readiness::TimedOut { attempts } = &readiness {
                tracing::warn!(
                    "[Provisioner] Service did not become ready within {} attempts, stopping it",
                    attempts
                );
                handle.stop();
            } else {
                detach(handle);
            }
            Some(readiness)
        };

        reporter.emit(100, "Provisioning complete".to_string());
        tracing::info!(
            "[TIMING] Provisioning run finished in {}ms",
            started.elapsed().as_millis()
        );

        Ok(ProvisionSummary {
            bindings,
            capabilities,
            runtime_flags,
            outcomes,
            startup_script,
            supervisor_config,
            readiness,
        })
    }
}

/// Leave a ready service running after the provisioner exits. Dropping the
/// handle without an explicit stop does not terminate the child.
fn detach(handle: ServiceHandle) {
    tracing::info!(
        "[Provisioner] Service ready on {}:{} (pid {})",
        handle.listen_host,
        handle.listen_port,
        handle.pid()
    );
}
