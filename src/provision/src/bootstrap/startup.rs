//! Service lifecycle: startup-script generation, launch, readiness polling.
//!
//! Script generation is pure text rendering and byte-deterministic for
//! identical inputs. The readiness poll is the only bounded wait in the
//! engine: it returns `TimedOut` as a value after the attempt budget is
//! spent and never blocks indefinitely.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tera::{Context, Tera};

use crate::config::EffectiveConfig;
use crate::provisioner::ProvisionError;

use super::embedded_templates;
use super::host::MemoryProfile;

/// Timeout for a single liveness probe. Distinct from the overall attempt
/// budget, which callers control.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Template renderer over the embedded templates.
pub struct TemplateRenderer {
    tera: Tera,
}

impl TemplateRenderer {
    pub fn from_embedded() -> Result<Self, ProvisionError> {
        let mut tera = Tera::default();
        for (name, content) in embedded_templates::ALL_TEMPLATES {
            tera.add_raw_template(name, content).map_err(|e| {
                ProvisionError::Runtime(format!("failed to register template {}: {}", name, e))
            })?;
        }
        Ok(Self { tera })
    }

    pub fn render(&self, template_name: &str, context: &Context) -> Result<String, ProvisionError> {
        self.tera.render(template_name, context).map_err(|e| {
            ProvisionError::Runtime(format!("failed to render template {}: {}", template_name, e))
        })
    }
}

/// Render the startup script. Pure: no filesystem access, identical inputs
/// produce identical bytes. Flags are emitted in key order.
pub fn render_startup_script(
    config: &EffectiveConfig,
    runtime_flags: &BTreeMap<String, String>,
    profile: Option<MemoryProfile>,
) -> Result<String, ProvisionError> {
    let renderer = TemplateRenderer::from_embedded()?;
    let mut context = Context::new();
    context.insert("work_dir", &config.work_dir.display().to_string());
    context.insert("install_dir", &config.install_dir.display().to_string());
    context.insert("runtime_version", &config.runtime_version);
    context.insert("listen_host", &config.listen_host);
    context.insert("app_port", &config.app_port);
    context.insert("vram_arg", vram_arg(profile));

    let flags: Vec<serde_json::Value> = runtime_flags
        .iter()
        .map(|(name, value)| serde_json::json!({ "name": name, "value": value }))
        .collect();
    context.insert("flags", &flags);

    renderer.render("start_service.sh.j2", &context)
}

/// Render the supervisor configuration for the app and its API sidecar.
pub fn render_supervisor_config(config: &EffectiveConfig) -> Result<String, ProvisionError> {
    let renderer = TemplateRenderer::from_embedded()?;
    let mut context = Context::new();
    context.insert("work_dir", &config.work_dir.display().to_string());
    context.insert("install_dir", &config.install_dir.display().to_string());
    context.insert("listen_host", &config.listen_host);
    context.insert("api_port", &config.api_port);
    renderer.render("supervisord.conf.j2", &context)
}

/// Memory-profile flag for the app command line.
fn vram_arg(profile: Option<MemoryProfile>) -> &'static str {
    match profile {
        Some(MemoryProfile::High) => "--highvram",
        Some(MemoryProfile::Medium) => "--normalvram",
        Some(MemoryProfile::Low) => "--lowvram",
        None => "--cpu",
    }
}

/// Write rendered script text and mark it executable.
pub fn write_executable(path: &Path, content: &str) -> Result<(), ProvisionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(ProvisionError::Io)?;
    }
    std::fs::write(path, content).map_err(ProvisionError::Io)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path).map_err(ProvisionError::Io)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).map_err(ProvisionError::Io)?;
    }
    Ok(())
}

/// Handle to the launched service process.
pub struct ServiceHandle {
    child: Child,
    pub listen_host: String,
    pub listen_port: u16,
    pub liveness_path: String,
}

impl ServiceHandle {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Terminate the service process.
    pub fn stop(&mut self) {
        match self.child.kill() {
            Ok(()) => {
                let _ = self.child.wait();
                tracing::info!("[Lifecycle] Stopped service process {}", self.child.id());
            }
            Err(e) => tracing::debug!("[Lifecycle] Could not stop service: {}", e),
        }
    }
}

/// Result of the bounded readiness poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut { attempts: u32 },
}

/// Launch the generated startup script.
pub fn launch(script: &Path, config: &EffectiveConfig) -> Result<ServiceHandle, ProvisionError> {
    let child = Command::new("/bin/sh")
        .arg(script)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| {
            ProvisionError::Runtime(format!("failed to launch {}: {}", script.display(), e))
        })?;
    tracing::info!(
        "[Lifecycle] Launched {} (pid {})",
        script.display(),
        child.id()
    );
    Ok(ServiceHandle {
        child,
        listen_host: config.listen_host.clone(),
        listen_port: config.app_port,
        liveness_path: config.health_path.clone(),
    })
}

/// Poll `url` until it answers with a success status or the attempt budget
/// is spent. Exhaustion is a value, not an error, and the loop sleeps only
/// between attempts.
pub async fn await_ready(url: &str, max_attempts: u32, interval: Duration) -> Readiness {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    for attempt in 1..=max_attempts {
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!("[Lifecycle] Service ready after {} attempt(s)", attempt);
                return Readiness::Ready;
            }
            Ok(response) => tracing::debug!(
                "[Lifecycle] Probe {}/{} returned HTTP {}",
                attempt,
                max_attempts,
                response.status()
            ),
            Err(e) => tracing::debug!(
                "[Lifecycle] Probe {}/{} failed: {}",
                attempt,
                max_attempts,
                e
            ),
        }
        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }

    tracing::warn!(
        "[Lifecycle] Service not ready after {} attempts, giving up",
        max_attempts
    );
    Readiness::TimedOut {
        attempts: max_attempts,
    }
}

/// Launch and poll in one step.
pub async fn launch_and_await_ready(
    script: &Path,
    config: &EffectiveConfig,
) -> Result<(ServiceHandle, Readiness), ProvisionError> {
    let handle = launch(script, config)?;
    let readiness = await_ready(
        &config.liveness_url(),
        config.poll_max_attempts,
        Duration::from_secs(config.poll_interval_secs),
    )
    .await;
    Ok((handle, readiness))
}
