//! studio-provision binary: provisions the studio image-generation service.
//!
//! Sequential workflow per run: resolve config, bind directories, detect the
//! accelerator, fetch assets, generate startup scripts, launch and poll for
//! readiness. Interruption sweeps registered in-flight downloads and exits.

use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use provision::{
    CleanupRegistry, ConfigOverrides, EffectiveConfig, FetchOutcome, LogProgressReporter,
    Readiness, StudioProvisioner,
};

#[derive(Parser, Debug)]
#[command(
    name = "studio-provision",
    version,
    about = "Provision the studio image-generation service"
)]
struct Args {
    /// Path to a key=value configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Working directory for provisioning state and generated scripts.
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Install directory of the studio app (defaults to WORK_DIR/app).
    #[arg(long, value_name = "DIR")]
    install_dir: Option<PathBuf>,

    /// Python runtime version the startup script invokes.
    #[arg(long, value_name = "VERSION")]
    runtime_version: Option<String>,

    /// Proceed without interactive confirmation.
    #[arg(short = 'y', long)]
    auto: bool,

    /// Preview every action without mutating the filesystem or network.
    #[arg(long)]
    dry_run: bool,

    /// Provision assets and scripts but do not launch the service.
    #[arg(long)]
    skip_launch: bool,

    /// Model set to provision (minimal, base, full).
    #[arg(long, value_name = "SET")]
    model_set: Option<String>,

    /// Host the service listens on.
    #[arg(long, value_name = "HOST")]
    listen_host: Option<String>,

    /// Port for the studio app.
    #[arg(long, value_name = "PORT")]
    app_port: Option<u16>,

    /// Port for the HTTP API sidecar.
    #[arg(long, value_name = "PORT")]
    api_port: Option<u16>,

    /// External mount to redirect model directories to, when present.
    #[arg(long, value_name = "DIR")]
    external_mount: Option<PathBuf>,
}

impl From<&Args> for ConfigOverrides {
    fn from(args: &Args) -> Self {
        let mut overrides = ConfigOverrides::default();
        overrides.config_path = args.config.clone();
        overrides.work_dir = args.work_dir.clone();
        overrides.install_dir = args.install_dir.clone();
        overrides.runtime_version = args.runtime_version.clone();
        // Flags only force a value when given; absence defers to env/file.
        overrides.auto_mode = args.auto.then_some(true);
        overrides.dry_run = args.dry_run.then_some(true);
        overrides.skip_launch = args.skip_launch.then_some(true);
        overrides.model_set = args.model_set.clone();
        overrides.listen_host = args.listen_host.clone();
        overrides.app_port = args.app_port;
        overrides.api_port = args.api_port;
        overrides.external_mount = args.external_mount.clone();
        overrides
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Show the plan and ask for confirmation. Only used in interactive mode.
fn confirm_plan(config: &EffectiveConfig) -> bool {
    eprintln!("Provisioning plan:");
    eprintln!("  work dir:       {}", config.work_dir.display());
    eprintln!("  install dir:    {}", config.install_dir.display());
    eprintln!("  model set:      {}", config.model_set);
    eprintln!(
        "  external mount: {}",
        config
            .external_mount
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string())
    );
    eprintln!(
        "  service:        {}:{} (api {})",
        config.listen_host, config.app_port, config.api_port
    );
    eprint!("Proceed? [y/N] ");
    let _ = std::io::stderr().flush();

    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_logging();
    let args = Args::parse();

    let config = match EffectiveConfig::resolve(ConfigOverrides::from(&args)) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("[Provision] ERROR: {}", e);
            std::process::exit(1);
        }
    };

    if let Ok(json) = serde_json::to_string(&config) {
        tracing::debug!("[Provision] Resolved configuration: {}", json);
    }

    if !config.auto_mode && !config.dry_run && !confirm_plan(&config) {
        tracing::info!("[Provision] Aborted by operator");
        return;
    }

    if !config.dry_run {
        if let Err(e) = std::fs::create_dir_all(&config.work_dir) {
            tracing::error!(
                "[Provision] ERROR: cannot create working directory {}: {}",
                config.work_dir.display(),
                e
            );
            std::process::exit(1);
        }
    }

    let cleanup = CleanupRegistry::default();
    spawn_signal_handler(cleanup.clone());

    let provisioner = StudioProvisioner::new(config, cleanup.clone());
    match provisioner.run(&LogProgressReporter).await {
        Ok(summary) => {
            tracing::info!(
                "[Provision] {} downloaded, {} skipped, {} directory bindings",
                summary.downloaded(),
                summary.skipped(),
                summary.bindings.len()
            );
            for (name, outcome) in &summary.outcomes {
                if let FetchOutcome::Failed(reason) = outcome {
                    tracing::warn!("[Provision] {} was not provisioned: {}", name, reason);
                }
            }
            if let Some(script) = &summary.startup_script {
                tracing::info!("[Provision] Startup script at {}", script.display());
            }
            if let Some(Readiness::TimedOut { attempts }) = &summary.readiness {
                tracing::error!(
                    "[Provision] ERROR: service not ready after {} attempts",
                    attempts
                );
                std::process::exit(1);
            }
        }
        Err(e) => {
            tracing::error!("[Provision] ERROR: {}", e);
            cleanup.sweep();
            std::process::exit(1);
        }
    }
}

/// Sweep registered in-flight downloads on SIGINT/SIGTERM, then exit.
/// Best effort only: no guarantee for files past their registration window.
fn spawn_signal_handler(cleanup: CleanupRegistry) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::warn!("[Provision] Interrupted, removing in-flight downloads");
        cleanup.sweep();
        std::process::exit(130);
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!("[Provision] Cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
