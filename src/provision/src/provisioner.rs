//! Progress reporting and error types for provisioning operations.

use crate::progress::ProvisionProgress;

/// Channel-based progress reporter for embedding the engine in a UI.
pub struct ChannelProgressReporter {
    sender: tokio::sync::mpsc::Sender<ProvisionProgress>,
}

impl ChannelProgressReporter {
    pub fn new(sender: tokio::sync::mpsc::Sender<ProvisionProgress>) -> Self {
        Self { sender }
    }
}

impl ProgressReporter for ChannelProgressReporter {
    fn emit(&self, percentage: u32, message: String) {
        let _ = self.sender.try_send(ProvisionProgress::new(percentage, message));
    }
}

/// Log-based progress reporter used by the CLI.
pub struct LogProgressReporter;

impl ProgressReporter for LogProgressReporter {
    fn emit(&self, percentage: u32, message: String) {
        tracing::info!("[Provision] {:>3}% {}", percentage, message);
    }
}

/// Progress reporter for provisioning operations.
pub trait ProgressReporter: Send + Sync + 'static {
    fn emit(&self, percentage: u32, message: String);
}

/// Error type for provisioning operations.
///
/// Only fatal conditions become errors. Degraded conditions (optional asset
/// failure, stale checkout, port-in-use advisory, absent accelerator) are
/// logged as warnings and the run continues; the readiness poll reports
/// exhaustion as a value, not an error.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Asset error: {0}")]
    Asset(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
