//! Progress types for provisioning runs.

use serde::{Deserialize, Serialize};

/// Progress event emitted while a provisioning run advances.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ProvisionProgress {
    pub percentage: u32,
    pub message: String,
}

impl ProvisionProgress {
    pub fn new(percentage: u32, message: String) -> Self {
        Self {
            percentage,
            message,
        }
    }
}
