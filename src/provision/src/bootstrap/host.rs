//! Host capability detection and runtime flag derivation.
//!
//! Probes are best effort: a missing tool or unparsable output marks the
//! capability as absent, it never fails the run. Capabilities are captured
//! once per run and are read-only afterwards.

use std::collections::BTreeMap;
use std::process::Command;

use serde::Serialize;

/// What the host offers at provisioning time.
#[derive(Debug, Clone, Serialize)]
pub struct HostCapabilities {
    pub accelerator_present: bool,
    pub accelerator_memory_mb: u64,
    pub driver_version: Option<String>,
    pub toolkit_version: Option<String>,
}

impl HostCapabilities {
    pub fn absent() -> Self {
        Self {
            accelerator_present: false,
            accelerator_memory_mb: 0,
            driver_version: None,
            toolkit_version: None,
        }
    }

    pub fn memory_gb(&self) -> u64 {
        self.accelerator_memory_mb / 1024
    }
}

/// Memory profile selected from accelerator memory in whole gigabytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryProfile {
    High,
    Medium,
    Low,
}

impl MemoryProfile {
    /// Threshold table: >= 24 GB high, >= 12 GB medium, otherwise low.
    pub fn from_memory_mb(memory_mb: u64) -> Self {
        let gb = memory_mb / 1024;
        if gb >= 24 {
            MemoryProfile::High
        } else if gb >= 12 {
            MemoryProfile::Medium
        } else {
            MemoryProfile::Low
        }
    }

    /// Allocator configuration: every profile uses expandable segments,
    /// the low profile additionally caps the split size.
    pub fn alloc_conf(&self) -> &'static str {
        match self {
            MemoryProfile::High | MemoryProfile::Medium => "expandable_segments:True",
            MemoryProfile::Low => "expandable_segments:True,max_split_size_mb:512",
        }
    }

    pub fn memory_fraction(&self) -> &'static str {
        match self {
            MemoryProfile::High => "0.9",
            MemoryProfile::Medium => "0.8",
            MemoryProfile::Low => "0.7",
        }
    }

    pub fn batch_size(&self) -> &'static str {
        match self {
            MemoryProfile::High => "4",
            MemoryProfile::Medium => "2",
            MemoryProfile::Low => "1",
        }
    }

    pub fn attention_mode(&self) -> &'static str {
        match self {
            MemoryProfile::High => "flash_attention",
            MemoryProfile::Medium => "efficient_attention",
            MemoryProfile::Low => "low_mem_attention",
        }
    }

    pub fn cache_models(&self) -> bool {
        !matches!(self, MemoryProfile::Low)
    }
}

/// Probe the host. Every probe failure is data, not an error.
pub fn detect() -> HostCapabilities {
    let mut caps = HostCapabilities::absent();

    match query_nvidia_smi() {
        Some((memory_mb, driver)) => {
            caps.accelerator_present = true;
            caps.accelerator_memory_mb = memory_mb;
            caps.driver_version = driver;
            tracing::info!(
                "[Host] Accelerator detected: {} MB, driver {}",
                memory_mb,
                caps.driver_version.as_deref().unwrap_or("unknown")
            );
        }
        None => {
            tracing::warn!("[Host] No accelerator detected, continuing without one");
        }
    }

    caps.toolkit_version = query_nvcc();
    if let Some(toolkit) = &caps.toolkit_version {
        tracing::info!("[Host] Toolkit version {}", toolkit);
    }

    caps
}

/// Derived environment knobs for the startup script. Empty when no
/// accelerator is present; consumers fall back to a CPU path on their own.
pub fn derive_runtime_flags(caps: &HostCapabilities) -> BTreeMap<String, String> {
    let mut flags = BTreeMap::new();
    if !caps.accelerator_present {
        return flags;
    }

    let profile = MemoryProfile::from_memory_mb(caps.accelerator_memory_mb);
    tracing::info!(
        "[Host] {} GB accelerator memory -> {:?} profile",
        caps.memory_gb(),
        profile
    );

    flags.insert(
        "PYTORCH_CUDA_ALLOC_CONF".to_string(),
        profile.alloc_conf().to_string(),
    );
    flags.insert(
        "STUDIO_MEMORY_FRACTION".to_string(),
        profile.memory_fraction().to_string(),
    );
    flags.insert(
        "STUDIO_BATCH_SIZE".to_string(),
        profile.batch_size().to_string(),
    );
    flags.insert(
        "STUDIO_ATTENTION_MODE".to_string(),
        profile.attention_mode().to_string(),
    );
    flags.insert(
        "STUDIO_CACHE_MODELS".to_string(),
        if profile.cache_models() { "1" } else { "0" }.to_string(),
    );
    flags
}

/// `nvidia-smi --query-gpu=memory.total,driver_version` for the first GPU.
fn query_nvidia_smi() -> Option<(u64, Option<String>)> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.total,driver_version",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8(output.stdout).ok()?;
    let line = stdout.lines().next()?;
    let mut fields = line.split(',').map(str::trim);
    let memory_mb: u64 = fields.next()?.parse().ok()?;
    let driver = fields.next().map(str::to_string).filter(|s| !s.is_empty());
    Some((memory_mb, driver))
}

/// Toolkit version from `nvcc --version` ("... release 12.4, V12.4.131").
fn query_nvcc() -> Option<String> {
    let output = Command::new("nvcc").arg("--version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8(output.stdout).ok()?;
    let rest = stdout.split("release ").nth(1)?;
    let version = rest.split([',', '\n']).next()?.trim();
    if version.is_empty() {
        None
    } else {
        Some(version.to_string())
    }
}
