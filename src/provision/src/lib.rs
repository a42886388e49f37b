//! Provisioning engine for the studio image-generation service.
//!
//! The engine owns the idempotent, multi-source asset workflow: resolve
//! configuration, bind model directories to shared storage when present,
//! materialize model weights and plugin checkouts, derive accelerator
//! runtime flags, generate the startup script, and launch the service with
//! a bounded readiness poll. The service itself is an external
//! collaborator; nothing here generates an image.

pub mod bootstrap;
pub mod config;
pub mod progress;
pub mod provisioner;

pub use bootstrap::{
    await_ready, derive_runtime_flags, detect, AssetDescriptor, AssetFetcher, AssetSource,
    BindingTarget, CleanupRegistry, DirectoryBinder, DirectoryBinding, FetchOutcome,
    HostCapabilities, HttpProvider, Manifest, MemoryProfile, ProvisionSummary, Readiness,
    ServiceHandle, StudioProvisioner, TemplateRenderer, MANAGED_SUBPATHS,
};
pub use config::{ConfigOverrides, EffectiveConfig};
pub use progress::ProvisionProgress;
pub use provisioner::{
    ChannelProgressReporter, LogProgressReporter, ProgressReporter, ProvisionError,
};
