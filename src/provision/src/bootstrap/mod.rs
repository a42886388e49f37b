/// Provisioning workflow: directories, assets, host detection, lifecycle.
pub mod directories;
pub mod embedded_templates;
pub mod fetcher;
pub mod host;
pub mod manifest;
pub mod provisioner;
pub mod startup;

pub use directories::{BindingTarget, DirectoryBinder, DirectoryBinding, MANAGED_SUBPATHS};
pub use fetcher::{
    AssetDescriptor, AssetFetcher, AssetSource, CleanupRegistry, FetchOutcome, HttpProvider,
};
pub use host::{derive_runtime_flags, detect, HostCapabilities, MemoryProfile};
pub use manifest::{Manifest, ManifestEntry, ManifestSource};
pub use provisioner::{ProvisionSummary, StudioProvisioner};
pub use startup::{
    await_ready, launch, launch_and_await_ready, render_startup_script, render_supervisor_config,
    write_executable, Readiness, ServiceHandle, TemplateRenderer,
};
