//! Asset fetcher: idempotent materialization of externally-sourced files.
//!
//! An asset already present at its destination with non-zero size is never
//! re-downloaded. HTTP sources stream straight to the destination path;
//! object-store and version-control sources delegate to the `aws` and `git`
//! CLIs. Failure is reported as a value so the driver can decide between
//! fatal (required asset) and degraded (optional asset).

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::config::EffectiveConfig;
use crate::provisioner::ProvisionError;

/// Token-passing convention per HTTP provider. The model hub takes a bearer
/// token in the Authorization header; the community model-share site takes
/// the token as a query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpProvider {
    HuggingFace,
    Civitai,
}

/// Where an asset comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetSource {
    Http { url: String, provider: HttpProvider },
    ObjectStore { key: String },
    VersionControl { repo_url: String },
}

/// One asset to materialize. Built from the manifest, consumed once per
/// run, never mutated.
#[derive(Debug, Clone)]
pub struct AssetDescriptor {
    pub name: String,
    pub source: AssetSource,
    pub dest_dir: PathBuf,
    /// File name (or checkout directory name for version-control sources)
    /// expected under `dest_dir`.
    pub expected_filename: String,
    pub required: bool,
    /// Optional integrity check, verified after download only. Presence at
    /// the destination still short-circuits without re-hashing.
    pub expected_sha256: Option<String>,
}

impl AssetDescriptor {
    pub fn destination(&self) -> PathBuf {
        self.dest_dir.join(&self.expected_filename)
    }

    fn validate(&self) -> Result<(), String> {
        if self.expected_filename.is_empty() {
            return Err(format!("asset {} has an empty expected filename", self.name));
        }
        let locator = match &self.source {
            AssetSource::Http { url, .. } => url,
            AssetSource::ObjectStore { key } => key,
            AssetSource::VersionControl { repo_url } => repo_url,
        };
        if locator.is_empty() {
            return Err(format!("asset {} has an empty locator", self.name));
        }
        Ok(())
    }
}

/// Outcome of a single fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Already present (or stale checkout kept after a failed update).
    Skipped,
    /// Materialized in this run (or planned, in dry-run).
    Downloaded,
    /// Could not be materialized. The driver decides whether this is fatal.
    Failed(String),
}

/// Paths of in-flight downloads, removed on interrupt. Best effort only: a
/// download truncated without a sweep still satisfies the existence check
/// on the next run (known gap, inherited from the original workflow).
#[derive(Clone, Default)]
pub struct CleanupRegistry {
    inner: Arc<Mutex<Vec<PathBuf>>>,
}

impl CleanupRegistry {
    pub fn register(&self, path: &Path) {
        self.inner.lock().unwrap().push(path.to_path_buf());
    }

    pub fn unregister(&self, path: &Path) {
        self.inner.lock().unwrap().retain(|p| p != path);
    }

    /// Remove every registered in-flight file.
    pub fn sweep(&self) {
        let paths = std::mem::take(&mut *self.inner.lock().unwrap());
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::info!("[Cleanup] Removed partial download {}", path.display()),
                Err(e) => tracing::debug!(
                    "[Cleanup] Could not remove {}: {}",
                    path.display(),
                    e
                ),
            }
        }
    }
}

/// Object-store connection settings, fixed once at fetcher construction.
#[derive(Debug, Clone)]
pub struct ObjectStoreSettings {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

/// Fetcher for all asset sources. Credentials and the object-store endpoint
/// are configured once; per-asset calls carry only the descriptor.
pub struct AssetFetcher {
    http: reqwest::Client,
    object_store: Option<ObjectStoreSettings>,
    hf_token: Option<String>,
    civitai_token: Option<String>,
    dry_run: bool,
    cleanup: CleanupRegistry,
}

impl AssetFetcher {
    pub fn from_config(
        config: &EffectiveConfig,
        cleanup: CleanupRegistry,
    ) -> Result<Self, ProvisionError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("studio-provision/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(15));
        // Downloads are unbounded unless a timeout is configured; only the
        // readiness poll is bounded by default.
        if config.download_timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.download_timeout_secs));
        }
        let http = builder
            .build()
            .map_err(|e| ProvisionError::Runtime(format!("failed to build HTTP client: {}", e)))?;

        let object_store = match (&config.s3_endpoint, &config.s3_bucket) {
            (Some(endpoint), Some(bucket)) => Some(ObjectStoreSettings {
                endpoint: endpoint.clone(),
                bucket: bucket.clone(),
                access_key: config.s3_access_key.clone(),
                secret_key: config.s3_secret_key.clone(),
            }),
            _ => None,
        };

        Ok(Self {
            http,
            object_store,
            hf_token: config.hf_token.clone(),
            civitai_token: config.civitai_token.clone(),
            dry_run: config.dry_run,
            cleanup,
        })
    }

    /// Materialize one asset. Never returns Err: every failure is folded
    /// into `FetchOutcome::Failed` for the driver to classify.
    pub async fn fetch(&self, desc: &AssetDescriptor) -> FetchOutcome {
        if let Err(msg) = desc.validate() {
            return FetchOutcome::Failed(msg);
        }

        if let AssetSource::VersionControl { repo_url } = &desc.source {
            return self.fetch_checkout(desc, repo_url);
        }

        let dest = desc.destination();
        if file_present(&dest) {
            tracing::info!(
                "[Fetcher] {} already present at {}, skipping",
                desc.name,
                dest.display()
            );
            return FetchOutcome::Skipped;
        }

        if self.dry_run {
            tracing::info!(
                "[Fetcher] dry-run: would download {} to {}",
                desc.name,
                dest.display()
            );
            return FetchOutcome::Downloaded;
        }

        if let Err(e) = std::fs::create_dir_all(&desc.dest_dir) {
            return FetchOutcome::Failed(format!(
                "failed to create {}: {}",
                desc.dest_dir.display(),
                e
            ));
        }

        let result = match &desc.source {
            AssetSource::Http { url, provider } => {
                self.download_http(desc, url, *provider, &dest).await
            }
            AssetSource::ObjectStore { key } => self.download_object(desc, key, &dest),
            AssetSource::VersionControl { .. } => unreachable!("handled above"),
        };

        match result {
            Ok(()) => {
                tracing::info!("[Fetcher] Downloaded {} to {}", desc.name, dest.display());
                FetchOutcome::Downloaded
            }
            Err(msg) => FetchOutcome::Failed(msg),
        }
    }

    /// Stream an HTTP source to the destination, attaching the provider's
    /// credential convention and hashing on the way through when the
    /// descriptor carries an expected digest.
    async fn download_http(
        &self,
        desc: &AssetDescriptor,
        url: &str,
        provider: HttpProvider,
        dest: &Path,
    ) -> Result<(), String> {
        let mut request = self.http.get(url);
        match provider {
            HttpProvider::HuggingFace => {
                if let Some(token) = &self.hf_token {
                    request = request.bearer_auth(token);
                }
            }
            HttpProvider::Civitai => {
                if let Some(token) = &self.civitai_token {
                    request = request.query(&[("token", token.as_str())]);
                }
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("request for {} failed: {}", url, e))?;
        if !response.status().is_success() {
            return Err(format!(
                "download of {} returned HTTP {}",
                url,
                response.status()
            ));
        }

        self.cleanup.register(dest);
        let write_result = async {
            let mut file = tokio::fs::File::create(dest)
                .await
                .map_err(|e| format!("failed to create {}: {}", dest.display(), e))?;
            let mut hasher = desc.expected_sha256.as_ref().map(|_| Sha256::new());
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| format!("read from {} failed: {}", url, e))?;
                if let Some(hasher) = hasher.as_mut() {
                    hasher.update(&chunk);
                }
                file.write_all(&chunk)
                    .await
                    .map_err(|e| format!("write to {} failed: {}", dest.display(), e))?;
            }
            file.sync_all()
                .await
                .map_err(|e| format!("sync of {} failed: {}", dest.display(), e))?;
            Ok::<Option<Sha256>, String>(hasher)
        }
        .await;

        match write_result {
            Ok(hasher) => {
                self.cleanup.unregister(dest);
                if let (Some(hasher), Some(expected)) = (hasher, &desc.expected_sha256) {
                    verify_digest(desc, dest, &format!("{:x}", hasher.finalize()), expected)?;
                }
                Ok(())
            }
            Err(msg) => {
                self.cleanup.unregister(dest);
                Err(msg)
            }
        }
    }

    /// Copy an object-store key to the destination via the `aws` CLI, with
    /// the preconfigured endpoint and credentials in the child environment.
    fn download_object(&self, desc: &AssetDescriptor, key: &str, dest: &Path) -> Result<(), String> {
        let Some(store) = &self.object_store else {
            return Err(format!(
                "asset {} uses an object-store source but no endpoint/bucket is configured",
                desc.name
            ));
        };

        let uri = format!("s3://{}/{}", store.bucket, key);
        tracing::info!("[Fetcher] Copying {} from {}", desc.name, uri);

        let mut cmd = Command::new("aws");
        cmd.arg("s3")
            .arg("cp")
            .arg(&uri)
            .arg(dest)
            .arg("--endpoint-url")
            .arg(&store.endpoint)
            .arg("--only-show-errors");
        if let Some(access_key) = &store.access_key {
            cmd.env("AWS_ACCESS_KEY_ID", access_key);
        }
        if let Some(secret_key) = &store.secret_key {
            cmd.env("AWS_SECRET_ACCESS_KEY", secret_key);
        }

        self.cleanup.register(dest);
        let output = cmd.output();
        self.cleanup.unregister(dest);

        let output = output.map_err(|e| format!("failed to run aws cli: {}", e))?;
        if !output.status.success() {
            return Err(format!(
                "aws s3 cp {} failed: {}",
                uri,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        if let Some(expected) = &desc.expected_sha256 {
            let actual = sha256_of_file(dest)
                .map_err(|e| format!("failed to hash {}: {}", dest.display(), e))?;
            verify_digest(desc, dest, &actual, expected)?;
        }
        Ok(())
    }

    /// Clone or update a version-control checkout in place. A failed update
    /// keeps the stale checkout and degrades to `Skipped`; only a failed
    /// initial clone is a failure.
    fn fetch_checkout(&self, desc: &AssetDescriptor, repo_url: &str) -> FetchOutcome {
        let checkout = desc.destination();

        if checkout.join(".git").is_dir() {
            if self.dry_run {
                tracing::info!(
                    "[Fetcher] dry-run: would update checkout {}",
                    checkout.display()
                );
                return FetchOutcome::Downloaded;
            }
            let output = Command::new("git")
                .arg("-C")
                .arg(&checkout)
                .args(["pull", "--ff-only"])
                .output();
            return match output {
                Ok(out) if out.status.success() => {
                    tracing::info!("[Fetcher] Updated checkout {}", checkout.display());
                    FetchOutcome::Downloaded
                }
                Ok(out) => {
                    tracing::warn!(
                        "[Fetcher] Update of {} failed ({}), keeping stale checkout",
                        checkout.display(),
                        String::from_utf8_lossy(&out.stderr).trim()
                    );
                    FetchOutcome::Skipped
                }
                Err(e) => {
                    tracing::warn!(
                        "[Fetcher] Could not run git for {} ({}), keeping stale checkout",
                        checkout.display(),
                        e
                    );
                    FetchOutcome::Skipped
                }
            };
        }

        if self.dry_run {
            tracing::info!(
                "[Fetcher] dry-run: would clone {} to {}",
                repo_url,
                checkout.display()
            );
            return FetchOutcome::Downloaded;
        }

        if let Err(e) = std::fs::create_dir_all(&desc.dest_dir) {
            return FetchOutcome::Failed(format!(
                "failed to create {}: {}",
                desc.dest_dir.display(),
                e
            ));
        }

        let output = Command::new("git")
            .args(["clone", "--depth", "1", repo_url])
            .arg(&checkout)
            .output();
        match output {
            Ok(out) if out.status.success() => {
                tracing::info!("[Fetcher] Cloned {} to {}", repo_url, checkout.display());
                FetchOutcome::Downloaded
            }
            Ok(out) => FetchOutcome::Failed(format!(
                "clone of {} failed: {}",
                repo_url,
                String::from_utf8_lossy(&out.stderr).trim()
            )),
            Err(e) => FetchOutcome::Failed(format!("could not run git: {}", e)),
        }
    }
}

/// The idempotence check: present means existing with non-zero size.
fn file_present(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

fn verify_digest(
    desc: &AssetDescriptor,
    dest: &Path,
    actual: &str,
    expected: &str,
) -> Result<(), String> {
    if actual.eq_ignore_ascii_case(expected) {
        tracing::debug!("[Fetcher] Digest verified for {}", desc.name);
        return Ok(());
    }
    let _ = std::fs::remove_file(dest);
    Err(format!(
        "digest mismatch for {}: expected {}, got {}",
        desc.name, expected, actual
    ))
}

fn sha256_of_file(path: &Path) -> std::io::Result<String> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_file_is_not_present() {
        let dir = std::env::temp_dir().join("provision-fetcher-present-test");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let empty = dir.join("empty.safetensors");
        std::fs::write(&empty, b"").unwrap();
        assert!(!file_present(&empty));

        let full = dir.join("full.safetensors");
        std::fs::write(&full, b"weights").unwrap();
        assert!(file_present(&full));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn descriptor_with_empty_locator_fails_validation() {
        let desc = AssetDescriptor {
            name: "broken".to_string(),
            source: AssetSource::Http {
                url: String::new(),
                provider: HttpProvider::HuggingFace,
            },
            dest_dir: PathBuf::from("/tmp"),
            expected_filename: "x.bin".to_string(),
            required: false,
            expected_sha256: None,
        };
        assert!(desc.validate().is_err());
    }
}
