//! Integration tests for the asset fetcher.
//!
//! Network-free: URLs point at a freshly-closed local port, so any probe
//! that actually reached the network would fail the test.

use std::net::TcpListener;
use std::path::Path;

use provision::{
    AssetDescriptor, AssetFetcher, AssetSource, CleanupRegistry, EffectiveConfig, FetchOutcome,
    HttpProvider,
};
use tempfile::TempDir;

/// URL on a port that was just bound and released: connections are refused.
fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}/model.safetensors", port)
}

fn http_descriptor(dest_dir: &Path, filename: &str) -> AssetDescriptor {
    AssetDescriptor {
        name: "test-model".to_string(),
        source: AssetSource::Http {
            url: dead_url(),
            provider: HttpProvider::HuggingFace,
        },
        dest_dir: dest_dir.to_path_buf(),
        expected_filename: filename.to_string(),
        required: false,
        expected_sha256: None,
    }
}

fn fetcher(config: &EffectiveConfig) -> AssetFetcher {
    AssetFetcher::from_config(config, CleanupRegistry::default()).unwrap()
}

#[tokio::test]
async fn present_file_is_skipped_twice_without_network() {
    let tmp = TempDir::new().unwrap();
    let desc = http_descriptor(tmp.path(), "model.safetensors");
    std::fs::write(desc.destination(), b"already here").unwrap();

    let fetcher = fetcher(&EffectiveConfig::default());
    // The URL refuses connections, so anything but Skipped means the
    // fetcher touched the network.
    assert_eq!(fetcher.fetch(&desc).await, FetchOutcome::Skipped);
    assert_eq!(fetcher.fetch(&desc).await, FetchOutcome::Skipped);
    assert_eq!(std::fs::read(desc.destination()).unwrap(), b"already here");
}

#[tokio::test]
async fn zero_size_file_does_not_satisfy_the_existence_check() {
    let tmp = TempDir::new().unwrap();
    let desc = http_descriptor(tmp.path(), "model.safetensors");
    std::fs::write(desc.destination(), b"").unwrap();

    let fetcher = fetcher(&EffectiveConfig::default());
    match fetcher.fetch(&desc).await {
        FetchOutcome::Failed(_) => {}
        other => panic!("expected a download attempt to fail, got {:?}", other),
    }
}

#[tokio::test]
async fn dry_run_fetches_nothing_but_still_validates() {
    let tmp = TempDir::new().unwrap();
    let mut config = EffectiveConfig::default();
    config.dry_run = true;
    let fetcher = fetcher(&config);

    // Absent file: reported as a planned download, nothing materialized.
    let desc = http_descriptor(tmp.path(), "model.safetensors");
    assert_eq!(fetcher.fetch(&desc).await, FetchOutcome::Downloaded);
    assert!(!desc.destination().exists());

    // Invalid descriptors still fail in dry-run.
    let mut broken = http_descriptor(tmp.path(), "model.safetensors");
    broken.expected_filename = String::new();
    match fetcher.fetch(&broken).await {
        FetchOutcome::Failed(_) => {}
        other => panic!("expected validation failure, got {:?}", other),
    }
}

#[tokio::test]
async fn object_store_without_endpoint_fails_with_a_reason() {
    let tmp = TempDir::new().unwrap();
    let desc = AssetDescriptor {
        name: "private-weights".to_string(),
        source: AssetSource::ObjectStore {
            key: "checkpoints/private.safetensors".to_string(),
        },
        dest_dir: tmp.path().to_path_buf(),
        expected_filename: "private.safetensors".to_string(),
        required: false,
        expected_sha256: None,
    };

    let fetcher = fetcher(&EffectiveConfig::default());
    match fetcher.fetch(&desc).await {
        FetchOutcome::Failed(reason) => assert!(reason.contains("no endpoint")),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn failed_checkout_update_keeps_the_stale_copy() {
    let tmp = TempDir::new().unwrap();
    let desc = AssetDescriptor {
        name: "plugin-nodes".to_string(),
        source: AssetSource::VersionControl {
            repo_url: "file:///nonexistent/repo.git".to_string(),
        },
        dest_dir: tmp.path().to_path_buf(),
        expected_filename: "plugin-nodes".to_string(),
        required: false,
        expected_sha256: None,
    };

    // Fake a pre-existing checkout whose remote is unreachable.
    let checkout = desc.destination();
    std::fs::create_dir_all(checkout.join(".git")).unwrap();
    std::fs::write(checkout.join("node.py"), b"stale but usable").unwrap();

    let fetcher = fetcher(&EffectiveConfig::default());
    assert_eq!(fetcher.fetch(&desc).await, FetchOutcome::Skipped);
    assert_eq!(
        std::fs::read(checkout.join("node.py")).unwrap(),
        b"stale but usable"
    );
}
