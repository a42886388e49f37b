//! Static asset manifest.
//!
//! The manifest is compiled into the binary so the provisioner is
//! self-contained. Tiers are cumulative: `minimal` < `base` < `full`;
//! selecting a tier provisions every asset at or below it.

use std::path::Path;

use serde::Deserialize;

use crate::config::EffectiveConfig;
use crate::provisioner::ProvisionError;

use super::fetcher::{AssetDescriptor, AssetSource, HttpProvider};

pub static EMBEDDED_MANIFEST: &str = include_str!("manifest.json");

/// Valid model-set tiers, smallest first.
pub const TIERS: &[&str] = &["minimal", "base", "full"];

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub assets: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    /// Smallest tier that includes this asset.
    pub tier: String,
    pub source: ManifestSource,
    /// Destination subpath under the install dir.
    pub dest: String,
    pub filename: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ManifestSource {
    HuggingFace { url: String },
    Civitai { url: String },
    ObjectStore { key: String },
    Git { repo_url: String },
}

impl Manifest {
    pub fn from_str(content: &str) -> Result<Self, ProvisionError> {
        serde_json::from_str(content)
            .map_err(|e| ProvisionError::Config(format!("invalid asset manifest: {}", e)))
    }

    pub fn embedded() -> Result<Self, ProvisionError> {
        Self::from_str(EMBEDDED_MANIFEST)
    }

    /// Descriptors for the configured model set, destinations resolved
    /// against the install dir. Unknown tier names (in the config or the
    /// manifest) are configuration errors.
    pub fn descriptors_for(
        &self,
        config: &EffectiveConfig,
    ) -> Result<Vec<AssetDescriptor>, ProvisionError> {
        let selected = tier_rank(&config.model_set).ok_or_else(|| {
            ProvisionError::Config(format!(
                "unknown model set {:?}, expected one of {}",
                config.model_set,
                TIERS.join(", ")
            ))
        })?;

        let mut descriptors = Vec::new();
        for entry in &self.assets {
            let rank = tier_rank(&entry.tier).ok_or_else(|| {
                ProvisionError::Config(format!(
                    "asset {} has unknown tier {:?}",
                    entry.name, entry.tier
                ))
            })?;
            if rank > selected {
                continue;
            }
            descriptors.push(entry.to_descriptor(&config.install_dir));
        }
        Ok(descriptors)
    }
}

impl ManifestEntry {
    fn to_descriptor(&self, install_dir: &Path) -> AssetDescriptor {
        let source = match &self.source {
            ManifestSource::HuggingFace { url } => AssetSource::Http {
                url: url.clone(),
                provider: HttpProvider::HuggingFace,
            },
            ManifestSource::Civitai { url } => AssetSource::Http {
                url: url.clone(),
                provider: HttpProvider::Civitai,
            },
            ManifestSource::ObjectStore { key } => AssetSource::ObjectStore { key: key.clone() },
            ManifestSource::Git { repo_url } => AssetSource::VersionControl {
                repo_url: repo_url.clone(),
            },
        };
        AssetDescriptor {
            name: self.name.clone(),
            source,
            dest_dir: install_dir.join(&self.dest),
            expected_filename: self.filename.clone(),
            required: self.required,
            expected_sha256: self.sha256.clone(),
        }
    }
}

fn tier_rank(tier: &str) -> Option<usize> {
    TIERS.iter().position(|t| *t == tier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_manifest_parses() {
        let manifest = Manifest::embedded().unwrap();
        assert!(!manifest.assets.is_empty());
        for entry in &manifest.assets {
            assert!(tier_rank(&entry.tier).is_some(), "bad tier on {}", entry.name);
        }
    }

    #[test]
    fn tiers_are_cumulative() {
        let manifest = Manifest::embedded().unwrap();
        let mut config = EffectiveConfig::default();

        config.model_set = "minimal".to_string();
        let minimal = manifest.descriptors_for(&config).unwrap();
        config.model_set = "base".to_string();
        let base = manifest.descriptors_for(&config).unwrap();
        config.model_set = "full".to_string();
        let full = manifest.descriptors_for(&config).unwrap();

        assert!(minimal.len() <= base.len());
        assert!(base.len() < full.len());
        assert_eq!(full.len(), manifest.assets.len());
    }

    #[test]
    fn unknown_model_set_is_rejected() {
        let manifest = Manifest::embedded().unwrap();
        let mut config = EffectiveConfig::default();
        config.model_set = "everything".to_string();
        assert!(manifest.descriptors_for(&config).is_err());
    }
}
