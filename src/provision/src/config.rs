//! Effective configuration for a provisioning run.
//!
//! Resolution precedence: CLI flag > environment variable > persisted config
//! file > built-in default. The config file is `key=value` lines with `#`
//! comments and shell-style `${VAR}` expansion (earlier keys win over the
//! process environment). Once resolved the struct is immutable and is passed
//! explicitly into every component.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::provisioner::ProvisionError;

/// Default working directory for provisioning state and generated scripts.
pub const DEFAULT_WORK_DIR: &str = "/workspace/studio";

/// Port the studio app listens on by default.
pub const DEFAULT_APP_PORT: u16 = 8188;

/// Port the HTTP API sidecar listens on by default.
pub const DEFAULT_API_PORT: u16 = 8000;

/// Liveness probe path on the app port.
pub const DEFAULT_HEALTH_PATH: &str = "/system_stats";

/// Ordered search list for the persisted config file. The first existing
/// candidate wins; an explicit `--config` path takes precedence over all.
pub const CONFIG_CANDIDATES: &[&str] = &["provision.conf", "/etc/studio/provision.conf"];

/// Fully resolved configuration for one provisioning run.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub work_dir: PathBuf,
    pub install_dir: PathBuf,
    pub runtime_version: String,
    pub auto_mode: bool,
    pub dry_run: bool,
    pub skip_launch: bool,
    pub model_set: String,
    pub listen_host: String,
    pub app_port: u16,
    pub api_port: u16,
    pub external_mount: Option<PathBuf>,
    pub health_path: String,
    pub poll_max_attempts: u32,
    pub poll_interval_secs: u64,
    /// Per-download timeout. 0 keeps downloads unbounded, matching the
    /// bounded readiness poll asymmetry of the original workflow.
    pub download_timeout_secs: u64,
    #[serde(skip_serializing)]
    pub hf_token: Option<String>,
    #[serde(skip_serializing)]
    pub civitai_token: Option<String>,
    pub s3_endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub s3_access_key: Option<String>,
    #[serde(skip_serializing)]
    pub s3_secret_key: Option<String>,
    pub s3_bucket: Option<String>,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        let work_dir = PathBuf::from(DEFAULT_WORK_DIR);
        Self {
            install_dir: work_dir.join("app"),
            work_dir,
            runtime_version: "3.11".to_string(),
            auto_mode: false,
            dry_run: false,
            skip_launch: false,
            model_set: "base".to_string(),
            listen_host: "127.0.0.1".to_string(),
            app_port: DEFAULT_APP_PORT,
            api_port: DEFAULT_API_PORT,
            external_mount: None,
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            poll_max_attempts: 30,
            poll_interval_secs: 2,
            download_timeout_secs: 0,
            hf_token: None,
            civitai_token: None,
            s3_endpoint: None,
            s3_access_key: None,
            s3_secret_key: None,
            s3_bucket: None,
        }
    }
}

/// Partial configuration collected from one source (file, env, or CLI).
/// `None` means "this source did not set the key".
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub install_dir: Option<PathBuf>,
    pub runtime_version: Option<String>,
    pub auto_mode: Option<bool>,
    pub dry_run: Option<bool>,
    pub skip_launch: Option<bool>,
    pub model_set: Option<String>,
    pub listen_host: Option<String>,
    pub app_port: Option<u16>,
    pub api_port: Option<u16>,
    pub external_mount: Option<PathBuf>,
    pub health_path: Option<String>,
    pub poll_max_attempts: Option<u32>,
    pub poll_interval_secs: Option<u64>,
    pub download_timeout_secs: Option<u64>,
    pub hf_token: Option<String>,
    pub civitai_token: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub s3_bucket: Option<String>,
}

impl ConfigOverrides {
    /// Overlay `other` on top of `self`; values set by `other` win.
    pub fn merge(&mut self, other: ConfigOverrides) {
        if other.config_path.is_some() {
            self.config_path = other.config_path;
        }
        if other.work_dir.is_some() {
            self.work_dir = other.work_dir;
        }
        if other.install_dir.is_some() {
            self.install_dir = other.install_dir;
        }
        if other.runtime_version.is_some() {
            self.runtime_version = other.runtime_version;
        }
        if other.auto_mode.is_some() {
            self.auto_mode = other.auto_mode;
        }
        if other.dry_run.is_some() {
            self.dry_run = other.dry_run;
        }
        if other.skip_launch.is_some() {
            self.skip_launch = other.skip_launch;
        }
        if other.model_set.is_some() {
            self.model_set = other.model_set;
        }
        if other.listen_host.is_some() {
            self.listen_host = other.listen_host;
        }
        if other.app_port.is_some() {
            self.app_port = other.app_port;
        }
        if other.api_port.is_some() {
            self.api_port = other.api_port;
        }
        if other.external_mount.is_some() {
            self.external_mount = other.external_mount;
        }
        if other.health_path.is_some() {
            self.health_path = other.health_path;
        }
        if other.poll_max_attempts.is_some() {
            self.poll_max_attempts = other.poll_max_attempts;
        }
        if other.poll_interval_secs.is_some() {
            self.poll_interval_secs = other.poll_interval_secs;
        }
        if other.download_timeout_secs.is_some() {
            self.download_timeout_secs = other.download_timeout_secs;
        }
        if other.hf_token.is_some() {
            self.hf_token = other.hf_token;
        }
        if other.civitai_token.is_some() {
            self.civitai_token = other.civitai_token;
        }
        if other.s3_endpoint.is_some() {
            self.s3_endpoint = other.s3_endpoint;
        }
        if other.s3_access_key.is_some() {
            self.s3_access_key = other.s3_access_key;
        }
        if other.s3_secret_key.is_some() {
            self.s3_secret_key = other.s3_secret_key;
        }
        if other.s3_bucket.is_some() {
            self.s3_bucket = other.s3_bucket;
        }
    }
}

impl EffectiveConfig {
    /// Resolve the effective configuration for this run.
    ///
    /// `env` and `file` overrides are gathered here; callers only supply the
    /// CLI layer. When no config file exists at any candidate path a
    /// commented template is written (never overwriting an existing file,
    /// never in dry-run).
    pub fn resolve(cli: ConfigOverrides) -> Result<Self, ProvisionError> {
        let file_path = find_config_file(cli.config_path.as_deref());

        let mut merged = ConfigOverrides::default();
        if let Some(path) = &file_path {
            let map = parse_config_file(path)?;
            merged.merge(overrides_from_map(&map, &format!("{}", path.display()))?);
            tracing::info!("[Config] Loaded config file {}", path.display());
        }
        merged.merge(overrides_from_env()?);
        merged.merge(cli.clone());

        // Unless set explicitly by some layer, the install dir follows the
        // resolved work dir.
        let install_dir_explicit = merged.install_dir.is_some();
        let mut config = Self::default();
        config.apply(merged);
        if !install_dir_explicit {
            config.install_dir = config.work_dir.join("app");
        }

        if file_path.is_none() {
            let target = cli
                .config_path
                .unwrap_or_else(|| PathBuf::from(CONFIG_CANDIDATES[0]));
            if config.dry_run {
                tracing::info!(
                    "[Config] dry-run: would write template config to {}",
                    target.display()
                );
            } else {
                match write_template(&target) {
                    Ok(()) => {
                        tracing::info!("[Config] Wrote template config to {}", target.display())
                    }
                    Err(e) => tracing::warn!(
                        "[Config] Could not write template config to {}: {}",
                        target.display(),
                        e
                    ),
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Layer one source of overrides onto the config. Later calls win.
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(v) = overrides.work_dir {
            self.work_dir = v;
        }
        if let Some(v) = overrides.install_dir {
            self.install_dir = v;
        }
        if let Some(v) = overrides.runtime_version {
            self.runtime_version = v;
        }
        if let Some(v) = overrides.auto_mode {
            self.auto_mode = v;
        }
        if let Some(v) = overrides.dry_run {
            self.dry_run = v;
        }
        if let Some(v) = overrides.skip_launch {
            self.skip_launch = v;
        }
        if let Some(v) = overrides.model_set {
            self.model_set = v;
        }
        if let Some(v) = overrides.listen_host {
            self.listen_host = v;
        }
        if let Some(v) = overrides.app_port {
            self.app_port = v;
        }
        if let Some(v) = overrides.api_port {
            self.api_port = v;
        }
        if let Some(v) = overrides.external_mount {
            self.external_mount = Some(v);
        }
        if let Some(v) = overrides.health_path {
            self.health_path = v;
        }
        if let Some(v) = overrides.poll_max_attempts {
            self.poll_max_attempts = v;
        }
        if let Some(v) = overrides.poll_interval_secs {
            self.poll_interval_secs = v;
        }
        if let Some(v) = overrides.download_timeout_secs {
            self.download_timeout_secs = v;
        }
        if let Some(v) = overrides.hf_token {
            self.hf_token = Some(v);
        }
        if let Some(v) = overrides.civitai_token {
            self.civitai_token = Some(v);
        }
        if let Some(v) = overrides.s3_endpoint {
            self.s3_endpoint = Some(v);
        }
        if let Some(v) = overrides.s3_access_key {
            self.s3_access_key = Some(v);
        }
        if let Some(v) = overrides.s3_secret_key {
            self.s3_secret_key = Some(v);
        }
        if let Some(v) = overrides.s3_bucket {
            self.s3_bucket = Some(v);
        }
    }

    /// Validate the resolved config.
    ///
    /// The working directory must exist or be creatable (fatal). Port
    /// availability is advisory only: a bound port is logged as a warning
    /// and the run continues.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        check_creatable(&self.work_dir)?;

        for port in [self.app_port, self.api_port] {
            match TcpListener::bind((self.listen_host.as_str(), port)) {
                Ok(listener) => drop(listener),
                Err(e) => tracing::warn!(
                    "[Config] Port {} on {} appears unavailable ({}), continuing",
                    port,
                    self.listen_host,
                    e
                ),
            }
        }
        Ok(())
    }

    /// Liveness URL derived from host, app port, and health path.
    pub fn liveness_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.listen_host, self.app_port, self.health_path
        )
    }
}

/// A path is creatable when its nearest existing ancestor is a directory.
/// The check itself never mutates the filesystem, so dry-run and live runs
/// report identical validation errors.
fn check_creatable(path: &Path) -> Result<(), ProvisionError> {
    if path.exists() {
        if path.is_dir() {
            return Ok(());
        }
        return Err(ProvisionError::Config(format!(
            "working directory {} exists but is not a directory",
            path.display()
        )));
    }
    let mut ancestor = path.parent();
    while let Some(dir) = ancestor {
        if dir.as_os_str().is_empty() {
            // Relative path with no existing prefix resolves against cwd.
            return Ok(());
        }
        if dir.exists() {
            if dir.is_dir() {
                return Ok(());
            }
            return Err(ProvisionError::Config(format!(
                "cannot create {}: ancestor {} is not a directory",
                path.display(),
                dir.display()
            )));
        }
        ancestor = dir.parent();
    }
    Ok(())
}

/// Find the config file: explicit path first, then the candidate list.
fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        tracing::warn!(
            "[Config] --config {} does not exist, falling back to search list",
            path.display()
        );
    }
    CONFIG_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

/// Parse a `key=value` config file with `${VAR}` expansion.
pub fn parse_config_file(path: &Path) -> Result<BTreeMap<String, String>, ProvisionError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ProvisionError::Config(format!("failed to read config file {}: {}", path.display(), e))
    })?;
    Ok(parse_config_str(&content))
}

/// Parse config text. Lines are `KEY=VALUE`; blank lines and `#` comments
/// are skipped; values may reference earlier keys or process environment
/// variables as `${NAME}` or `$NAME`.
pub fn parse_config_str(content: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, raw)) = line.split_once('=') else {
            tracing::warn!("[Config] Skipping malformed line {}: {:?}", lineno + 1, line);
            continue;
        };
        let key = key.trim().to_string();
        let raw = raw.trim().trim_matches('"');
        let value = expand_value(raw, &map);
        map.insert(key, value);
    }
    map
}

/// Shell-style variable expansion: `${NAME}` and `$NAME`. Earlier keys in
/// the same file shadow the process environment; unknown names expand to
/// the empty string.
fn expand_value(raw: &str, earlier: &BTreeMap<String, String>) -> String {
    let lookup = |name: &str| -> String {
        earlier
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
            .unwrap_or_default()
    };

    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                out.push_str(&lookup(&name));
            }
            Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&lookup(&name));
            }
            _ => out.push('$'),
        }
    }
    out
}

/// Every file/env key the resolver understands, in template order.
const KEYS: &[&str] = &[
    "WORK_DIR",
    "INSTALL_DIR",
    "RUNTIME_VERSION",
    "AUTO_MODE",
    "DRY_RUN",
    "SKIP_LAUNCH",
    "MODEL_SET",
    "LISTEN_HOST",
    "APP_PORT",
    "API_PORT",
    "EXTERNAL_MOUNT",
    "HEALTH_PATH",
    "POLL_MAX_ATTEMPTS",
    "POLL_INTERVAL_SECS",
    "DOWNLOAD_TIMEOUT_SECS",
    "HF_TOKEN",
    "CIVITAI_TOKEN",
    "S3_ENDPOINT",
    "S3_ACCESS_KEY",
    "S3_SECRET_KEY",
    "S3_BUCKET",
];

/// Build overrides from a parsed key map. `source` names the origin for
/// error messages. Unknown keys are warned about, not fatal.
pub fn overrides_from_map(
    map: &BTreeMap<String, String>,
    source: &str,
) -> Result<ConfigOverrides, ProvisionError> {
    let mut o = ConfigOverrides::default();
    for (key, value) in map {
        if !KEYS.contains(&key.as_str()) {
            tracing::warn!("[Config] Unknown key {:?} in {}", key, source);
            continue;
        }
        set_key(&mut o, key, value, source)?;
    }
    Ok(o)
}

/// Build overrides from identically-named environment variables.
pub fn overrides_from_env() -> Result<ConfigOverrides, ProvisionError> {
    let mut o = ConfigOverrides::default();
    for key in KEYS {
        if let Ok(value) = std::env::var(key) {
            set_key(&mut o, key, &value, "environment")?;
        }
    }
    Ok(o)
}

fn set_key(
    o: &mut ConfigOverrides,
    key: &str,
    value: &str,
    source: &str,
) -> Result<(), ProvisionError> {
    let bad = |what: &str| {
        ProvisionError::Config(format!(
            "invalid {} value {:?} for {} in {}",
            what, value, key, source
        ))
    };
    match key {
        "WORK_DIR" => o.work_dir = Some(PathBuf::from(value)),
        "INSTALL_DIR" => o.install_dir = Some(PathBuf::from(value)),
        "RUNTIME_VERSION" => o.runtime_version = Some(value.to_string()),
        "AUTO_MODE" => o.auto_mode = Some(parse_bool(value).ok_or_else(|| bad("boolean"))?),
        "DRY_RUN" => o.dry_run = Some(parse_bool(value).ok_or_else(|| bad("boolean"))?),
        "SKIP_LAUNCH" => o.skip_launch = Some(parse_bool(value).ok_or_else(|| bad("boolean"))?),
        "MODEL_SET" => o.model_set = Some(value.to_string()),
        "LISTEN_HOST" => o.listen_host = Some(value.to_string()),
        "APP_PORT" => o.app_port = Some(value.parse().map_err(|_| bad("port"))?),
        "API_PORT" => o.api_port = Some(value.parse().map_err(|_| bad("port"))?),
        "EXTERNAL_MOUNT" => o.external_mount = Some(PathBuf::from(value)),
        "HEALTH_PATH" => o.health_path = Some(value.to_string()),
        "POLL_MAX_ATTEMPTS" => {
            o.poll_max_attempts = Some(value.parse().map_err(|_| bad("integer"))?)
        }
        "POLL_INTERVAL_SECS" => {
            o.poll_interval_secs = Some(value.parse().map_err(|_| bad("integer"))?)
        }
        "DOWNLOAD_TIMEOUT_SECS" => {
            o.download_timeout_secs = Some(value.parse().map_err(|_| bad("integer"))?)
        }
        "HF_TOKEN" => o.hf_token = Some(value.to_string()),
        "CIVITAI_TOKEN" => o.civitai_token = Some(value.to_string()),
        "S3_ENDPOINT" => o.s3_endpoint = Some(value.to_string()),
        "S3_ACCESS_KEY" => o.s3_access_key = Some(value.to_string()),
        "S3_SECRET_KEY" => o.s3_secret_key = Some(value.to_string()),
        "S3_BUCKET" => o.s3_bucket = Some(value.to_string()),
        _ => unreachable!("key list and setter out of sync"),
    }
    Ok(())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Write a commented first-run template. Refuses to overwrite.
pub fn write_template(path: &Path) -> Result<(), ProvisionError> {
    if path.exists() {
        return Err(ProvisionError::Config(format!(
            "refusing to overwrite existing config {}",
            path.display()
        )));
    }
    let defaults = EffectiveConfig::default();
    let template = format!(
        "# studio-provision configuration\n\
         # Every key may also be set through an identically-named environment\n\
         # variable; command-line flags take precedence over both.\n\
         \n\
         WORK_DIR={}\n\
         #INSTALL_DIR=${{WORK_DIR}}/app\n\
         RUNTIME_VERSION={}\n\
         MODEL_SET={}\n\
         LISTEN_HOST={}\n\
         APP_PORT={}\n\
         API_PORT={}\n\
         #EXTERNAL_MOUNT=/mnt/fast-storage\n\
         HEALTH_PATH={}\n\
         POLL_MAX_ATTEMPTS={}\n\
         POLL_INTERVAL_SECS={}\n\
         # 0 = no download timeout\n\
         DOWNLOAD_TIMEOUT_SECS=0\n\
         #HF_TOKEN=\n\
         #CIVITAI_TOKEN=\n\
         #S3_ENDPOINT=\n\
         #S3_ACCESS_KEY=\n\
         #S3_SECRET_KEY=\n\
         #S3_BUCKET=\n",
        defaults.work_dir.display(),
        defaults.runtime_version,
        defaults.model_set,
        defaults.listen_host,
        defaults.app_port,
        defaults.api_port,
        defaults.health_path,
        defaults.poll_max_attempts,
        defaults.poll_interval_secs,
    );
    std::fs::write(path, template).map_err(ProvisionError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_lines_with_comments() {
        let map = parse_config_str("# comment\n\nAPP_PORT=9000\nMODEL_SET=full\n");
        assert_eq!(map.get("APP_PORT").map(String::as_str), Some("9000"));
        assert_eq!(map.get("MODEL_SET").map(String::as_str), Some("full"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn expands_earlier_keys_before_environment() {
        let map = parse_config_str("WORK_DIR=/srv/studio\nINSTALL_DIR=${WORK_DIR}/app\n");
        assert_eq!(
            map.get("INSTALL_DIR").map(String::as_str),
            Some("/srv/studio/app")
        );
    }

    #[test]
    fn bare_dollar_names_expand_too() {
        let map = parse_config_str("MODEL_SET=base\nTAG=$MODEL_SET-v2\n");
        assert_eq!(map.get("TAG").map(String::as_str), Some("base-v2"));
    }

    #[test]
    fn unknown_expansion_is_empty() {
        let map = parse_config_str("X=${DOES_NOT_EXIST_ANYWHERE_123}\n");
        assert_eq!(map.get("X").map(String::as_str), Some(""));
    }

    #[test]
    fn bad_integer_is_a_config_error() {
        let mut map = BTreeMap::new();
        map.insert("APP_PORT".to_string(), "not-a-port".to_string());
        assert!(overrides_from_map(&map, "test").is_err());
    }
}
