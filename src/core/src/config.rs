use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StrataError};

/// Default registry used when nothing is configured.
const DEFAULT_REGISTRY_URL: &str = "https://localhost:5000";

/// Default size of one PATCH request in a chunked upload: 50 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// Strata configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    /// Registry endpoint and session settings
    pub registry: RegistryConfig,

    /// Image assembly settings
    pub build: BuildConfig,

    /// Directory holding layer, image and resolved-base products
    pub cache_dir: PathBuf,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            build: BuildConfig::default(),
            cache_dir: default_cache_dir(),
        }
    }
}

impl StrataConfig {
    /// Load configuration from a YAML file.
    ///
    /// Values are not validated here so that environment overrides can still
    /// replace them; call [`StrataConfig::validate`] once they are applied.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            StrataError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: StrataConfig = serde_yaml::from_str(&data)?;
        Ok(config)
    }

    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay `STRATA_REGISTRY_URL`, `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("STRATA_REGISTRY_URL") {
            self.registry.url = url;
        }
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();
        if username.is_some() && password.is_some() {
            self.registry.username = username;
            self.registry.password = password;
        }
    }

    /// Reject values the rest of the pipeline cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(self.registry.url.starts_with("http://") || self.registry.url.starts_with("https://")) {
            return Err(StrataError::ConfigError(format!(
                "registry.url must start with http:// or https://, got '{}'",
                self.registry.url
            )));
        }
        if self.registry.chunk_size == 0 {
            return Err(StrataError::ConfigError(
                "registry.chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.build.concurrency == 0 {
            return Err(StrataError::ConfigError(
                "build.concurrency must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// How blobs are transferred to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    /// One streamed PUT per blob
    #[default]
    Monolithic,
    /// Sequential PATCH requests followed by a closing PUT
    Chunked,
}

impl std::fmt::Display for UploadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monolithic => write!(f, "monolithic"),
            Self::Chunked => write!(f, "chunked"),
        }
    }
}

impl std::str::FromStr for UploadMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "monolithic" => Ok(Self::Monolithic),
            "chunked" => Ok(Self::Chunked),
            _ => Err(format!(
                "unknown upload mode: '{}' (supported: monolithic, chunked)",
                s
            )),
        }
    }
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Base URL, e.g. `https://registry.example.com`
    pub url: String,

    /// Basic auth username (optional)
    pub username: Option<String>,

    /// Basic auth password (optional)
    pub password: Option<String>,

    /// Transport-level retries for GET/HEAD
    pub retries: u32,

    /// Whole-request timeout in seconds (optional)
    pub request_timeout_secs: Option<u64>,

    /// Connect timeout in seconds (optional)
    pub connect_timeout_secs: Option<u64>,

    /// Bytes per PATCH in chunked mode
    pub chunk_size: u64,

    /// Blob upload strategy
    pub upload_mode: UploadMode,

    /// Skip TLS certificate verification
    pub accept_invalid_certs: bool,

    /// Host printed in published image URIs, defaults to the registry host
    pub public_host: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REGISTRY_URL.to_string(),
            username: None,
            password: None,
            retries: 3,
            request_timeout_secs: None,
            connect_timeout_secs: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            upload_mode: UploadMode::Monolithic,
            accept_invalid_certs: false,
            public_host: None,
        }
    }
}

/// Image assembly configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// `architecture` written into every image config
    pub architecture: String,

    /// `os` written into every image config
    pub os: String,

    /// Archive root for application bundle layers
    pub app_root: String,

    /// Maximum concurrent per-layer registry operations
    pub concurrency: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            app_root: "/data/app".to_string(),
            concurrency: 4,
        }
    }
}

/// Determine the default product cache directory.
///
/// `$STRATA_CACHE` wins, then `$XDG_CACHE_HOME/strata`, then `~/.cache/strata`.
pub fn default_cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STRATA_CACHE") {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("XDG_CACHE_HOME") {
        return PathBuf::from(dir).join("strata");
    }
    dirs::home_dir()
        .map(|h| h.join(".cache"))
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("strata")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = StrataConfig::default();
        assert_eq!(config.registry.retries, 3);
        assert_eq!(config.registry.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.registry.upload_mode, UploadMode::Monolithic);
        assert_eq!(config.build.architecture, "amd64");
        assert_eq!(config.build.os, "linux");
        assert_eq!(config.build.app_root, "/data/app");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("strata.yaml");
        fs::write(
            &path,
            "registry:\n  url: https://registry.example.com\n  upload_mode: chunked\n  chunk_size: 1024\nbuild:\n  concurrency: 8\n",
        )
        .unwrap();

        let config = StrataConfig::load(&path).unwrap();
        assert_eq!(config.registry.url, "https://registry.example.com");
        assert_eq!(config.registry.upload_mode, UploadMode::Chunked);
        assert_eq!(config.registry.chunk_size, 1024);
        assert_eq!(config.registry.retries, 3);
        assert_eq!(config.build.concurrency, 8);
        assert_eq!(config.build.os, "linux");
    }

    #[test]
    fn test_load_missing_file() {
        let result = StrataConfig::load(Path::new("/nonexistent/strata.yaml"));
        assert!(matches!(result, Err(StrataError::ConfigError(_))));
    }

    #[test]
    fn test_load_defers_validation_until_overrides_apply() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("strata.yaml");
        fs::write(&path, "registry:\n  url: registry.example.com\n").unwrap();

        let mut config = StrataConfig::load(&path).unwrap();
        assert!(matches!(config.validate(), Err(StrataError::ConfigError(_))));

        // What an environment override would do
        config.registry.url = "https://registry.example.com".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_zero_chunk_size() {
        let mut config = StrataConfig::default();
        config.registry.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_upload_mode_from_str() {
        assert_eq!("monolithic".parse::<UploadMode>().unwrap(), UploadMode::Monolithic);
        assert_eq!("chunked".parse::<UploadMode>().unwrap(), UploadMode::Chunked);
        assert!("resumable".parse::<UploadMode>().is_err());
    }

    #[test]
    fn test_upload_mode_display() {
        assert_eq!(UploadMode::Monolithic.to_string(), "monolithic");
        assert_eq!(UploadMode::Chunked.to_string(), "chunked");
    }
}
