//! Configuration management for dropstage.
//!
//! Configuration can be set via environment variables:
//! - `DROPSTAGE_HOST` - Optional. Server host. Defaults to `0.0.0.0`.
//! - `DROPSTAGE_PORT` - Optional. Server port. Defaults to `8402`.
//! - `DROPSTAGE_STAGING_ROOT` - Optional. Root directory for session sandboxes.
//!   Defaults to `{system temp dir}/dropstage`.
//! - `DROPSTAGE_MAX_FILE_BYTES` - Optional. Per-file decoded size cap. Defaults to 50 MiB.
//! - `DROPSTAGE_MAX_BATCH_FILES` - Optional. Per-request file count cap. Defaults to `1000`.
//! - `DROPSTAGE_MAX_IMAGE_BYTES` - Optional. Proxied image size cap. Defaults to 20 MiB.
//! - `DROPSTAGE_ALLOWED_EXTENSIONS` - Optional. Comma-separated extension allow-list.
//! - `DROPSTAGE_PROXY_HOSTS` - Optional. Comma-separated hostname allow-list for remote fetches.
//! - `DROPSTAGE_FETCH_TIMEOUT_SECS` - Optional. Outbound fetch timeout. Defaults to `30`.
//! - `DROPSTAGE_CLEANUP_DELAY_SECS` - Optional. Delay before a downloaded sandbox is deleted.
//!   Defaults to `60`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// File extensions accepted for staged output, lowercase, without the dot.
const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
    "html", "css", "js", "json", "csv", "txt", "md", "png", "jpg", "jpeg", "gif", "webp", "svg",
    "glb", "gltf", "bin", "obj", "mtl", "stl", "patt",
];

/// Hostnames the remote-image proxy is allowed to fetch from.
const DEFAULT_PROXY_HOSTS: &[&str] = &[
    "drive.google.com",
    "drive.usercontent.google.com",
    "lh3.googleusercontent.com",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Size and count limits applied to staged uploads.
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Maximum decoded size of a single staged file, in bytes
    pub max_file_bytes: usize,

    /// Maximum number of file entries in one create-archive request
    pub max_batch_files: usize,

    /// Maximum size of a proxied remote image, in bytes
    pub max_image_bytes: usize,

    /// Closed set of permitted output file extensions (lowercase, no dot)
    pub allowed_extensions: Vec<String>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 50 * 1024 * 1024,
            max_batch_files: 1000,
            max_image_bytes: 20 * 1024 * 1024,
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Outbound fetch policy for the remote-image proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Hostnames remote fetches may target (exact, case-insensitive match)
    pub allowed_hosts: Vec<String>,

    /// Upper bound on a single outbound fetch
    pub fetch_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: DEFAULT_PROXY_HOSTS.iter().map(|s| s.to_string()).collect(),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// Service configuration, built once at startup and treated as immutable.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Root directory under which every session sandbox lives
    pub staging_root: PathBuf,

    /// Delay between a completed archive download and sandbox deletion
    pub cleanup_delay: Duration,

    /// Upload size/count limits
    pub limits: LimitsConfig,

    /// Remote fetch policy
    pub proxy: ProxyConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("DROPSTAGE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = std::env::var("DROPSTAGE_PORT")
            .unwrap_or_else(|_| "8402".to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue("DROPSTAGE_PORT".to_string(), format!("{}", e))
            })?;

        let staging_root = std::env::var("DROPSTAGE_STAGING_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("dropstage"));

        let cleanup_delay = parse_secs("DROPSTAGE_CLEANUP_DELAY_SECS", 60)?;

        let limits = LimitsConfig {
            max_file_bytes: parse_num("DROPSTAGE_MAX_FILE_BYTES", 50 * 1024 * 1024)?,
            max_batch_files: parse_num("DROPSTAGE_MAX_BATCH_FILES", 1000)?,
            max_image_bytes: parse_num("DROPSTAGE_MAX_IMAGE_BYTES", 20 * 1024 * 1024)?,
            allowed_extensions: parse_list(
                "DROPSTAGE_ALLOWED_EXTENSIONS",
                DEFAULT_ALLOWED_EXTENSIONS,
            ),
        };

        let proxy = ProxyConfig {
            allowed_hosts: parse_list("DROPSTAGE_PROXY_HOSTS", DEFAULT_PROXY_HOSTS),
            fetch_timeout: parse_secs("DROPSTAGE_FETCH_TIMEOUT_SECS", 30)?,
        };

        Ok(Self {
            host,
            port,
            staging_root,
            cleanup_delay,
            limits,
            proxy,
        })
    }

    /// Create a config rooted at a given staging directory (useful for testing).
    pub fn new(staging_root: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8402,
            staging_root,
            cleanup_delay: Duration::from_secs(60),
            limits: LimitsConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

fn parse_num(var: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(var.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

fn parse_secs(var: &str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::InvalidValue(var.to_string(), format!("{}", e))),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

/// Parse a comma-separated env list, falling back to a built-in default.
/// Entries are trimmed and lowercased; empty entries are dropped.
fn parse_list(var: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(var) {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}
