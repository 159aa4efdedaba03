//! Configuration for sftp-sync
//!
//! A single TOML file describes the endpoint and the transfer policy:
//!
//! ```toml
//! [endpoint]
//! host = "build.example.com"
//! username = "deploy"
//! private_key = "~/.ssh/id_ed25519"
//!
//! [transfer]
//! source = "build/libs"
//! remote_dir = "/srv/artifacts"
//! delete_extraneous = true
//! ```
//!
//! CLI flags override individual fields; `validate()` runs after merging.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{SyncError, SyncResult};

/// How the session authenticates against the endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Password (or keyboard-interactive fallback)
    Password(String),
    /// Private key file with optional passphrase
    Key {
        path: PathBuf,
        passphrase: Option<String>,
    },
    /// Probe the default `~/.ssh` identities
    DefaultKeys,
}

/// Remote endpoint description
///
/// Immutable once constructed; owned by the connection manager.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    pub timeout_secs: u64,
    pub keepalive_interval_secs: u64,
}

impl Endpoint {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

/// `[endpoint]` section as it appears on disk
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub private_key: Option<PathBuf>,

    #[serde(default)]
    pub passphrase: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_keepalive_secs")]
    pub keepalive_interval_secs: u64,
}

impl EndpointConfig {
    /// Resolve the on-disk fields into an [`Endpoint`]
    ///
    /// An explicit private key wins over a password; with neither set the
    /// default `~/.ssh` identities are probed at connect time.
    pub fn resolve(&self) -> SyncResult<Endpoint> {
        if self.host.is_empty() {
            return Err(SyncError::Config("endpoint.host must not be empty".into()));
        }
        if self.username.is_empty() {
            return Err(SyncError::Config(
                "endpoint.username must not be empty".into(),
            ));
        }
        if self.private_key.is_some() && self.password.is_some() {
            return Err(SyncError::Config(
                "endpoint.password and endpoint.private_key are mutually exclusive".into(),
            ));
        }

        let auth = if let Some(key) = &self.private_key {
            AuthMethod::Key {
                path: expand_home(key),
                passphrase: self.passphrase.clone(),
            }
        } else if let Some(password) = &self.password {
            AuthMethod::Password(password.clone())
        } else {
            AuthMethod::DefaultKeys
        };

        Ok(Endpoint {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            auth,
            timeout_secs: self.timeout_secs,
            keepalive_interval_secs: self.keepalive_interval_secs,
        })
    }
}

/// `[transfer]` section: what to sync and how hard to try
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Local source tree to upload
    pub source: PathBuf,

    /// Remote target directory
    pub remote_dir: PathBuf,

    /// Remove remote paths with no local counterpart
    #[serde(default)]
    pub delete_extraneous: bool,

    /// Keep executing independent operations after a permanent failure
    #[serde(default)]
    pub continue_on_error: bool,

    /// Maximum attempts per operation (first try included)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff delay, doubled on each retry
    #[serde(default = "default_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upload chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

/// Top-level configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub endpoint: EndpointConfig,
    pub transfer: TransferConfig,
}

impl SyncConfig {
    /// Load and parse a TOML config file
    pub fn load(path: &Path) -> SyncResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: SyncConfig = toml::from_str(&content)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string (used by tests and embedders)
    pub fn from_toml(content: &str) -> SyncResult<Self> {
        let config: SyncConfig =
            toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        self.endpoint.resolve()?;
        if self.transfer.max_attempts == 0 {
            return Err(SyncError::Config(
                "transfer.max_attempts must be at least 1".into(),
            ));
        }
        if self.transfer.chunk_size == 0 {
            return Err(SyncError::Config(
                "transfer.chunk_size must be non-zero".into(),
            ));
        }
        if !self.transfer.remote_dir.is_absolute() {
            return Err(SyncError::Config(
                "transfer.remote_dir must be an absolute path".into(),
            ));
        }
        Ok(())
    }
}

/// Expand a leading `~/` to the user home directory
pub fn expand_home(path: &Path) -> PathBuf {
    let p = path.to_string_lossy();
    if let Some(rest) = p.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

fn default_port() -> u16 {
    22
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_chunk_size() -> usize {
    64 * 1024
}
