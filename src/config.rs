//! Client configuration.

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable holding the broker address.
pub const ENV_URL: &str = "LIGHT_LINK_URL";
/// Environment variable holding the CA certificate path.
pub const ENV_TLS_CA: &str = "LIGHT_LINK_TLS_CA";
/// Environment variable holding the client certificate path.
pub const ENV_TLS_CERT: &str = "LIGHT_LINK_TLS_CERT";
/// Environment variable holding the client key path.
pub const ENV_TLS_KEY: &str = "LIGHT_LINK_TLS_KEY";
/// Environment variable overriding the TLS server name.
pub const ENV_TLS_SERVER_NAME: &str = "LIGHT_LINK_TLS_SERVER_NAME";

/// Broker address used when `LIGHT_LINK_URL` is unset.
pub const DEFAULT_URL: &str = "nats://127.0.0.1:4222";

/// Bucket holding key-value state. Fixed for interop with existing data.
pub const STATE_BUCKET: &str = "light_link_state";

/// Bucket holding uploaded objects. Fixed for interop with existing data.
pub const FILES_BUCKET: &str = "light_link_files";

/// Largest accepted object chunk size.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// TLS material handed to the transport. Negotiation happens there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsOptions {
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub server_name: Option<String>,
}

impl TlsOptions {
    /// Check that every referenced file exists.
    pub fn validate(&self) -> Result<()> {
        for (what, path) in [
            ("CA", &self.ca_file),
            ("certificate", &self.cert_file),
            ("key", &self.key_file),
        ] {
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "TLS {what} file not found: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Reconnect behaviour after an unexpected disconnect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before giving up and closing.
    /// Default: 10
    pub max_reconnects: u32,

    /// Wait before the first attempt; doubled on each further attempt.
    /// Default: 2s
    pub reconnect_wait: Duration,

    /// Upper bound on a single wait.
    /// Default: 30s
    pub max_wait: Duration,
}

impl ReconnectPolicy {
    /// Wait before the given attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.reconnect_wait
            .saturating_mul(1u32 << shift)
            .min(self.max_wait)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_reconnects: 10,
            reconnect_wait: Duration::from_secs(2),
            max_wait: Duration::from_secs(30),
        }
    }
}

/// Client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Broker address.
    pub address: String,

    /// Client name, reported in logs.
    pub name: String,

    /// Optional TLS material.
    pub tls: Option<TlsOptions>,

    /// Reconnect behaviour.
    pub reconnect: ReconnectPolicy,

    /// Timeout for KV and object requests. RPC calls take their own.
    /// Default: 5s
    pub request_timeout: Duration,

    /// Max queued messages per subscription.
    /// Default: 1024
    pub subscription_capacity: usize,

    /// Object chunk size in bytes.
    /// Default: 1 MiB
    pub chunk_size: usize,

    /// Revisions kept per key when the state bucket is first created.
    /// Default: 1
    pub kv_history: u32,

    /// Number of object manifests cached client-side.
    /// Default: 64
    pub manifest_cache_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_URL.to_string(),
            name: "LightLink Client".to_string(),
            tls: None,
            reconnect: ReconnectPolicy::default(),
            request_timeout: Duration::from_secs(5),
            subscription_capacity: 1024,
            chunk_size: 1024 * 1024,
            kv_history: 1,
            manifest_cache_size: 64,
        }
    }
}

impl ClientConfig {
    /// Build a config from the process environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_URL).filter(|u| !u.is_empty()) {
            config.address = url;
        }

        if let (Some(ca), Some(cert), Some(key)) =
            (lookup(ENV_TLS_CA), lookup(ENV_TLS_CERT), lookup(ENV_TLS_KEY))
        {
            config.tls = Some(TlsOptions {
                ca_file: ca.into(),
                cert_file: cert.into(),
                key_file: key.into(),
                server_name: lookup(ENV_TLS_SERVER_NAME),
            });
        }

        config
    }

    /// Reject configurations the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Error::Config("address is empty".into()));
        }
        if self.subscription_capacity == 0 {
            return Err(Error::Config("subscription_capacity must be > 0".into()));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Config(format!(
                "chunk_size must be between 1 and {MAX_CHUNK_SIZE}"
            )));
        }
        if self.kv_history == 0 {
            return Err(Error::Config("kv_history must be > 0".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request_timeout must be > 0".into()));
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }
}
