//! Gateway configuration.
//!
//! Loads settings from a YAML file with environment variable overrides.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this priority order (highest wins):
//! 1. Environment variables (e.g. `GATEWAY_LISTEN_ADDR`)
//! 2. YAML file (`config.yaml` by default)
//! 3. Built-in defaults
//!
//! # Sections
//!
//! | Section | Purpose |
//! |---------|---------|
//! | `upstream_servers` | The peer fleet: URL, dial address, priority, capabilities |
//! | `server` | Listen address, quorum size, strategies, timeouts, cache and health limits |
//!
//! # Example
//!
//! ```yaml
//! upstream_servers:
//!   - url: https://blossom.example.com
//!     priority: 1
//!     supports_mirror: true
//!   - url: https://cdn.other.example
//!     alternative_address: https://origin.other.example
//!     priority: 2
//!
//! server:
//!   listen_addr: 0.0.0.0:8080
//!   min_upload_servers: 2
//!   redirect_strategy: round_robin
//! ```

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::Path;
use tracing::warn;

// ============================================================================
// Constants
// ============================================================================

/// Slack subtracted from the auth event's expiration when deriving the
/// upload deadline, seconds. Leaves room to finish bookkeeping before the
/// token dies.
pub const UPLOAD_DEADLINE_SLACK_SECS: u64 = 30;

/// Bodies with a declared Content-Length at or below this are buffered in
/// memory and replayed to each peer; larger or unsized bodies are streamed
/// through per-peer pipes instead.
pub const BUFFERED_UPLOAD_MAX_BYTES: u64 = 8 * 1024 * 1024;

/// Maximum accepted mirror request body. Mirror bodies are small JSON
/// documents referencing a remote URL.
pub const MIRROR_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Read an env var, parse it, and apply it to `target`. Logs a warning on parse failure.
fn env_parse<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Ok(val) = std::env::var(var) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env = var,
                value = %val,
                expected_type = std::any::type_name::<T>(),
                "Invalid env var value, using configured value"
            ),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub upstream_servers: Vec<UpstreamServer>,
    #[serde(default)]
    pub server: ServerConfig,
}

/// One upstream Blossom server
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamServer {
    /// Official URL, used in response bodies and log output
    pub url: String,

    /// Optional address used for the actual HTTP connections (bypasses
    /// CDN/proxy limits). The official URL is still the one clients see.
    pub alternative_address: Option<String>,

    /// Lower value = preferred by the `priority` strategy
    #[serde(default)]
    pub priority: i32,

    /// BUD-04: server accepts PUT /mirror
    #[serde(default)]
    pub supports_mirror: bool,

    /// BUD-06: server accepts HEAD /upload preflight
    #[serde(default)]
    pub supports_upload_head: bool,
}

/// Proxy server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Minimum peer successes for a fan-out write to count as successful
    #[serde(default = "default_min_upload_servers")]
    pub min_upload_servers: usize,

    /// Strategy for picking upload/mirror response representatives
    #[serde(default = "default_redirect_strategy")]
    pub redirect_strategy: String,

    /// Strategy for picking download redirect targets
    /// (defaults to `redirect_strategy`)
    pub download_redirect_strategy: Option<String>,

    /// Base URL used by the `local` strategy when building response URLs.
    /// When unset, the URL is derived from the incoming request.
    pub base_url: Option<String>,

    /// Timeout for download/HEAD/DELETE/list/mirror fan-outs, seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Lower clamp for the upload deadline, seconds
    #[serde(default = "default_min_upload_timeout_secs")]
    pub min_upload_timeout_secs: u64,

    /// Upper clamp for the upload deadline, seconds
    #[serde(default = "default_max_upload_timeout_secs")]
    pub max_upload_timeout_secs: u64,

    /// Consecutive failures before a peer is marked unhealthy
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Active fan-out tasks above this count mark the process unhealthy
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,

    /// Resident memory above this count marks the process unhealthy
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,

    /// Time-to-live for hash→peers cache entries, seconds (0 disables expiry)
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Maximum number of entries in the hash→peers cache
    #[serde(default = "default_cache_max_size")]
    pub cache_max_size: usize,

    /// Allowed pubkeys (hex or bech32 `npub…`). Empty disables authentication.
    #[serde(default)]
    pub allowed_pubkeys: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            min_upload_servers: default_min_upload_servers(),
            redirect_strategy: default_redirect_strategy(),
            download_redirect_strategy: None,
            base_url: None,
            timeout_secs: default_timeout_secs(),
            min_upload_timeout_secs: default_min_upload_timeout_secs(),
            max_upload_timeout_secs: default_max_upload_timeout_secs(),
            max_failures: default_max_failures(),
            max_tasks: default_max_tasks(),
            max_memory_bytes: default_max_memory_bytes(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_size: default_cache_max_size(),
            allowed_pubkeys: Vec::new(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_min_upload_servers() -> usize {
    2
}
fn default_redirect_strategy() -> String {
    "round_robin".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_min_upload_timeout_secs() -> u64 {
    5 * 60
}
fn default_max_upload_timeout_secs() -> u64 {
    30 * 60
}
fn default_max_failures() -> u32 {
    5
}
fn default_max_tasks() -> usize {
    1000
}
fn default_max_memory_bytes() -> u64 {
    512 * 1024 * 1024
}
fn default_cache_ttl_secs() -> u64 {
    5 * 60
}
fn default_cache_max_size() -> usize {
    1000
}

impl Config {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: &str) -> Result<Self> {
        let mut config: Config = if Path::new(path).exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {path}"))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse config file {path}"))?
        } else {
            bail!("config file not found: {path}");
        };

        env_parse("GATEWAY_LISTEN_ADDR", &mut config.server.listen_addr);
        env_parse(
            "GATEWAY_MIN_UPLOAD_SERVERS",
            &mut config.server.min_upload_servers,
        );
        if let Ok(val) = std::env::var("GATEWAY_BASE_URL") {
            config.server.base_url = Some(val);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants and normalise URLs. Exposed for tests that build
    /// configs programmatically.
    pub fn validate(&mut self) -> Result<()> {
        if self.upstream_servers.is_empty() {
            bail!("no upstream servers configured");
        }
        if self.upstream_servers.len() < self.server.min_upload_servers {
            bail!(
                "not enough upstream servers: need at least {}, got {}",
                self.server.min_upload_servers,
                self.upstream_servers.len()
            );
        }
        for server in &mut self.upstream_servers {
            if server.url.is_empty() {
                bail!("upstream server with empty url");
            }
            // Trailing slashes would double up when joining paths
            server.url = server.url.trim_end_matches('/').to_string();
            if let Some(alt) = &server.alternative_address {
                server.alternative_address = Some(alt.trim_end_matches('/').to_string());
            }
        }
        if self.server.min_upload_timeout_secs > self.server.max_upload_timeout_secs {
            bail!(
                "min_upload_timeout_secs ({}) exceeds max_upload_timeout_secs ({})",
                self.server.min_upload_timeout_secs,
                self.server.max_upload_timeout_secs
            );
        }
        Ok(())
    }
}
