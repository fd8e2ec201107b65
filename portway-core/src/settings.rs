use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Top-level configuration for the Portway gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Gateway node ID (auto-generated if not set)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// HTTP listener configuration
    #[serde(default)]
    pub listener: ListenerSettings,

    /// On-disk configuration roots
    #[serde(default)]
    pub paths: PathSettings,

    /// Rate-limit bucket families
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Response cache + single-flight
    #[serde(default)]
    pub cache: CacheSettings,

    /// SQL executor
    #[serde(default)]
    pub sql: SqlSettings,

    /// Proxy engine
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Traffic audit log
    #[serde(default)]
    pub traffic_log: TrafficLogSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSettings {
    /// Listener address
    #[serde(default = "default_listen_addr")]
    pub addr: SocketAddr,

    /// Maximum request body size (bytes)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Maximum total header size (bytes)
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Root of the endpoint descriptor tree
    #[serde(default = "default_endpoints_root")]
    pub endpoints_root: PathBuf,

    /// Root of the environment settings tree
    #[serde(default = "default_environments_root")]
    pub environments_root: PathBuf,

    /// SQLite token database
    #[serde(default = "default_token_db")]
    pub token_db: PathBuf,
}

/// Per-family bucket configuration. The refill rate is
/// `limit / window_secs` tokens per second, applied continuously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_ip_limit")]
    pub ip_limit: u64,

    #[serde(default = "default_window_secs")]
    pub ip_window_secs: u64,

    #[serde(default = "default_token_limit")]
    pub token_limit: u64,

    #[serde(default = "default_window_secs")]
    pub token_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Default TTL for cached proxy responses (seconds); endpoints may
    /// override via their descriptor.
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,

    /// Cached-entry cap per endpoint (bounds auth-header key variants)
    #[serde(default = "default_cache_max_entries")]
    pub max_entries_per_endpoint: usize,

    /// How long a cache miss waits on the single-flight lock (seconds)
    #[serde(default = "default_lock_wait")]
    pub lock_wait_secs: u64,

    /// Single-flight lock lease (seconds)
    #[serde(default = "default_lock_lease")]
    pub lock_lease_secs: u64,

    /// Lock acquisition retry interval (milliseconds)
    #[serde(default = "default_lock_retry_ms")]
    pub lock_retry_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlSettings {
    #[serde(default = "default_pool_min")]
    pub pool_min: u32,

    #[serde(default = "default_pool_max")]
    pub pool_max: u32,

    /// Command timeout (seconds), also the per-request SQL deadline
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Hard cap on `$top`; requests above it are rejected
    #[serde(default = "default_max_top")]
    pub max_top: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Upstream connect timeout (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Default total upstream request timeout (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficLogSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_traffic_log_path")]
    pub file_path: PathBuf,

    /// Bounded queue capacity; overflow drops the oldest entry
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Size-based rotation threshold (bytes, 0 = daily rotation only)
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,

    /// Rotated files to keep (0 = unlimited)
    #[serde(default = "default_max_rotated")]
    pub max_rotated_files: usize,
}

impl GatewaySettings {
    /// Load configuration from a YAML file + environment variables.
    ///
    /// Environment overrides use the `PORTWAY_` prefix with `__` as the
    /// section separator, e.g. `PORTWAY_LISTENER__ADDR=0.0.0.0:8080`.
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &["portway.yaml", "/etc/portway/portway.yaml", "config/portway.yaml"] {
                if Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        figment = figment.merge(Env::prefixed("PORTWAY_").split("__"));

        let settings: Self = figment.extract()?;
        Ok(settings)
    }
}

// Default implementations

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            listener: ListenerSettings::default(),
            paths: PathSettings::default(),
            rate_limit: RateLimitSettings::default(),
            cache: CacheSettings::default(),
            sql: SqlSettings::default(),
            proxy: ProxySettings::default(),
            traffic_log: TrafficLogSettings::default(),
        }
    }
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            addr: default_listen_addr(),
            max_body_bytes: default_max_body_bytes(),
            max_header_bytes: default_max_header_bytes(),
        }
    }
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            endpoints_root: default_endpoints_root(),
            environments_root: default_environments_root(),
            token_db: default_token_db(),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            ip_limit: default_ip_limit(),
            ip_window_secs: default_window_secs(),
            token_limit: default_token_limit(),
            token_window_secs: default_window_secs(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_cache_ttl(),
            max_entries_per_endpoint: default_cache_max_entries(),
            lock_wait_secs: default_lock_wait(),
            lock_lease_secs: default_lock_lease(),
            lock_retry_ms: default_lock_retry_ms(),
        }
    }
}

impl Default for SqlSettings {
    fn default() -> Self {
        Self {
            pool_min: default_pool_min(),
            pool_max: default_pool_max(),
            command_timeout_secs: default_command_timeout(),
            max_top: default_max_top(),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for TrafficLogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            file_path: default_traffic_log_path(),
            queue_capacity: default_queue_capacity(),
            max_file_size_bytes: default_max_file_size(),
            max_rotated_files: default_max_rotated(),
        }
    }
}

// Serde default functions

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024 // 10 MB
}

fn default_max_header_bytes() -> usize {
    32 * 1024
}

fn default_endpoints_root() -> PathBuf {
    PathBuf::from("endpoints")
}

fn default_environments_root() -> PathBuf {
    PathBuf::from("environments")
}

fn default_token_db() -> PathBuf {
    PathBuf::from("data/tokens.db")
}

fn default_ip_limit() -> u64 {
    100
}

fn default_token_limit() -> u64 {
    200
}

fn default_window_secs() -> u64 {
    60
}

fn default_cache_ttl() -> u64 {
    30
}

fn default_cache_max_entries() -> usize {
    256
}

fn default_lock_wait() -> u64 {
    10
}

fn default_lock_lease() -> u64 {
    30
}

fn default_lock_retry_ms() -> u64 {
    200
}

fn default_pool_min() -> u32 {
    5
}

fn default_pool_max() -> u32 {
    100
}

fn default_command_timeout() -> u64 {
    30
}

fn default_max_top() -> u32 {
    1000
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    30
}

fn default_traffic_log_path() -> PathBuf {
    PathBuf::from("logs/traffic.log")
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}

fn default_max_rotated() -> usize {
    30
}

fn default_true() -> bool {
    true
}
