use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub scan: ScanConfig,

    #[serde(default)]
    pub records: RecordsConfig,

    #[serde(default)]
    pub client: ClientConfig,
}

// ── Session supervision ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Stable session id. Fragments in the record store are keyed by it,
    /// so changing it orphans any previously persisted artifact.
    #[serde(default = "default_session_id")]
    pub id: String,
    /// How long authentication may stay pending before the session is
    /// force-closed.
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    /// Close the session automatically after a period with no work.
    #[serde(default = "default_true")]
    pub idle_close_enabled: bool,
    #[serde(default = "default_idle_close_secs")]
    pub idle_close_secs: u64,
    /// Automation client startup attempts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_session_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_session_id() -> String {
    "primary".into()
}
fn default_auth_timeout_secs() -> u64 {
    120
}
fn default_true() -> bool {
    true
}
fn default_idle_close_secs() -> u64 {
    600
}
fn default_max_retries() -> u32 {
    3
}
fn default_session_retry_delay_ms() -> u64 {
    2000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            id: default_session_id(),
            auth_timeout_secs: default_auth_timeout_secs(),
            idle_close_enabled: true,
            idle_close_secs: default_idle_close_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_session_retry_delay_ms(),
        }
    }
}

impl SessionConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn idle_close_window(&self) -> Duration {
        Duration::from_secs(self.idle_close_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// ── Group scanning ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Budget for one target: resolution plus all membership fetch attempts.
    #[serde(default = "default_per_item_timeout_secs")]
    pub per_item_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_scan_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_per_item_timeout_secs() -> u64 {
    45
}
fn default_scan_retry_delay_ms() -> u64 {
    1500
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            per_item_timeout_secs: default_per_item_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_scan_retry_delay_ms(),
        }
    }
}

impl ScanConfig {
    pub fn per_item_timeout(&self) -> Duration {
        Duration::from_secs(self.per_item_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// ── Remote record store ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordsConfig {
    #[serde(default = "default_records_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Characters per fragment payload. Individual records only accept small
    /// text fields, so the encoded artifact is split at this size.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
}

fn default_records_base_url() -> String {
    "http://127.0.0.1:8721/v1".into()
}
fn default_max_chunk_size() -> usize {
    90_000
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            base_url: default_records_base_url(),
            api_key: None,
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

// ── Automation client (opaque, forwarded to the bridge) ──────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the browser-automation sidecar.
    #[serde(default = "default_client_endpoint")]
    pub endpoint: String,
    /// Automation backend name, passed through verbatim.
    #[serde(default = "default_client_backend")]
    pub backend: String,
    #[serde(default = "default_true")]
    pub headless: bool,
    /// How often the bridge polls the sidecar's event feed.
    #[serde(default = "default_event_poll_ms")]
    pub event_poll_ms: u64,
}

fn default_client_endpoint() -> String {
    "http://127.0.0.1:4711".into()
}
fn default_client_backend() -> String {
    "chromium".into()
}
fn default_event_poll_ms() -> u64 {
    750
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_client_endpoint(),
            backend: default_client_backend(),
            headless: true,
            event_poll_ms: default_event_poll_ms(),
        }
    }
}

impl ClientConfig {
    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_ms)
    }
}

// ── Config impl ──────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());

        Self {
            config_path: home.join(".rollcall").join("config.toml"),
            session: SessionConfig::default(),
            scan: ScanConfig::default(),
            records: RecordsConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Config {
    /// Load `~/.rollcall/config.toml`, writing a starter file on first run.
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        Self::load_or_init_at(&home.join(".rollcall").join("config.toml"))
    }

    pub fn load_or_init_at(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let contents = fs::read_to_string(config_path).with_context(|| {
                format!("Failed to read config file: {}", config_path.display())
            })?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path.to_path_buf();
            config.apply_env_overrides();
            Ok(config)
        } else {
            let mut config = Config::default();
            config.config_path = config_path.to_path_buf();
            config.save()?;
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to config.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("ROLLCALL_RECORDS_API_KEY") {
            if !key.is_empty() {
                self.records.api_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("ROLLCALL_RECORDS_URL") {
            if !url.is_empty() {
                self.records.base_url = url;
            }
        }
        if let Ok(endpoint) = std::env::var("ROLLCALL_CLIENT_ENDPOINT") {
            if !endpoint.is_empty() {
                self.client.endpoint = endpoint;
            }
        }
        if let Ok(val) = std::env::var("ROLLCALL_HEADLESS") {
            self.client.headless = val == "1" || val.eq_ignore_ascii_case("true");
        }
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        fs::write(&self.config_path, toml_str).with_context(|| {
            format!("Failed to write config file: {}", self.config_path.display())
        })?;
        Ok(())
    }
}
