//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/dlrelay/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/dlrelay/` (~/.config/dlrelay/)
//! - State/Logs: `$XDG_STATE_HOME/dlrelay/` (~/.local/state/dlrelay/)
//!
//! Every setting has a default, so a missing file is not an error. The
//! environment variables `GA4_PROPERTY`, `SERVER_CONTAINER_URL` and `PORT`
//! override the file, matching the development server.

use crate::error::{Error, Result};
use crate::filter::FilterEngine;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Public loader used when no server container is configured.
pub const PUBLIC_SCRIPT_BASE: &str = "https://www.googletagmanager.com";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Identifiers and endpoint
    #[serde(default)]
    pub relay: RelayConfig,

    /// Event and parameter filtering
    #[serde(default)]
    pub filter: FilterConfig,

    /// Parameter shaping
    #[serde(default)]
    pub params: ParamsConfig,

    /// Carry-over fields
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Per-record dispatch timing
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Transport handle guarding
    #[serde(default)]
    pub guard: GuardConfig,

    /// HTTP delivery
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Development server
    #[serde(default)]
    pub server: ServerConfig,
}

/// Identifiers and endpoint for the measurement property
#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Measurement/property id; also the routing identifier attached to events
    #[serde(default = "default_measurement_id")]
    pub measurement_id: String,

    /// First-party/server-side endpoint base URL (optional)
    #[serde(default)]
    pub server_container_url: Option<String>,

    /// Load the transport script from the server container instead of the public host
    #[serde(default = "default_true")]
    pub load_from_server_container: bool,

    /// Verbose per-event logging
    #[serde(default)]
    pub debug: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            measurement_id: default_measurement_id(),
            server_container_url: None,
            load_from_server_container: true,
            debug: false,
        }
    }
}

impl RelayConfig {
    /// Endpoint without trailing slashes, if one is configured and non-empty.
    pub fn endpoint(&self) -> Option<&str> {
        self.server_container_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .filter(|url| !url.is_empty())
    }

    /// URL the transport script is loaded from.
    pub fn script_url(&self) -> String {
        let base = match self.endpoint() {
            Some(endpoint) if self.load_from_server_container => endpoint,
            _ => PUBLIC_SCRIPT_BASE,
        };
        format!(
            "{}/gtag/js?id={}",
            base,
            urlencoding::encode(&self.measurement_id)
        )
    }
}

fn default_measurement_id() -> String {
    "G-XXXXXXXXXX".to_string()
}

fn default_true() -> bool {
    true
}

/// Event and parameter filtering
#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    /// Event names starting with any of these are never forwarded
    #[serde(default = "default_blocked_event_prefixes")]
    pub blocked_event_prefixes: Vec<String>,

    /// Parameter keys dropped on exact match
    #[serde(default = "default_param_denylist")]
    pub param_denylist: Vec<String>,

    /// Parameter keys dropped on prefix match
    #[serde(default = "default_param_deny_prefixes")]
    pub param_deny_prefixes: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            blocked_event_prefixes: default_blocked_event_prefixes(),
            param_denylist: default_param_denylist(),
            param_deny_prefixes: default_param_deny_prefixes(),
        }
    }
}

fn default_blocked_event_prefixes() -> Vec<String> {
    strings(&["gtm.", "js"])
}

fn default_param_denylist() -> Vec<String> {
    strings(&[
        "send_to",
        "eventCallback",
        "eventTimeout",
        "gtm.uniqueEventId",
        "gtm.start",
        "gtm.element",
        "gtm.elementText",
        "gtm.elementId",
    ])
}

fn default_param_deny_prefixes() -> Vec<String> {
    strings(&["gtm"])
}

/// Parameter shaping
#[derive(Debug, Deserialize, Clone)]
pub struct ParamsConfig {
    /// Keys recognized by the analytics backend and kept at the top level
    #[serde(default = "default_well_known")]
    pub well_known: Vec<String>,

    /// Key the serialized bundle of all other parameters is attached under
    #[serde(default = "default_bundle_param_name")]
    pub bundle_param_name: String,
}

impl Default for ParamsConfig {
    fn default() -> Self {
        Self {
            well_known: default_well_known(),
            bundle_param_name: default_bundle_param_name(),
        }
    }
}

fn default_well_known() -> Vec<String> {
    strings(&[
        // page and link
        "page_location",
        "page_referrer",
        "page_title",
        "link_url",
        "link_domain",
        "engagement_time_msec",
        "debug_mode",
        "non_interaction",
        "user_id",
        "session_id",
        // campaign
        "campaign",
        "source",
        "medium",
        "term",
        "content",
        "gclid",
        "dclid",
        // ecommerce
        "transaction_id",
        "value",
        "currency",
        "tax",
        "shipping",
        "affiliation",
        "coupon",
        "payment_type",
        "shipping_tier",
        "method",
        "items",
        "item_list_name",
        "item_list_id",
        "creative_name",
        "creative_slot",
        "location_id",
        "item_category",
        "item_category2",
        "item_category3",
        "item_category4",
        "item_category5",
        "item_id",
        "item_name",
        // content and media
        "search_term",
        "content_type",
        "content_id",
        "video_title",
        "video_url",
        "video_provider",
    ])
}

fn default_bundle_param_name() -> String {
    "datalayer".to_string()
}

/// Carry-over fields
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PersistenceConfig {
    /// Field names whose last non-empty value is merged into later events
    #[serde(default)]
    pub fields: Vec<String>,
}

/// Per-record dispatch timing
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DispatchConfig {
    /// Spacing between processed records in milliseconds (0 = process inline)
    #[serde(default)]
    pub processing_delay_ms: u64,

    /// Defer processing until the host reports idle time
    #[serde(default)]
    pub idle_scheduling: bool,
}

impl DispatchConfig {
    pub fn processing_delay(&self) -> Duration {
        Duration::from_millis(self.processing_delay_ms)
    }
}

/// Transport handle guarding
#[derive(Debug, Deserialize, Clone)]
pub struct GuardConfig {
    /// Audit writes to the transport handle slot
    #[serde(default)]
    pub enabled: bool,

    /// Characters of the handle description kept in each audit entry
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            preview_chars: default_preview_chars(),
        }
    }
}

fn default_preview_chars() -> usize {
    120
}

/// HTTP delivery
#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    /// HTTP request timeout in seconds
    #[serde(default = "default_transport_timeout")]
    pub timeout_secs: u64,

    /// Max retry attempts for transient failures
    #[serde(default = "default_transport_max_retries")]
    pub max_retries: usize,

    /// Fixed client id (random per run when unset)
    #[serde(default)]
    pub client_id: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_transport_timeout(),
            max_retries: default_transport_max_retries(),
            client_id: None,
        }
    }
}

fn default_transport_timeout() -> u64 {
    30
}

fn default_transport_max_retries() -> usize {
    3
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Development server
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory serving every path outside `/src/`
    #[serde(default = "default_site_root")]
    pub site_root: PathBuf,

    /// Directory serving `/src/*`
    #[serde(default = "default_script_root")]
    pub script_root: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            site_root: default_site_root(),
            script_root: default_script_root(),
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_site_root() -> PathBuf {
    PathBuf::from("test-site")
}

fn default_script_root() -> PathBuf {
    PathBuf::from("src")
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Config {
    /// Load configuration from the default path, then apply env overrides
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        let mut config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Apply `GA4_PROPERTY`, `SERVER_CONTAINER_URL` and `PORT`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("GA4_PROPERTY").filter(|v| !v.is_empty()) {
            self.relay.measurement_id = id;
        }
        if let Some(url) = lookup("SERVER_CONTAINER_URL").filter(|v| !v.is_empty()) {
            self.relay.server_container_url = Some(url);
        }
        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid PORT"),
            }
        }
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.relay.measurement_id.trim().is_empty() {
            return Err(Error::Config("relay.measurement_id must not be empty".to_string()));
        }
        if self.params.bundle_param_name.is_empty() {
            return Err(Error::Config(
                "params.bundle_param_name must not be empty".to_string(),
            ));
        }
        if self
            .params
            .well_known
            .iter()
            .any(|k| *k == self.params.bundle_param_name)
        {
            return Err(Error::Config(format!(
                "params.bundle_param_name {:?} is also a well-known key",
                self.params.bundle_param_name
            )));
        }
        if FilterEngine::new(&self.filter).is_param_denied(&self.params.bundle_param_name) {
            return Err(Error::Config(format!(
                "params.bundle_param_name {:?} is denied by the parameter filter",
                self.params.bundle_param_name
            )));
        }
        if self.transport.timeout_secs == 0 {
            return Err(Error::Config(
                "transport.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/dlrelay/config.toml` (~/.config/dlrelay/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("dlrelay").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/dlrelay/` (~/.local/state/dlrelay/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("dlrelay")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/dlrelay/dlrelay.log` (~/.local/state/dlrelay/dlrelay.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("dlrelay.log")
    }
}
