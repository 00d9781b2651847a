use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::MetadataError;

/// Prefix of every endpoint id (`ENDPOINT_1`, `ENDPOINT_2`, ...)
pub const ENDPOINT_ID_PREFIX: &str = "ENDPOINT_";

/// Default upstream for the ADS-B instance (local dump1090-fa)
pub const DEFAULT_ADSB_HOST: &str = "127.0.0.1";
pub const DEFAULT_ADSB_PORT: u16 = 30005;
/// Default AIS receiver UART
pub const DEFAULT_AIS_DEVICE: &str = "/dev/serial0";
pub const DEFAULT_AIS_BAUD_RATE: u32 = 38400;
/// ADS-B reloads filter and endpoints every 30s while running
pub const DEFAULT_ADSB_RELOAD_SECS: u64 = 30;

const DEFAULT_SOURCE_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_TCP_READ_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_SERIAL_READ_TIMEOUT_MS: u64 = 2_000;

/// Default send attempts per record per endpoint
pub const DEFAULT_SEND_ATTEMPTS: u32 = 3;
pub const DEFAULT_SEND_RETRY_DELAY_MS: u64 = 2_000;
pub const DEFAULT_SEND_CONNECT_TIMEOUT_MS: u64 = 5_000;

pub const DEFAULT_SOURCE_RETRY_MS: u64 = 10_000;
pub const DEFAULT_SESSION_RETRY_MS: u64 = 5_000;
pub const DEFAULT_RESTART_DELAY_MS: u64 = 2_000;
pub const DEFAULT_STOP_GRACE_MS: u64 = 5_000;

/// Text format of the records carried by an instance.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordFormat {
    /// SBS1 (BaseStation) comma separated ADS-B messages
    #[default]
    Sbs1,
    /// NMEA 0183 sentences (AIS)
    Nmea,
}

impl RecordFormat {
    /// Terminator appended to every record written downstream
    pub fn terminator(&self) -> &'static [u8] {
        match self {
            RecordFormat::Sbs1 => b"\n",
            RecordFormat::Nmea => b"\r\n",
        }
    }

    /// Whether records of this format carry an identifier usable by an allow-list
    pub fn supports_allow_list(&self) -> bool {
        matches!(self, RecordFormat::Sbs1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Tcp {
        host: String,
        port: u16,
        #[serde(default = "default_source_connect_timeout_ms")]
        connect_timeout_ms: u64,
        #[serde(default = "default_tcp_read_timeout_ms")]
        read_timeout_ms: u64,
    },
    Serial {
        device: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_serial_read_timeout_ms")]
        read_timeout_ms: u64,
    },
}

fn default_source_connect_timeout_ms() -> u64 {
    DEFAULT_SOURCE_CONNECT_TIMEOUT_MS
}

fn default_tcp_read_timeout_ms() -> u64 {
    DEFAULT_TCP_READ_TIMEOUT_MS
}

fn default_serial_read_timeout_ms() -> u64 {
    DEFAULT_SERIAL_READ_TIMEOUT_MS
}

fn default_baud_rate() -> u32 {
    DEFAULT_AIS_BAUD_RATE
}

impl SourceConfig {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        SourceConfig::Tcp {
            host: host.into(),
            port,
            connect_timeout_ms: DEFAULT_SOURCE_CONNECT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_TCP_READ_TIMEOUT_MS,
        }
    }

    pub fn serial(device: impl Into<String>, baud_rate: u32) -> Self {
        SourceConfig::Serial {
            device: device.into(),
            baud_rate,
            read_timeout_ms: DEFAULT_SERIAL_READ_TIMEOUT_MS,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        match self {
            SourceConfig::Tcp { read_timeout_ms, .. }
            | SourceConfig::Serial { read_timeout_ms, .. } => Duration::from_millis(*read_timeout_ms),
        }
    }
}

impl fmt::Display for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceConfig::Tcp { host, port, .. } => write!(f, "{}:{}", host, port),
            SourceConfig::Serial {
                device, baud_rate, ..
            } => write!(f, "{} @ {} baud", device, baud_rate),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    #[default]
    All,
    /// Legacy files spell this mode `specific`
    #[serde(alias = "specific")]
    AllowList,
}

/// Forwarding policy as persisted. Identifiers are kept as written;
/// [`FilterPolicy::normalized_identifiers`] gives the case-folded set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterPolicy {
    #[serde(default)]
    pub mode: FilterMode,
    #[serde(default)]
    pub identifiers: Vec<String>,
}

impl FilterPolicy {
    pub fn pass_all() -> Self {
        Self::default()
    }

    pub fn allow_list<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: FilterMode::AllowList,
            identifiers: identifiers.into_iter().map(Into::into).collect(),
        }
    }

    /// Trimmed, upper-cased, de-duplicated identifiers; blanks are skipped
    pub fn normalized_identifiers(&self) -> BTreeSet<String> {
        self.identifiers
            .iter()
            .map(|id| id.trim().to_uppercase())
            .filter(|id| !id.is_empty())
            .collect()
    }
}

impl fmt::Display for FilterPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            FilterMode::All => write!(f, "ALL"),
            FilterMode::AllowList => {
                let ids: Vec<String> = self.normalized_identifiers().into_iter().collect();
                write!(f, "[{}]", ids.join(","))
            }
        }
    }
}

/// How an endpoint worker manages its TCP connection
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Open, write, close for every record
    #[default]
    PerRecord,
    /// Keep one connection open, reconnect on failure
    Persistent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    #[serde(default = "default_send_attempts")]
    pub attempts: u32,
    #[serde(default = "default_send_retry_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_send_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_send_attempts() -> u32 {
    DEFAULT_SEND_ATTEMPTS
}

fn default_send_retry_delay_ms() -> u64 {
    DEFAULT_SEND_RETRY_DELAY_MS
}

fn default_send_connect_timeout_ms() -> u64 {
    DEFAULT_SEND_CONNECT_TIMEOUT_MS
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_send_attempts(),
            delay_ms: default_send_retry_delay_ms(),
            connect_timeout_ms: default_send_connect_timeout_ms(),
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Fixed delays used by the engine around the source and its own lifecycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Wait after a failed source open
    #[serde(default = "default_source_retry_ms")]
    pub source_retry_ms: u64,
    /// Wait after a source session ends
    #[serde(default = "default_session_retry_ms")]
    pub session_retry_ms: u64,
    /// Pause between stop and start on restart
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Upper bound on waiting for the forwarding loop to exit
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

fn default_source_retry_ms() -> u64 {
    DEFAULT_SOURCE_RETRY_MS
}

fn default_session_retry_ms() -> u64 {
    DEFAULT_SESSION_RETRY_MS
}

fn default_restart_delay_ms() -> u64 {
    DEFAULT_RESTART_DELAY_MS
}

fn default_stop_grace_ms() -> u64 {
    DEFAULT_STOP_GRACE_MS
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            source_retry_ms: default_source_retry_ms(),
            session_retry_ms: default_session_retry_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl BackoffConfig {
    pub fn source_retry(&self) -> Duration {
        Duration::from_millis(self.source_retry_ms)
    }

    pub fn session_retry(&self) -> Duration {
        Duration::from_millis(self.session_retry_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Endpoint {
    /// Numeric suffix of the id, if it follows the `ENDPOINT_<n>` scheme
    pub fn id_number(&self) -> Option<u64> {
        self.id
            .strip_prefix(ENDPOINT_ID_PREFIX)
            .and_then(|n| n.parse().ok())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Same destination, ignoring name and enabled flag
    pub fn same_target(&self, other: &Endpoint) -> bool {
        self.id == other.id && self.ip == other.ip && self.port == other.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.ip, self.port)
    }
}

/// Fields supplied by the control plane when creating or replacing an endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewEndpoint {
    pub name: String,
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl NewEndpoint {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            port,
            enabled: true,
        }
    }

    pub fn validate(&self) -> Result<(), MetadataError> {
        if self.name.trim().is_empty() {
            return Err(MetadataError::Validation("endpoint name is empty".into()));
        }
        if self.ip.trim().is_empty() {
            return Err(MetadataError::Validation("endpoint ip is empty".into()));
        }
        if self.port == 0 {
            return Err(MetadataError::Validation(
                "endpoint port must be between 1 and 65535".into(),
            ));
        }
        Ok(())
    }

    pub fn into_endpoint(self, id: impl Into<String>) -> Endpoint {
        Endpoint {
            id: id.into(),
            name: self.name.trim().to_string(),
            ip: self.ip.trim().to_string(),
            port: self.port,
            enabled: self.enabled,
        }
    }
}

/// Everything one forwarding instance needs, as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceConfig {
    pub name: String,
    #[serde(default)]
    pub format: RecordFormat,
    pub source: SourceConfig,
    #[serde(default)]
    pub filter: FilterPolicy,
    /// Seconds between live reloads of filter and endpoints; 0 = reload only on (re)start
    #[serde(default)]
    pub reload_interval_secs: u64,
    #[serde(default)]
    pub delivery: DeliveryMode,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// Next id suffix to hand out. Persisted so deleted ids are never reused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_endpoint_id: Option<u64>,
}

impl InstanceConfig {
    /// ADS-B defaults: SBS1 over TCP from dump1090, reload every 30s
    pub fn adsb_defaults() -> Self {
        Self {
            name: "adsb".to_string(),
            format: RecordFormat::Sbs1,
            source: SourceConfig::tcp(DEFAULT_ADSB_HOST, DEFAULT_ADSB_PORT),
            filter: FilterPolicy::pass_all(),
            reload_interval_secs: DEFAULT_ADSB_RELOAD_SECS,
            delivery: DeliveryMode::PerRecord,
            retry: RetryConfig::default(),
            backoff: BackoffConfig::default(),
            endpoints: Vec::new(),
            next_endpoint_id: None,
        }
    }

    /// AIS defaults: NMEA over the Pi UART, no live reload
    pub fn ais_defaults() -> Self {
        Self {
            name: "ais".to_string(),
            format: RecordFormat::Nmea,
            source: SourceConfig::serial(DEFAULT_AIS_DEVICE, DEFAULT_AIS_BAUD_RATE),
            filter: FilterPolicy::pass_all(),
            reload_interval_secs: 0,
            delivery: DeliveryMode::PerRecord,
            retry: RetryConfig::default(),
            backoff: BackoffConfig::default(),
            endpoints: Vec::new(),
            next_endpoint_id: None,
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self, MetadataError> {
        let config: InstanceConfig = serde_yaml::from_str(content)?;
        let config = config.normalized();
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load, falling back to `fallback` on any error.
    /// A broken config file must never take the forwarder down.
    pub fn load_or_default(path: &Path, fallback: &InstanceConfig) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to load instance config, using defaults"
                );
                fallback.clone()
            }
        }
    }

    pub fn to_yaml(&self) -> Result<String, MetadataError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Coerce settings that make no sense for the record format
    pub fn normalized(mut self) -> Self {
        if self.filter.mode == FilterMode::AllowList && !self.format.supports_allow_list() {
            warn!(
                instance = %self.name,
                "allow_list filter is not supported for NMEA records, forwarding everything"
            );
            self.filter = FilterPolicy::pass_all();
        }
        self
    }

    pub fn validate(&self) -> Result<(), MetadataError> {
        if self.retry.attempts == 0 {
            return Err(MetadataError::Validation(
                "retry.attempts must be at least 1".into(),
            ));
        }
        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if !seen.insert(endpoint.id.as_str()) {
                return Err(MetadataError::Validation(format!(
                    "duplicate endpoint id: {}",
                    endpoint.id
                )));
            }
            if endpoint.port == 0 {
                return Err(MetadataError::Validation(format!(
                    "endpoint {} has port 0",
                    endpoint.id
                )));
            }
            if endpoint.ip.trim().is_empty() {
                return Err(MetadataError::Validation(format!(
                    "endpoint {} has no ip",
                    endpoint.id
                )));
            }
        }
        Ok(())
    }

    /// Enabled endpoints in persisted order
    pub fn enabled_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.iter().filter(|e| e.enabled).cloned().collect()
    }

    pub fn endpoint(&self, id: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.id == id)
    }

    /// Suffix for the next new endpoint: never below the persisted counter,
    /// never colliding with an existing id.
    pub fn next_id_number(&self) -> u64 {
        let after_existing = self
            .endpoints
            .iter()
            .filter_map(Endpoint::id_number)
            .max()
            .map(|n| n + 1)
            .unwrap_or(1);
        after_existing.max(self.next_endpoint_id.unwrap_or(1))
    }
}
