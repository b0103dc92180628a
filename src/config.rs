//! Agent configuration
//!
//! Sources, later ones win:
//!
//! ```text
//! defaults ──► JSON file ($FLOWTRACE_CONFIG) ──► FLOWTRACE_* environment
//! ```
//!
//! | variable                               | field                        |
//! |----------------------------------------|------------------------------|
//! | FLOWTRACE_EXTERNAL_NETWORKS_WHITELIST  | external_networks_whitelist  |
//! | FLOWTRACE_EPHEMERAL_PORT_RANGE         | ephemeral_port_range         |
//! | FLOWTRACE_TRACES_ENDPOINT              | traces_endpoint              |
//! | FLOWTRACE_INSECURE_SKIP_VERIFY         | insecure_skip_verify         |
//! | FLOWTRACE_API_KEY                      | api_key                      |
//! | FLOWTRACE_SCAN_INTERVAL                | scan_interval_secs           |
//! | FLOWTRACE_METRICS_LISTEN               | metrics_listen               |
//! | FLOWTRACE_MACHINE_ID                   | machine_id                   |
//! | FLOWTRACE_HOSTNAME                     | hostname                     |
//! | FLOWTRACE_LOG_JSON                     | log_json                     |
//! | FLOWTRACE_PROBES_OBJECT                | probes_object                |
//!
//! The whitelist variable is a comma-separated list of CIDR prefixes.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::net::{DestinationFilter, FilterError, IpPrefix, PortFilter};
use crate::telemetry::{AgentIdentity, TracesConfig};

/// Environment variable naming the JSON config file.
pub const CONFIG_PATH_ENV: &str = "FLOWTRACE_CONFIG";

const ENV_PREFIX: &str = "FLOWTRACE_";
const DEFAULT_PROBES_OBJECT: &str = "/usr/lib/flowtrace/probes.o";
const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read
    Io(PathBuf, std::io::Error),
    /// The config file is not valid JSON for this schema
    Parse(serde_json::Error),
    /// A setting has a value that cannot be used
    InvalidValue { key: String, message: String },
    /// A network or port filter setting is malformed
    Filter(FilterError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "failed to read {}: {}", path.display(), e),
            ConfigError::Parse(e) => write!(f, "invalid config file: {}", e),
            ConfigError::InvalidValue { key, message } => write!(f, "invalid {}: {}", key, message),
            ConfigError::Filter(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<FilterError> for ConfigError {
    fn from(e: FilterError) -> Self {
        ConfigError::Filter(e)
    }
}

/// Agent settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Public prefixes treated like private networks.
    pub external_networks_whitelist: Vec<String>,
    /// Ephemeral port range `"<from>-<to>"`; listen ports inside it are ignored.
    pub ephemeral_port_range: Option<String>,
    /// OTLP/HTTP collector URL. Tracing is disabled when unset.
    pub traces_endpoint: Option<String>,
    pub insecure_skip_verify: bool,
    pub api_key: Option<String>,
    /// Seconds between process table scans.
    pub scan_interval_secs: u64,
    /// Address for the Prometheus scrape endpoint.
    pub metrics_listen: Option<SocketAddr>,
    pub machine_id: Option<String>,
    pub hostname: Option<String>,
    /// Emit logs as JSON lines.
    pub log_json: bool,
    /// Compiled eBPF probes object.
    pub probes_object: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            external_networks_whitelist: Vec::new(),
            ephemeral_port_range: None,
            traces_endpoint: None,
            insecure_skip_verify: false,
            api_key: None,
            scan_interval_secs: 5,
            metrics_listen: None,
            machine_id: None,
            hostname: None,
            log_json: false,
            probes_object: None,
        }
    }
}

impl AgentConfig {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let env: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        let file = match env.get(CONFIG_PATH_ENV) {
            Some(path) if !path.is_empty() => Some(read_file(Path::new(path))?),
            _ => None,
        };
        Self::from_sources(file.as_deref(), &env)
    }

    /// Build from optional JSON file contents and an environment snapshot.
    pub fn from_sources(
        file: Option<&str>,
        env: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match file {
            Some(json) => serde_json::from_str(json).map_err(ConfigError::Parse)?,
            None => AgentConfig::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, env: &HashMap<String, String>) -> Result<(), ConfigError> {
        let get = |name: &str| {
            env.get(&format!("{}{}", ENV_PREFIX, name))
                .map(|v| v.trim().to_string())
        };

        if let Some(v) = get("EXTERNAL_NETWORKS_WHITELIST") {
            self.external_networks_whitelist = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = get("EPHEMERAL_PORT_RANGE") {
            self.ephemeral_port_range = non_empty(v);
        }
        if let Some(v) = get("TRACES_ENDPOINT") {
            self.traces_endpoint = non_empty(v);
        }
        if let Some(v) = get("INSECURE_SKIP_VERIFY") {
            self.insecure_skip_verify = parse_bool("FLOWTRACE_INSECURE_SKIP_VERIFY", &v)?;
        }
        if let Some(v) = get("API_KEY") {
            self.api_key = non_empty(v);
        }
        if let Some(v) = get("SCAN_INTERVAL") {
            self.scan_interval_secs = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "FLOWTRACE_SCAN_INTERVAL".to_string(),
                message: format!("{:?} is not a number of seconds", v),
            })?;
        }
        if let Some(v) = get("METRICS_LISTEN") {
            self.metrics_listen = match non_empty(v) {
                Some(addr) => Some(addr.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "FLOWTRACE_METRICS_LISTEN".to_string(),
                    message: format!("{:?} is not a socket address", addr),
                })?),
                None => None,
            };
        }
        if let Some(v) = get("MACHINE_ID") {
            self.machine_id = non_empty(v);
        }
        if let Some(v) = get("HOSTNAME") {
            self.hostname = non_empty(v);
        }
        if let Some(v) = get("LOG_JSON") {
            self.log_json = parse_bool("FLOWTRACE_LOG_JSON", &v)?;
        }
        if let Some(v) = get("PROBES_OBJECT") {
            self.probes_object = non_empty(v).map(PathBuf::from);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "scan_interval_secs".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        for raw in self.external_networks_whitelist.iter().map(|s| s.trim()) {
            if !raw.is_empty() {
                raw.parse::<IpPrefix>()
                    .map_err(|e| FilterError::InvalidNetwork(raw.to_string(), e))?;
            }
        }
        self.port_filter()?;
        Ok(())
    }

    /// Request headers sent to the collector.
    pub fn auth_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            headers.insert("X-Api-Key".to_string(), key.to_string());
        }
        headers
    }

    pub fn traces_config(&self) -> TracesConfig {
        TracesConfig {
            endpoint: self.traces_endpoint.clone(),
            insecure_skip_verify: self.insecure_skip_verify,
            headers: self.auth_headers(),
        }
    }

    pub fn destination_filter(&self) -> Result<DestinationFilter, ConfigError> {
        Ok(DestinationFilter::from_prefixes(&self.external_networks_whitelist)?)
    }

    pub fn port_filter(&self) -> Result<Option<PortFilter>, ConfigError> {
        Ok(PortFilter::from_setting(self.ephemeral_port_range.as_deref())?)
    }

    pub fn probes_object(&self) -> PathBuf {
        self.probes_object
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PROBES_OBJECT))
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// Host identity: configured values, else `/etc/machine-id` and the
    /// kernel hostname.
    pub fn identity(&self, version: &str) -> AgentIdentity {
        let machine_id = self
            .machine_id
            .clone()
            .or_else(read_machine_id)
            .unwrap_or_default();
        let hostname = self.hostname.clone().or_else(system_hostname).unwrap_or_default();
        AgentIdentity {
            machine_id,
            hostname,
            version: version.to_string(),
        }
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
}

fn non_empty(v: String) -> Option<String> {
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

fn parse_bool(key: &str, v: &str) -> Result<bool, ConfigError> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{:?} is not a boolean", v),
        }),
    }
}

fn read_machine_id() -> Option<String> {
    MACHINE_ID_PATHS
        .iter()
        .filter_map(|p| fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
}

fn system_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
}
