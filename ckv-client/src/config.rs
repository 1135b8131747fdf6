//! # Client Configuration
//!
//! `ClientConfig` is deserialized with serde and validated once, when the
//! client is constructed. Validation errors surface synchronously from
//! [`crate::Client::new`], never from commands.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Error;
use crate::policy::{BatchPolicy, Policy, ReadPolicy, RemovePolicy, WritePolicy};

/// Smallest accepted tend interval.
pub const MIN_TEND_INTERVAL_MS: u64 = 10;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("at least one seed host is required")]
    NoHosts,
    #[error("invalid host `{0}`, expected host:port")]
    InvalidHost(String),
    #[error("tend interval must be at least 10ms")]
    InvalidTendInterval,
    #[error("connect timeout must be greater than zero")]
    InvalidConnectTimeout,
    #[error("{0}")]
    InvalidPolicy(String),
    #[error("config parse error: {0}")]
    Parse(String),
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::param(err.to_string())
    }
}

/// Seed address of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Host {
    pub name: String,
    pub port: u16,
}

impl Host {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Host {
            name: name.into(),
            port,
        }
    }

    /// Parses `host:port`; IPv6 literals use brackets (`[::1]:3000`).
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidHost(input.to_string());
        let (name, port) = input.rsplit_once(':').ok_or_else(invalid)?;
        let name = name
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(name);
        if name.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Host::new(name, port))
    }

    /// Address string suitable for socket resolution.
    pub fn address(&self) -> String {
        if self.name.contains(':') {
            format!("[{}]:{}", self.name, self.port)
        } else {
            format!("{}:{}", self.name, self.port)
        }
    }
}

impl FromStr for Host {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Host::parse(s)
    }
}

impl TryFrom<String> for Host {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Host::parse(&value)
    }
}

impl From<Host> for String {
    fn from(host: Host) -> Self {
        host.address()
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

/// Verbosity of the driver's log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub level: LogLevel,
}

/// Policies applied when a command is issued without one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefaultPolicies {
    pub read: ReadPolicy,
    pub write: WritePolicy,
    pub remove: RemovePolicy,
    pub batch: BatchPolicy,
}

/// Driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Seed nodes; the rest of the cluster is discovered by tending.
    pub hosts: Vec<Host>,
    /// Expected cluster name; nodes reporting another name are rejected.
    pub cluster_name: Option<String>,
    pub policies: DefaultPolicies,
    /// Connection cap per node. Zero makes every data command fail with
    /// `NoMoreConnections`.
    pub max_conns_per_node: usize,
    pub max_idle_per_node: usize,
    pub connect_timeout_ms: u64,
    pub tend_interval_ms: u64,
    pub log: LogConfig,
    /// Capture a call site for every command (costly).
    pub capture_stack_traces: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            hosts: Vec::new(),
            cluster_name: None,
            policies: DefaultPolicies::default(),
            max_conns_per_node: 100,
            max_idle_per_node: 16,
            connect_timeout_ms: 1000,
            tend_interval_ms: 1000,
            log: LogConfig::default(),
            capture_stack_traces: false,
        }
    }
}

impl ClientConfig {
    /// Configuration with a single seed host and defaults elsewhere.
    pub fn with_host(host: Host) -> Self {
        ClientConfig {
            hosts: vec![host],
            ..ClientConfig::default()
        }
    }

    /// Parses and validates a JSON document.
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig =
            serde_json::from_str(input).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::NoHosts);
        }
        if self.tend_interval_ms < MIN_TEND_INTERVAL_MS {
            return Err(ConfigError::InvalidTendInterval);
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConnectTimeout);
        }
        let policies = &self.policies;
        let checks = [
            policies.read.validate(),
            policies.write.validate(),
            policies.remove.validate(),
            policies.batch.validate(),
        ];
        for check in checks {
            check.map_err(|err| ConfigError::InvalidPolicy(err.message().to_string()))?;
        }
        Ok(())
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[inline]
    pub fn tend_interval(&self) -> Duration {
        Duration::from_millis(self.tend_interval_ms)
    }
}
