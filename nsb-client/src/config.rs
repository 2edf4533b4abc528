//! Client configuration from code, file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which channel binding to dial the daemon with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Three TCP connections, length-prefixed frames.
    #[default]
    Socket,
    /// AMQP broker; one queue per channel.
    Broker,
}

/// Connection parameters. File: ~/.config/nsb/client.toml or /etc/nsb/client.toml.
/// Env overrides: NSB_SERVER_ADDRESS, NSB_SERVER_PORT, NSB_TRANSPORT, NSB_CONNECT_TIMEOUT, NSB_RESPONSE_TIMEOUT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Daemon (or broker) address (default 127.0.0.1).
    #[serde(default = "default_server_address")]
    pub server_address: String,
    /// Daemon (or broker) port (default 65432).
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default)]
    pub transport: TransportKind,
    /// How long to keep dialing before giving up (default 10s).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: f64,
    /// How long to wait for a daemon reply (default 600s).
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: f64,
    /// Exchange the broker binding publishes to (default "nsb").
    #[serde(default = "default_broker_exchange")]
    pub broker_exchange: String,
}

fn default_server_address() -> String {
    "127.0.0.1".to_string()
}
fn default_server_port() -> u16 {
    65432
}
fn default_connect_timeout() -> f64 {
    10.0
}
fn default_response_timeout() -> f64 {
    600.0
}
fn default_broker_exchange() -> String {
    "nsb".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            server_port: default_server_port(),
            transport: TransportKind::default(),
            connect_timeout_secs: default_connect_timeout(),
            response_timeout_secs: default_response_timeout(),
            broker_exchange: default_broker_exchange(),
        }
    }
}

impl ClientConfig {
    pub fn new(server_address: impl Into<String>, server_port: u16) -> Self {
        Self {
            server_address: server_address.into(),
            server_port,
            ..Self::default()
        }
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_broker_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.broker_exchange = exchange.into();
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        secs_or(self.connect_timeout_secs, default_connect_timeout())
    }

    pub fn response_timeout(&self) -> Duration {
        secs_or(self.response_timeout_secs, default_response_timeout())
    }

    /// `host:port` of the daemon, for log and error messages.
    pub fn server(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }

    /// Parse a config file. Missing keys take their defaults; unknown keys are rejected.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&s)?)
    }

    /// Apply NSB_* environment overrides. Unparseable values are ignored.
    pub fn apply_env(mut self) -> Self {
        if let Ok(s) = std::env::var("NSB_SERVER_ADDRESS") {
            if !s.is_empty() {
                self.server_address = s;
            }
        }
        if let Ok(s) = std::env::var("NSB_SERVER_PORT") {
            if let Ok(p) = s.parse::<u16>() {
                self.server_port = p;
            }
        }
        if let Ok(s) = std::env::var("NSB_TRANSPORT") {
            match s.to_ascii_lowercase().as_str() {
                "socket" => self.transport = TransportKind::Socket,
                "broker" => self.transport = TransportKind::Broker,
                _ => {}
            }
        }
        if let Ok(s) = std::env::var("NSB_CONNECT_TIMEOUT") {
            if let Ok(t) = s.parse::<f64>() {
                self.connect_timeout_secs = t;
            }
        }
        if let Ok(s) = std::env::var("NSB_RESPONSE_TIMEOUT") {
            if let Ok(t) = s.parse::<f64>() {
                self.response_timeout_secs = t;
            }
        }
        self
    }
}

fn secs_or(secs: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or_else(|_| Duration::from_secs_f64(fallback))
}

/// Error reading a config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> ClientConfig {
    load_file().unwrap_or_default().apply_env()
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nsb/client.toml"));
    }
    out.push(PathBuf::from("/etc/nsb/client.toml"));
    out
}

fn load_file() -> Option<ClientConfig> {
    for p in config_paths() {
        if p.exists() {
            match ClientConfig::from_file(&p) {
                Ok(c) => return Some(c),
                Err(e) => {
                    tracing::warn!(path = %p.display(), error = %e, "ignoring unreadable config file");
                }
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_fills_defaults() {
        let c: ClientConfig = toml::from_str("server_port = 7000\ntransport = \"broker\"").unwrap();
        assert_eq!(c.server_address, "127.0.0.1");
        assert_eq!(c.server_port, 7000);
        assert_eq!(c.transport, TransportKind::Broker);
        assert_eq!(c.connect_timeout(), Duration::from_secs(10));
        assert_eq!(c.response_timeout(), Duration::from_secs(600));
        assert_eq!(c.broker_exchange, "nsb");
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<ClientConfig>("bogus = 1").is_err());
    }

    #[test]
    fn fractional_and_invalid_timeouts() {
        let c = ClientConfig::new("10.0.0.2", 1).with_connect_timeout(Duration::from_millis(1500));
        assert_eq!(c.connect_timeout(), Duration::from_millis(1500));
        let c = ClientConfig {
            response_timeout_secs: -3.0,
            ..ClientConfig::default()
        };
        assert_eq!(c.response_timeout(), Duration::from_secs(600));
    }
}
