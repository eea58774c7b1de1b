//! Configuration files.
//!
//! Both binaries read a TOML file. Durations are stored as integer seconds
//! or milliseconds; every field has a default, so an empty file is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mux::buf::BUFFER_SIZE;
use crate::mux::frame::{Destination, META_LEN_MAX};
use crate::mux::{ClientStrategy, PoolConfig, RetryPolicy};

/// Client (port-forward) configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local listen address
    pub listen_addr: String,
    /// Mux server address
    pub server_addr: String,
    /// Destination the server connects every session to
    pub forward_addr: String,
    /// "tcp" or "udp"
    pub forward_network: String,
    /// Max live sessions per transport (0 = unlimited)
    pub max_concurrency: usize,
    /// Max sessions over a transport's lifetime (0 = unlimited)
    pub max_connection: u64,
    /// Idle transport check period (seconds, 0 disables)
    pub idle_timeout_secs: u64,
    /// Per-session read buffer (bytes)
    pub buffer_size: usize,
    /// Live sessions per transport above which a spare transport is opened
    pub worker_ratio: f64,
    /// Transport connect timeout (seconds)
    pub connect_timeout_secs: u64,
    /// Transport connect attempts
    pub retry_max_attempts: u32,
    /// First retry delay (milliseconds)
    pub retry_initial_backoff_ms: u64,
    /// Retry delay cap (milliseconds)
    pub retry_max_backoff_ms: u64,
    /// Retry delay growth factor
    pub retry_multiplier: f64,
    /// Randomize retry delays
    pub retry_jitter: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let strategy = ClientStrategy::default();
        let retry = RetryPolicy::default();
        Self {
            listen_addr: "127.0.0.1:1080".into(),
            server_addr: "127.0.0.1:8443".into(),
            forward_addr: "127.0.0.1:22".into(),
            forward_network: "tcp".into(),
            max_concurrency: strategy.max_concurrency,
            max_connection: strategy.max_connection,
            idle_timeout_secs: strategy.idle_timeout.as_secs(),
            buffer_size: BUFFER_SIZE,
            worker_ratio: 7.5,
            connect_timeout_secs: 10,
            retry_max_attempts: retry.max_attempts,
            retry_initial_backoff_ms: retry.initial_backoff.as_millis() as u64,
            retry_max_backoff_ms: retry.max_backoff.as_millis() as u64,
            retry_multiplier: retry.multiplier,
            retry_jitter: retry.jitter,
        }
    }
}

impl ClientConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = read_toml(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        check_addr("listen_addr", &self.listen_addr)?;
        check_addr("server_addr", &self.server_addr)?;
        check_addr("forward_addr", &self.forward_addr)?;
        self.forward_destination()?;

        if self.buffer_size == 0 {
            return Err(Error::config("buffer_size must be positive"));
        }
        if !self.worker_ratio.is_finite() || self.worker_ratio <= 0.0 {
            return Err(Error::config("worker_ratio must be a positive number"));
        }
        if self.retry_max_attempts == 0 {
            return Err(Error::config("retry_max_attempts must be at least 1"));
        }
        if !self.retry_multiplier.is_finite() || self.retry_multiplier < 1.0 {
            return Err(Error::config("retry_multiplier must be at least 1.0"));
        }
        if self.retry_initial_backoff_ms > self.retry_max_backoff_ms {
            return Err(Error::config(
                "retry_initial_backoff_ms cannot exceed retry_max_backoff_ms",
            ));
        }
        Ok(())
    }

    /// Destination every forwarded connection is sent to.
    pub fn forward_destination(&self) -> Result<Destination> {
        match self.forward_network.as_str() {
            "tcp" => Ok(Destination::tcp(self.forward_addr.clone())),
            "udp" => Ok(Destination::udp(self.forward_addr.clone())),
            other => Err(Error::config(format!(
                "forward_network must be \"tcp\" or \"udp\", got {:?}",
                other
            ))),
        }
    }

    /// Transport connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Worker admission strategy.
    pub fn strategy(&self) -> ClientStrategy {
        ClientStrategy {
            max_concurrency: self.max_concurrency,
            max_connection: self.max_connection,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            buffer_size: self.buffer_size,
        }
    }

    /// Transport connect retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            multiplier: self.retry_multiplier,
            jitter: self.retry_jitter,
        }
    }

    /// Pool settings.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            worker_ratio: self.worker_ratio,
            strategy: self.strategy(),
            retry: self.retry_policy(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Transport listen address
    pub listen_addr: String,
    /// Loop every session back instead of dialing its destination
    pub echo: bool,
    /// Upstream connect timeout (seconds)
    pub connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8443".into(),
            echo: false,
            connect_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = read_toml(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        check_addr("listen_addr", &self.listen_addr)?;
        if self.connect_timeout_secs == 0 {
            return Err(Error::config("connect_timeout_secs must be positive"));
        }
        Ok(())
    }

    /// Upstream connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
    toml::from_str(&content).map_err(|e| Error::config(format!("{}: {}", path.display(), e)))
}

/// `host:port` with a numeric port, short enough for a New frame.
fn check_addr(field: &str, addr: &str) -> Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(Error::config(format!("{} must be host:port, got {:?}", field, addr)));
    };
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(Error::config(format!("{} must be host:port, got {:?}", field, addr)));
    }
    // network byte plus address must fit the metadata cap
    if addr.len() + 5 > META_LEN_MAX {
        return Err(Error::config(format!("{} is too long", field)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults_match_runtime_defaults() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.strategy(), ClientStrategy::default());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.pool_config(), PoolConfig::default());
    }

    #[test]
    fn test_empty_file_is_default() {
        let client: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(client, ClientConfig::default());
        let server: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(server, ServerConfig::default());
    }

    #[test]
    fn test_client_toml_roundtrip() {
        let mut config = ClientConfig::default();
        config.forward_network = "udp".into();
        config.max_concurrency = 0;

        let text = config.to_toml().unwrap();
        let parsed: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(
            parsed.forward_destination().unwrap(),
            Destination::udp("127.0.0.1:22")
        );
    }

    #[test]
    fn test_partial_file() {
        let config: ClientConfig = toml::from_str(
            r#"
            server_addr = "mux.example.com:443"
            idle_timeout_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.server_addr, "mux.example.com:443");
        assert_eq!(config.strategy().idle_timeout, Duration::from_secs(60));
        assert_eq!(config.listen_addr, ClientConfig::default().listen_addr);
    }

    #[test]
    fn test_client_validation() {
        let config = ClientConfig {
            forward_network: "sctp".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ClientConfig {
            server_addr: "no-port".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            forward_addr: format!("{}:80", "h".repeat(510)),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            retry_initial_backoff_ms: 10_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            buffer_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_validation() {
        assert!(ServerConfig::default().validate().is_ok());
        let config = ServerConfig {
            listen_addr: ":8443".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = ServerConfig {
            connect_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_reports_path() {
        let err = ServerConfig::load("/nonexistent/server.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/server.toml"));
    }

    #[test]
    fn test_ipv6_addr() {
        assert!(check_addr("listen_addr", "[::1]:8443").is_ok());
    }
}
