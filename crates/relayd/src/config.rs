//! Server configuration.
//!
//! Settings are layered, highest precedence first: command-line flags,
//! environment (`RELAY_PORT`, `RELAY_ROOT`, `RELAY_BIND`), an optional TOML
//! file, then built-in defaults. Each layer is a [`PartialConfig`]; the
//! merged result is resolved into a validated [`ServerConfig`].
//!
//! ```toml
//! port = 9000
//! root = "/srv/relay"
//! bind = "127.0.0.1"
//! max_sessions = 50
//! idle_timeout_secs = 300
//! shutdown_grace_secs = 5
//! ```

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::registry::MAX_SESSIONS;

/// Environment variable for the listening port.
pub const ENV_PORT: &str = "RELAY_PORT";

/// Environment variable for the server directory.
pub const ENV_ROOT: &str = "RELAY_ROOT";

/// Environment variable for the bind address.
pub const ENV_BIND: &str = "RELAY_BIND";

/// Default bind address (all interfaces).
pub const DEFAULT_BIND: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Default time in-flight sessions get to finish on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {field}: {reason}")]
    Invalid {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("server directory {0} does not exist or is not a directory")]
    RootNotDirectory(PathBuf),
}

/// Fully resolved server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind: IpAddr,

    /// TCP port; 0 picks an ephemeral port
    pub port: u16,

    /// The server directory
    pub root: PathBuf,

    /// Capacity of the session registry
    pub max_sessions: usize,

    /// Read deadline for each control line; `None` waits forever
    pub idle_timeout: Option<Duration>,

    /// Time in-flight sessions get to finish after shutdown starts
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// Config with defaults for everything but the required settings.
    pub fn new(port: u16, root: impl Into<PathBuf>) -> Self {
        Self {
            bind: DEFAULT_BIND,
            port,
            root: root.into(),
            max_sessions: MAX_SESSIONS,
            idle_timeout: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Socket address to bind.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Checks settings that depend on the environment.
    ///
    /// # Errors
    ///
    /// `ConfigError::RootNotDirectory` if the root is not an existing directory.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.root.is_dir() {
            return Err(ConfigError::RootNotDirectory(self.root.clone()));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid {
                field: "max_sessions",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// One configuration layer. Unset fields fall through to lower layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    #[serde(default)]
    pub bind: Option<IpAddr>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub root: Option<PathBuf>,

    #[serde(default)]
    pub max_sessions: Option<usize>,

    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    #[serde(default)]
    pub shutdown_grace_secs: Option<u64>,
}

impl PartialConfig {
    /// Load a layer from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse a layer from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid TOML or unknown keys.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Layer read from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Layer read from `(name, value)` pairs; unrelated names are ignored.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` if a relay variable does not parse.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut layer = Self::default();

        for (name, value) in vars {
            match name.as_str() {
                ENV_PORT => layer.port = Some(parse_field(ENV_PORT, &value)?),
                ENV_BIND => layer.bind = Some(parse_field(ENV_BIND, &value)?),
                ENV_ROOT if !value.is_empty() => layer.root = Some(PathBuf::from(value)),
                _ => {}
            }
        }

        Ok(layer)
    }

    /// Fills unset fields of `self` from `lower`.
    #[must_use]
    pub fn merge(self, lower: Self) -> Self {
        Self {
            bind: self.bind.or(lower.bind),
            port: self.port.or(lower.port),
            root: self.root.or(lower.root),
            max_sessions: self.max_sessions.or(lower.max_sessions),
            idle_timeout_secs: self.idle_timeout_secs.or(lower.idle_timeout_secs),
            shutdown_grace_secs: self.shutdown_grace_secs.or(lower.shutdown_grace_secs),
        }
    }

    /// Applies defaults and validates.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Missing` if port or root is unset
    /// - `ConfigError::RootNotDirectory` if the root is unusable
    /// - `ConfigError::Invalid` for out-of-range values
    pub fn resolve(self) -> Result<ServerConfig, ConfigError> {
        let port = self.port.ok_or(ConfigError::Missing("port"))?;
        let root = self.root.ok_or(ConfigError::Missing("root"))?;

        let mut config = ServerConfig::new(port, root);
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(max) = self.max_sessions {
            config.max_sessions = max;
        }
        // Zero disables the idle timeout
        config.idle_timeout = self
            .idle_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        if let Some(secs) = self.shutdown_grace_secs {
            config.shutdown_grace = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_field<T>(field: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        field,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
