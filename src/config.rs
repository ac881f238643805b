//! Daemon configuration.
//!
//! This covers the static part of the configuration: sockets, TLS
//! material, file paths and logging.  Runtime-tunable behaviour (upstream
//! list, blocking, cache sizing, rate limits) lives in the persistent
//! store as [`crate::store::Settings`] so the admin surface can change it
//! without a restart.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// The environment variable that switches production defaults on
/// (notably strict transfer authentication).
pub const ENV_MODE: &str = "SINKHOLE_ENV";

//----------- Config -----------------------------------------------------------

/// The daemon configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub server: ServerConfig,
    pub dot: DotConfig,
    pub doh: DohConfig,
    pub http: HttpConfig,
    pub transfer: TransferConfig,
}

impl Config {
    /// Register command-line arguments.
    pub fn setup_cli(cmd: clap::Command) -> clap::Command {
        cmd.arg(
            clap::Arg::new("config")
                .long("config")
                .short('c')
                .value_name("PATH")
                .help("Path to the configuration file"),
        )
    }

    /// Construct the configuration from command-line arguments.
    pub fn init(matches: &clap::ArgMatches) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Some(path) = matches.get_one::<String>("config") {
            config.daemon.config_file = Some(Utf8PathBuf::from(path));
        }
        Ok(config)
    }

    /// Load and merge the configuration file, if one is configured.
    pub fn init_from_file(&mut self) -> Result<(), ConfigError> {
        let Some(path) = self.daemon.config_file.clone() else {
            return Ok(());
        };
        let text = std::fs::read_to_string(path.as_std_path())
            .map_err(|e| ConfigError::Io(path.clone(), e))?;
        let mut loaded: Config =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(path, e.to_string()))?;
        loaded.daemon.config_file = self.daemon.config_file.take();
        *self = loaded;
        Ok(())
    }

    /// Whether production defaults apply (strict transfer auth).
    pub fn production_mode(&self) -> bool {
        match self.transfer.dev_mode {
            Some(dev) => !dev,
            None => std::env::var(ENV_MODE).as_deref() == Ok("production"),
        }
    }
}

//----------- DaemonConfig -----------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// The configuration file this config was loaded from.
    #[serde(skip)]
    pub config_file: Option<Utf8PathBuf>,

    /// Where the persistent store lives.
    pub store_file: Utf8PathBuf,

    pub logging: LoggingConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            config_file: None,
            store_file: "sinkhole-store.toml".into(),
            logging: Default::default(),
        }
    }
}

//----------- LoggingConfig ----------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub target: LogTarget,

    /// Additional per-module `tracing` directives.
    pub trace_targets: Vec<String>,
}

/// A log level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

/// Where log output goes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    #[default]
    Stderr,
    Stdout,
    File(Utf8PathBuf),
}

//----------- ServerConfig -----------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// The plain-DNS listen address (UDP and TCP).
    pub listen: SocketAddr,

    /// Per-request deadline in milliseconds.
    pub deadline_ms: u64,

    /// How long an idle TCP connection is kept open, in seconds.
    pub tcp_idle_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:53".parse().unwrap(),
            deadline_ms: 5000,
            tcp_idle_secs: 30,
        }
    }
}

//----------- DotConfig --------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DotConfig {
    pub enabled: bool,
    pub listen: SocketAddr,
    pub cert_path: Option<Utf8PathBuf>,
    pub key_path: Option<Utf8PathBuf>,
}

impl Default for DotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "0.0.0.0:853".parse().unwrap(),
            cert_path: None,
            key_path: None,
        }
    }
}

//----------- DohConfig --------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DohConfig {
    pub enabled: bool,
    pub listen: SocketAddr,

    /// Take the client address from `x-forwarded-for` and friends.  Only
    /// enable behind a proxy you control.
    pub trust_proxy_headers: bool,
}

impl Default for DohConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "0.0.0.0:8053".parse().unwrap(),
            trust_proxy_headers: false,
        }
    }
}

//----------- HttpConfig -------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    /// The admin/health/metrics listen address.
    pub listen: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".parse().unwrap(),
        }
    }
}

//----------- TransferConfig ---------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    /// Addresses allowed to AXFR without TSIG.
    pub allow_from: Vec<IpAddr>,

    /// Explicit development-mode override.  Unset means: consult
    /// `SINKHOLE_ENV`.
    pub dev_mode: Option<bool>,
}

//----------- ConfigError ------------------------------------------------------

/// An error loading the configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io(Utf8PathBuf, std::io::Error),
    Parse(Utf8PathBuf, String),
}

impl std::error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(path, e) => write!(f, "cannot read '{path}': {e}"),
            Self::Parse(path, e) => write!(f, "cannot parse '{path}': {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.server.listen.port(), 53);
        assert_eq!(config.dot.listen.port(), 853);
        assert!(!config.doh.enabled);
        assert_eq!(config.server.deadline_ms, 5000);
    }

    #[test]
    fn config_parses_from_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:5353"

            [dot]
            enabled = true
            cert_path = "/etc/sinkhole/dot.pem"
            key_path = "/etc/sinkhole/dot.key"

            [daemon.logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen.port(), 5353);
        assert!(config.dot.enabled);
        assert_eq!(config.daemon.logging.level, LogLevel::Debug);
    }
}
