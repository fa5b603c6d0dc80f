//! Static daemon configuration.
//!
//! All settings may be set in an optional TOML configuration file; the
//! only thing the command line is allowed to override is the socket
//! path (`-socket-path=<path>`), to avoid the futile duplication of
//! having every setting settable two different ways.

use std::fmt;
use std::path::PathBuf;

use serde::{de, Deserialize, Deserializer};

use crate::codec::MAX_FRAME_LEN;

fn default_loglevel() -> log::LevelFilter {
    log::LevelFilter::Info
}

fn default_max_frame_len() -> u32 {
    MAX_FRAME_LEN
}

fn deserialize_fromstr<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr,
    <T as std::str::FromStr>::Err: fmt::Display,
{
    let s = String::deserialize(deserializer)?;
    T::from_str(&s).map_err(|e| de::Error::custom(format!("error parsing '{}': {}", s, e)))
}

/// Name of the environment variable that overrides the configured log
/// level: the env var wins only if the config file is silent.
pub const LOG_LEVEL_ENV: &str = "VPROX_LOG";

pub const DEFAULT_SOCKET_NAME: &str = "vprox.sock";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Overrides the compiled-in default socket path.
    pub socket_path: Option<PathBuf>,
    #[serde(
        deserialize_with = "deserialize_fromstr",
        default = "default_loglevel"
    )]
    pub log_level: log::LevelFilter,
    /// Safety cap on a single frame's payload length, in bytes.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
    /// Whether to open the optional console channel and dump its output
    /// to the log, when a VM registers one.
    #[serde(default)]
    pub console_dump: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: None,
            log_level: default_loglevel(),
            max_frame_len: default_max_frame_len(),
            console_dump: false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    FileNotFound,
    ReadingFile(String),
    Unexpected(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::FileNotFound => write!(f, "could not locate the configuration file"),
            Self::ReadingFile(e) => write!(f, "failed to read configuration file: {}", e),
            Self::Unexpected(e) => write!(f, "configuration error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound,
            _ => Self::ReadingFile(e.to_string()),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file. A missing path
    /// yields the default configuration rather than an error: the proxy
    /// has no mandatory descriptor to read, so a config file is a
    /// convenience, not a requirement.
    pub fn from_file(path: Option<PathBuf>) -> Result<Config, ConfigError> {
        let path = match path {
            Some(p) => p,
            None => return Ok(Config::default()),
        };
        let bytes = std::fs::read(&path)?;
        toml::from_slice::<Config>(&bytes)
            .map_err(|e| ConfigError::ReadingFile(format!("parsing configuration file: {}", e)))
    }

    /// Resolve the log level: the `VPROX_LOG` environment variable
    /// overrides the configured value if it parses.
    pub fn resolved_log_level(&self) -> log::LevelFilter {
        if let Ok(env_val) = std::env::var(LOG_LEVEL_ENV) {
            if let Ok(level) = env_val.parse() {
                return level;
            }
        }
        self.log_level
    }

    /// The socket path in effect, applying the default relative to the
    /// system's runtime directory when neither the config file nor the
    /// `-socket-path=` flag set one.
    pub fn resolved_socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(default_socket_path)
    }
}

fn default_socket_path() -> PathBuf {
    let mut dir = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/run/vprox"));
    dir.push(DEFAULT_SOCKET_NAME);
    dir
}

/// Where the optional `vprox.toml` lives absent any override: a
/// `vprox/` folder under the platform's standard config directory,
/// mirroring `lianad::datadir`'s own XDG-based default.
pub fn default_config_path() -> Option<PathBuf> {
    let mut dir = dirs::config_dir()?;
    dir.push("vprox");
    dir.push("vprox.toml");
    Some(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_fields_absent() {
        let toml_str = "";
        let config: Config = toml::from_str(toml_str).expect("deserializing empty config");
        assert_eq!(config.log_level, log::LevelFilter::Info);
        assert_eq!(config.max_frame_len, MAX_FRAME_LEN);
        assert!(!config.console_dump);
    }

    #[test]
    fn explicit_fields_round_trip() {
        let toml_str = r#"
            socket_path = "/tmp/custom.sock"
            log_level = "debug"
            max_frame_len = 4096
            console_dump = true
            "#;
        let config: Config = toml::from_str(toml_str).expect("deserializing config");
        assert_eq!(config.socket_path, Some(PathBuf::from("/tmp/custom.sock")));
        assert_eq!(config.log_level, log::LevelFilter::Debug);
        assert_eq!(config.max_frame_len, 4096);
        assert!(config.console_dump);
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let toml_str = r#"log_level = "not-a-level""#;
        let res: Result<Config, toml::de::Error> = toml::from_str(toml_str);
        res.expect_err("deserializing an invalid log level");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::from_file(Some(PathBuf::from("/nonexistent/vprox.toml")));
        match config {
            Err(ConfigError::FileNotFound) => {}
            other => panic!("expected FileNotFound, got {:?}", other),
        }
    }

    #[test]
    fn no_path_yields_defaults() {
        let config = Config::from_file(None).expect("default config");
        assert_eq!(config.log_level, log::LevelFilter::Info);
    }
}
