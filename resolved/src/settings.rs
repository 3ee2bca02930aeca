use std::net::SocketAddr;
use std::path::PathBuf;

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

/// Runtime configuration, loaded entirely from the environment
/// (spec.md §6's configuration surface). There is no config file: a
/// home-network nameserver doesn't need one, and environment
/// variables are what a container orchestrator actually sets.
///
/// Every variable is namespaced `RESOLVED_*`; nested keys (none at
/// present) would use `__` as a separator.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    #[serde(default)]
    pub disable_cache: bool,

    #[serde(default)]
    pub env: Env,

    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default = "default_zone_dir")]
    pub zone_dir: PathBuf,

    #[serde(default = "default_servers", deserialize_with = "deserialize_servers")]
    pub servers: Vec<SocketAddr>,

    #[serde(default = "default_max_recursion")]
    pub max_recursion: usize,
}

fn default_port() -> u16 {
    8053
}

fn default_cache_size() -> usize {
    1000
}

fn default_zone_dir() -> PathBuf {
    PathBuf::from("/etc/resolved/zones")
}

fn default_servers() -> Vec<SocketAddr> {
    vec![
        "1.1.1.1:53".parse().unwrap(),
        "1.0.0.1:53".parse().unwrap(),
    ]
}

fn default_max_recursion() -> usize {
    8
}

fn deserialize_servers<'de, D>(deserializer: D) -> Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Vec<String> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|s| s.parse().map_err(serde::de::Error::custom))
        .collect()
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    Dev,
    #[default]
    Prod,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl Settings {
    /// Loads configuration from `RESOLVED_*` environment variables,
    /// falling back to the documented defaults for anything unset. A
    /// `servers` list, when set, is a comma-separated list of
    /// `ip:port` pairs.
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(
                Environment::with_prefix("RESOLVED")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("servers"),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        assert_eq!(default_port(), 8053);
        assert_eq!(default_cache_size(), 1000);
        assert_eq!(default_max_recursion(), 8);
        assert_eq!(default_servers().len(), 2);
    }

    #[test]
    fn env_defaults_to_prod() {
        assert_eq!(Env::default(), Env::Prod);
    }

    #[test]
    fn log_level_defaults_to_info() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
        assert_eq!(LogLevel::Info.as_str(), "info");
    }
}
