use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use crate::error::{Result, TelemetryError};
use crate::protocol::WireProfile;

pub const DEFAULT_PORT: u16 = 8890;

/// Process-wide defaults shared by the collector and the device binaries.
///
/// Values come from the environment; command-line flags override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub profile: WireProfile,
    pub connect_timeout: Duration,
    pub flush_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            profile: WireProfile::default(),
            connect_timeout: Duration::from_secs(2),
            flush_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: std::env::var("GRID_HOST").unwrap_or(defaults.host),
            port: env_parse("GRID_PORT")?.unwrap_or(defaults.port),
            profile: env_parse("GRID_PROFILE")?.unwrap_or(defaults.profile),
            connect_timeout: env_millis("GRID_CONNECT_TIMEOUT_MS")?
                .unwrap_or(defaults.connect_timeout),
            flush_timeout: env_millis("GRID_FLUSH_TIMEOUT_MS")?
                .unwrap_or(defaults.flush_timeout),
            read_timeout: env_millis("GRID_READ_TIMEOUT_MS")?
                .unwrap_or(defaults.read_timeout),
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| TelemetryError::ConfigError(format!("{}={}: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_millis))
}

/// Parses a command-line interval given in (possibly fractional) seconds.
pub fn parse_seconds(raw: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|e| format!("{:?} is not a number of seconds: {}", raw, e))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid interval {:?}: {}", raw, e))
}
