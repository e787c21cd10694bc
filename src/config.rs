//! Process configuration from environment variables.
//!
//! Every setting has a default so the relay starts with an empty
//! environment. `.env` files are loaded by `main` through `dotenvy` before
//! this module reads anything. A value that is present but unparseable is a
//! startup error rather than a silent fallback.

use std::str::FromStr;

use crate::services::relay::RelayConfig;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_SESSION_ID: i64 = 1;
const DEFAULT_COMMAND_BUFFER: usize = 1024;
const DEFAULT_OUTBOUND_BUFFER: usize = 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Postgres URL; the in-memory store is used when unset.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub relay: RelayConfig,
}

impl Config {
    /// Read configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a value that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a value that does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = lookup("HOST")
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.into());
        let port = parse_or(&lookup, "PORT", DEFAULT_PORT)?;
        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        let db_max_connections = parse_or(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?;

        let command_buffer = parse_or(&lookup, "RELAY_COMMAND_BUFFER", DEFAULT_COMMAND_BUFFER)?;
        let outbound_buffer = parse_or(&lookup, "RELAY_OUTBOUND_BUFFER", DEFAULT_OUTBOUND_BUFFER)?;
        // tokio channels panic on zero capacity.
        if command_buffer == 0 {
            return Err(invalid("RELAY_COMMAND_BUFFER", "0"));
        }
        if outbound_buffer == 0 {
            return Err(invalid("RELAY_OUTBOUND_BUFFER", "0"));
        }
        let max_connections = match parse_or::<usize>(&lookup, "RELAY_MAX_CONNECTIONS", 0)? {
            0 => None,
            n => Some(n),
        };
        let default_session_id = parse_or(&lookup, "DEFAULT_SESSION_ID", DEFAULT_SESSION_ID)?;

        Ok(Self {
            host,
            port,
            database_url,
            db_max_connections,
            relay: RelayConfig { command_buffer, outbound_buffer, max_connections, default_session_id },
        })
    }

    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|_| invalid(key, &raw)),
    }
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid { key, value: value.to_owned() }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
