//! Relay configuration loaded from environment variables.
//!
//! All settings come from `RELAY_*` environment variables, optionally
//! loaded from a `.env` file via `dotenvy`:
//!
//! | Variable                     | Default                   |
//! |------------------------------|---------------------------|
//! | `RELAY_CONNECTION_STRING`    | `127.0.0.1:4690`          |
//! | `RELAY_PROFILE_NAME`         | `idmef-relay`             |
//! | `RELAY_ANALYZER_ID`          | `0`                       |
//! | `RELAY_BACKUP_DIR`           | `/var/spool/idmef-relay`  |
//! | `RELAY_PERMISSION`           | `idmef:w`                 |
//! | `RELAY_RECONNECT`            | `true`                    |
//! | `RELAY_FAILOVER`             | `true`                    |
//! | `RELAY_CONNECT_TIMEOUT_SECS` | `5`                       |
//! | `RELAY_EVENT_BUS_CAPACITY`   | `1024`                    |

use std::path::PathBuf;
use std::time::Duration;

use crate::domain::{ClientProfile, Permission, PoolFlags, Topology};
use crate::error::RelayError;

/// Top-level relay configuration.
///
/// Loaded once at startup via [`RelayConfig::from_env`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Connection string describing the collector topology.
    pub connection_string: String,

    /// Profile name announced to collectors.
    pub profile_name: String,

    /// Analyzer identifier announced to collectors.
    pub analyzer_id: u64,

    /// Directory holding the failover journals.
    pub backup_dir: PathBuf,

    /// Permission declared on every connection.
    pub permission: Permission,

    /// Retry dead connections in the background.
    pub reconnect: bool,

    /// Spool undeliverable messages to disk.
    pub failover: bool,

    /// Seconds before a connection attempt is abandoned.
    pub connect_timeout_secs: u64,

    /// Capacity of the pool event bus.
    pub event_bus_capacity: usize,
}

impl RelayConfig {
    /// Loads configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file, then
    /// falls back to defaults for unset variables.
    ///
    /// # Errors
    ///
    /// See [`Self::from_lookup`].
    pub fn from_env() -> Result<Self, RelayError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidTopology`] if the connection string does
    /// not parse, or [`RelayError::Config`] for an invalid permission string.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RelayError> {
        let connection_string = lookup("RELAY_CONNECTION_STRING")
            .unwrap_or_else(|| "127.0.0.1:4690".to_string());
        let _: Topology = connection_string.parse()?;

        let profile_name =
            lookup("RELAY_PROFILE_NAME").unwrap_or_else(|| "idmef-relay".to_string());
        let analyzer_id = parse_var(&lookup, "RELAY_ANALYZER_ID", 0);
        let backup_dir = lookup("RELAY_BACKUP_DIR")
            .map_or_else(|| PathBuf::from("/var/spool/idmef-relay"), PathBuf::from);
        let permission = lookup("RELAY_PERMISSION")
            .as_deref()
            .unwrap_or("idmef:w")
            .parse()?;

        let reconnect = parse_var_bool(&lookup, "RELAY_RECONNECT", true);
        let failover = parse_var_bool(&lookup, "RELAY_FAILOVER", true);
        let connect_timeout_secs = parse_var(&lookup, "RELAY_CONNECT_TIMEOUT_SECS", 5);
        let event_bus_capacity = parse_var(&lookup, "RELAY_EVENT_BUS_CAPACITY", 1024);

        Ok(Self {
            connection_string,
            profile_name,
            analyzer_id,
            backup_dir,
            permission,
            reconnect,
            failover,
            connect_timeout_secs,
            event_bus_capacity,
        })
    }

    /// Client profile described by this configuration.
    #[must_use]
    pub fn profile(&self) -> ClientProfile {
        ClientProfile::new(&self.profile_name, self.analyzer_id, &self.backup_dir)
    }

    /// Pool flags described by this configuration.
    #[must_use]
    pub fn pool_flags(&self) -> PoolFlags {
        let mut flags = PoolFlags::empty();
        flags.set(PoolFlags::RECONNECT, self.reconnect);
        flags.set(PoolFlags::FAILOVER, self.failover);
        flags
    }

    /// Connection attempt timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Parses a variable as `T`, returning `default` on missing or invalid
/// values.
fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses a variable as a boolean. Accepts `"true"`, `"1"`, `"false"`, `"0"`
/// (case-insensitive). Returns `default` otherwise.
fn parse_var_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        Some("true" | "1") => true,
        Some("false" | "0") => false,
        _ => default,
    }
}
