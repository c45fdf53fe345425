//! Client identity and connection permissions.
//!
//! A [`ClientProfile`] names the sensor, carries its analyzer id and decides
//! where failover journals live on disk. [`Permission`] is the set of rights
//! the client declares when it connects.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

const GLOBAL_DIR: &str = "global";
const CONNECTIONS_DIR: &str = "connections";

bitflags! {
    /// Rights a client declares to its collectors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Permission: u8 {
        /// Read IDMEF events.
        const IDMEF_READ = 0b0001;
        /// Write IDMEF events.
        const IDMEF_WRITE = 0b0010;
        /// Read administrative requests.
        const ADMIN_READ = 0b0100;
        /// Issue administrative requests.
        const ADMIN_WRITE = 0b1000;
    }
}

impl FromStr for Permission {
    type Err = RelayError;

    /// Parses strings such as `"idmef:rw admin:r"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut permission = Self::empty();
        for token in s.split_whitespace() {
            let Some((class, rights)) = token.split_once(':') else {
                return Err(RelayError::Config(format!(
                    "permission `{token}` is not of the form class:rights"
                )));
            };
            let (read, write) = match class {
                "idmef" => (Self::IDMEF_READ, Self::IDMEF_WRITE),
                "admin" => (Self::ADMIN_READ, Self::ADMIN_WRITE),
                other => {
                    return Err(RelayError::Config(format!(
                        "unknown permission class `{other}`"
                    )));
                }
            };
            if rights.is_empty() {
                return Err(RelayError::Config(format!("permission `{token}` grants nothing")));
            }
            for right in rights.chars() {
                match right {
                    'r' => permission |= read,
                    'w' => permission |= write,
                    other => {
                        return Err(RelayError::Config(format!(
                            "unknown permission right `{other}` in `{token}`"
                        )));
                    }
                }
            }
        }
        Ok(permission)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for (class, read, write) in [
            ("idmef", Self::IDMEF_READ, Self::IDMEF_WRITE),
            ("admin", Self::ADMIN_READ, Self::ADMIN_WRITE),
        ] {
            let mut rights = String::new();
            if self.contains(read) {
                rights.push('r');
            }
            if self.contains(write) {
                rights.push('w');
            }
            if !rights.is_empty() {
                parts.push(format!("{class}:{rights}"));
            }
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// Identity of the sensor owning a connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProfile {
    /// Profile name, used in logs and handshakes.
    pub name: String,
    /// Analyzer identifier announced to collectors.
    pub analyzer_id: u64,
    /// Directory holding one failover journal per destination.
    pub backup_dir: PathBuf,
}

impl ClientProfile {
    /// Creates a profile.
    #[must_use]
    pub fn new(name: impl Into<String>, analyzer_id: u64, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            analyzer_id,
            backup_dir: backup_dir.into(),
        }
    }

    /// Checks that the profile can be used to run a pool.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Profile`] if the name or the backup directory
    /// is empty.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.name.trim().is_empty() {
            return Err(RelayError::Profile("profile name is empty".to_string()));
        }
        if self.backup_dir.as_os_str().is_empty() {
            return Err(RelayError::Profile(format!(
                "profile `{}` has no backup directory",
                self.name
            )));
        }
        Ok(())
    }

    /// Directory of the pool-wide failover journal.
    #[must_use]
    pub fn global_backup_dir(&self) -> PathBuf {
        self.backup_dir.join(GLOBAL_DIR)
    }

    /// Directory of the failover journal dedicated to `addr`.
    ///
    /// Per-connection journals live under `connections/`, apart from the
    /// pool-wide one. The address is escaped into a single path component:
    /// `%`, `/` and `\` are percent-encoded, as is a leading `.`, so no
    /// address can name `.`, `..` or a nested path.
    #[must_use]
    pub fn connection_backup_dir(&self, addr: &str) -> PathBuf {
        let mut name = String::with_capacity(addr.len());
        for (index, c) in addr.chars().enumerate() {
            match c {
                '%' => name.push_str("%25"),
                '/' => name.push_str("%2F"),
                '\\' => name.push_str("%5C"),
                '.' if index == 0 => name.push_str("%2E"),
                c => name.push(c),
            }
        }
        if name.is_empty() {
            name.push('%');
        }
        self.backup_dir.join(CONNECTIONS_DIR).join(name)
    }

    /// Returns the backup directory.
    #[must_use]
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }
}
