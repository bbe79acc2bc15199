//! Backing store identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the two session stores the pipeline service can serve from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Low-latency transient store
    Ephemeral,
    /// Persisted store
    Durable,
}

impl Backend {
    /// Both backends, ephemeral first
    pub const ALL: [Backend; 2] = [Backend::Ephemeral, Backend::Durable];

    /// Wire name used in query strings and config files
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Ephemeral => "ephemeral",
            Backend::Durable => "durable",
        }
    }

    /// The other backend
    pub fn other(&self) -> Backend {
        match self {
            Backend::Ephemeral => Backend::Durable,
            Backend::Durable => Backend::Ephemeral,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ephemeral" | "redis" => Ok(Backend::Ephemeral),
            "durable" | "database" | "db" => Ok(Backend::Durable),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown backend '{}'",
                other
            ))),
        }
    }
}
