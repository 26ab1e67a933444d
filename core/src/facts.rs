//! Raw snapshot facts and the provider seam they enter through.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::endpoint::Endpoint;

/// Transport protocol of a socket fact.
///
/// Ordered so TCP sorts before UDP; the port index relies on this when
/// collapsing per-protocol bindings into port-level views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
        }
    }
}

/// Socket state as far as the pipeline cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SockStatus {
    Listen,
    Established,
    Other,
}

/// One socket fact as enumerated from the operating system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub protocol: Protocol,
    pub local: Endpoint,
    pub remote: Option<Endpoint>,
    pub status: SockStatus,
    pub owner_pid: Option<i32>,
}

/// A process observed at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRef {
    pub pid: i32,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
}

/// Failure modes of a facts source.
#[derive(Debug, Error)]
pub enum FactsError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("facts source unavailable: {0}")]
    Unavailable(String),
}

/// Source of live socket and process facts.
///
/// `lookup_process` returning `None` means the pid could not be resolved at
/// snapshot time, because the process exited or is not visible to the
/// caller. That is a skip condition for the record depending on it, never an
/// error.
pub trait FactsProvider {
    fn list_connections(&self) -> Result<Vec<Connection>, FactsError>;
    fn lookup_process(&self, pid: i32) -> Option<ProcessRef>;
}
