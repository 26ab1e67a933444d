//! Correlation and normalization engine for host inventory snapshots.
//!
//! Consumes already-enumerated socket and process facts through the
//! [`facts::FactsProvider`] seam and historical utilization logs through the
//! [`history::LogSource`] seam; produces the correlated report assembled in
//! [`report`]. Obtaining the facts is the job of the OS-facing modules.

pub mod commgraph;
pub mod depgraph;
pub mod endpoint;
pub mod facts;
pub mod history;
pub mod portindex;
pub mod report;
pub mod wellknown;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
