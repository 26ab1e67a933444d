//! Communication graph over established connections.
//!
//! Classifies every established connection as loopback-local or external and
//! records it in three views: a flat edge list, per-source-process peer
//! lists, and a per-service client list deduplicated by client process name.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::facts::{Connection, FactsProvider, ProcessRef, Protocol, SockStatus};
use crate::portindex::PortIndex;
use crate::wellknown;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Local,
    External,
}

/// One observed connection edge from a local process.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceEdge {
    pub source: ProcessRef,
    pub kind: EdgeKind,
    pub target_label: String,
    pub target_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,
    pub protocol: Protocol,
}

/// One connection as seen from its owning process.
#[derive(Debug, Clone, Serialize)]
pub struct PeerLink {
    pub remote_host: String,
    pub remote_port: u16,
    pub local_port: u16,
    pub protocol: Protocol,
    pub target_label: String,
}

/// Local and external peers for one named process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessComms {
    pub pid: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
    pub local: Vec<PeerLink>,
    pub external: Vec<PeerLink>,
}

/// A deduplicated client of a local service. `client_pid` and `port` come
/// from the first connection seen for that client name.
#[derive(Debug, Clone, Serialize)]
pub struct ClientRef {
    pub client: String,
    pub client_pid: i32,
    pub port: u16,
}

/// Counters over all established connections, including those whose owner
/// could not be resolved and which therefore appear in no view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommStats {
    pub established: usize,
    pub local: usize,
    pub external: usize,
    pub unattributed: usize,
}

/// The grapher's three views plus aggregate counters.
#[derive(Debug, Default)]
pub struct CommGraph {
    pub edges: Vec<ServiceEdge>,
    pub by_process: BTreeMap<String, ProcessComms>,
    pub service_clients: BTreeMap<String, Vec<ClientRef>>,
    pub stats: CommStats,
}

impl CommGraph {
    pub fn local_edges(&self) -> impl Iterator<Item = &ServiceEdge> {
        self.edges.iter().filter(|e| e.kind == EdgeKind::Local)
    }
}

/// Classify established connections against the port index.
pub fn build_comm_graph(
    conns: &[Connection],
    facts: &dyn FactsProvider,
    index: &PortIndex,
) -> CommGraph {
    let mut graph = CommGraph::default();

    for conn in conns {
        if conn.status != SockStatus::Established {
            continue;
        }
        let Some(remote) = conn.remote else { continue };
        graph.stats.established += 1;
        let is_local = remote.is_loopback();
        if is_local {
            graph.stats.local += 1;
        } else {
            graph.stats.external += 1;
        }

        let Some(owner) = conn.owner_pid.and_then(|pid| facts.lookup_process(pid)) else {
            // counted above, but absent from every per-process view
            graph.stats.unattributed += 1;
            continue;
        };

        let entry = graph
            .by_process
            .entry(owner.name.clone())
            .or_insert_with(|| ProcessComms {
                pid: owner.pid,
                cmdline: owner.cmdline.clone(),
                local: Vec::new(),
                external: Vec::new(),
            });

        if is_local {
            let label = match index.service_name(remote.port) {
                Some(name) => name.to_string(),
                None => format!("unknown-port-{}", remote.port),
            };
            entry.local.push(PeerLink {
                remote_host: remote.ip.to_string(),
                remote_port: remote.port,
                local_port: conn.local.port,
                protocol: conn.protocol,
                target_label: label.clone(),
            });
            let clients = graph.service_clients.entry(label.clone()).or_default();
            if !clients.iter().any(|c| c.client == owner.name) {
                clients.push(ClientRef {
                    client: owner.name.clone(),
                    client_pid: owner.pid,
                    port: remote.port,
                });
            }
            graph.edges.push(ServiceEdge {
                source: owner,
                kind: EdgeKind::Local,
                target_label: label,
                target_port: remote.port,
                target_host: None,
                protocol: conn.protocol,
            });
        } else {
            let label = wellknown::label(remote.port);
            entry.external.push(PeerLink {
                remote_host: remote.ip.to_string(),
                remote_port: remote.port,
                local_port: conn.local.port,
                protocol: conn.protocol,
                target_label: label.clone(),
            });
            graph.edges.push(ServiceEdge {
                source: owner,
                kind: EdgeKind::External,
                target_label: label,
                target_port: remote.port,
                target_host: Some(remote.ip.to_string()),
                protocol: conn.protocol,
            });
        }
    }

    graph
}
