//! Port-level dependency graph between local processes.
//!
//! Restricts the grapher's local edges to remote ports that are actual
//! listeners in the port index, then collapses them into client→server
//! dependency edges keyed by (client process name, server port).

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::commgraph::CommGraph;
use crate::portindex::PortIndex;
use crate::wellknown;

/// A client→server dependency inferred from a loopback connection to a
/// known listening port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyEdge {
    pub client_process: String,
    pub client_pid: i32,
    pub server_port: u16,
    pub server_service: String,
}

/// Usage summary for one listening port.
#[derive(Debug, Clone, Serialize)]
pub struct PortUsage {
    pub service: Option<String>,
    pub well_known_label: String,
    pub client_count: usize,
    pub clients: Vec<String>,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    pub edges: Vec<DependencyEdge>,
    pub port_usage: BTreeMap<u16, PortUsage>,
}

/// Build dependency edges and the per-port usage map.
///
/// Edges are deduplicated by (client name, server port): repeat connections
/// from the same-named process collapse into one edge carrying the first
/// pid seen. Two differently-named processes to the same port stay distinct.
pub fn build_dependency_graph(graph: &CommGraph, index: &PortIndex) -> DependencyGraph {
    let mut edges = Vec::new();
    let mut seen: BTreeSet<(String, u16)> = BTreeSet::new();

    for edge in graph.local_edges() {
        if !index.has_listener(edge.target_port) {
            continue;
        }
        if !seen.insert((edge.source.name.clone(), edge.target_port)) {
            continue;
        }
        // an unowned listener still yields an edge, labeled by port
        let service = match index.service_name(edge.target_port) {
            Some(name) => name.to_string(),
            None => wellknown::label(edge.target_port),
        };
        edges.push(DependencyEdge {
            client_process: edge.source.name.clone(),
            client_pid: edge.source.pid,
            server_port: edge.target_port,
            server_service: service,
        });
    }

    let mut port_usage = BTreeMap::new();
    for (port, owner) in index.port_to_service() {
        let clients: Vec<String> = edges
            .iter()
            .filter(|e| e.server_port == *port)
            .map(|e| e.client_process.clone())
            .collect();
        port_usage.insert(
            *port,
            PortUsage {
                service: owner.service.clone(),
                well_known_label: wellknown::label(*port),
                client_count: clients.len(),
                clients,
            },
        );
    }

    DependencyGraph { edges, port_usage }
}
