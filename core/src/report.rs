//! Snapshot assembly: runs the correlation stages in dependency order and
//! packs their outputs into one serializable structure.
//!
//! Assembly never aborts. A facts enumeration failure leaves every
//! correlation section empty and records the reason; the utilization series
//! carries its own availability independently.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::commgraph::{build_comm_graph, ClientRef, CommStats, ProcessComms, ServiceEdge};
use crate::depgraph::{build_dependency_graph, DependencyEdge, PortUsage};
use crate::facts::{Connection, FactsProvider};
use crate::history::UtilizationSeries;
use crate::portindex::{build_port_index, PortBinding};

#[derive(Debug, Default, Serialize)]
pub struct CorrelationReport {
    pub listening_services: BTreeMap<u16, PortBinding>,
    pub service_to_ports: BTreeMap<String, Vec<u16>>,
    pub port_usage_map: BTreeMap<u16, PortUsage>,
    pub communication_matrix: Vec<ServiceEdge>,
    pub by_process: BTreeMap<String, ProcessComms>,
    pub service_clients: BTreeMap<String, Vec<ClientRef>>,
    pub stats: CommStats,
    pub dependency_graph: Vec<DependencyEdge>,
    pub cpu_history: UtilizationSeries,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Enumerate connection facts and correlate them. Enumeration failure
/// degrades to empty sections with the reason recorded.
pub fn build_report(facts: &dyn FactsProvider, cpu_history: UtilizationSeries) -> CorrelationReport {
    match facts.list_connections() {
        Ok(conns) => correlate(&conns, facts, cpu_history),
        Err(err) => CorrelationReport {
            cpu_history,
            error: Some(err.to_string()),
            ..Default::default()
        },
    }
}

/// Correlate an already-enumerated fact set.
pub fn correlate(
    conns: &[Connection],
    facts: &dyn FactsProvider,
    cpu_history: UtilizationSeries,
) -> CorrelationReport {
    let index = build_port_index(conns, facts);
    let graph = build_comm_graph(conns, facts, &index);
    let deps = build_dependency_graph(&graph, &index);

    CorrelationReport {
        listening_services: index.listening_services().clone(),
        service_to_ports: index.service_to_ports().clone(),
        port_usage_map: deps.port_usage,
        communication_matrix: graph.edges,
        by_process: graph.by_process,
        service_clients: graph.service_clients,
        stats: graph.stats,
        dependency_graph: deps.edges,
        cpu_history,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::facts::{FactsError, Protocol, ProcessRef, SockStatus};
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};

    struct MapFacts {
        conns: Vec<Connection>,
        procs: HashMap<i32, ProcessRef>,
        fail: bool,
    }

    impl FactsProvider for MapFacts {
        fn list_connections(&self) -> Result<Vec<Connection>, FactsError> {
            if self.fail {
                return Err(FactsError::Unavailable(
                    "connection table unreadable".to_string(),
                ));
            }
            Ok(self.conns.clone())
        }
        fn lookup_process(&self, pid: i32) -> Option<ProcessRef> {
            self.procs.get(&pid).cloned()
        }
    }

    fn proc_ref(pid: i32, name: &str) -> ProcessRef {
        ProcessRef {
            pid,
            name: name.to_string(),
            username: None,
            cmdline: None,
        }
    }

    fn loopback(port: u16) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn canonical_scenario_threads_through_all_sections() {
        let facts = MapFacts {
            conns: vec![
                Connection {
                    protocol: Protocol::Tcp,
                    local: Endpoint::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5432),
                    remote: None,
                    status: SockStatus::Listen,
                    owner_pid: Some(10),
                },
                Connection {
                    protocol: Protocol::Tcp,
                    local: loopback(50000),
                    remote: Some(loopback(5432)),
                    status: SockStatus::Established,
                    owner_pid: Some(20),
                },
            ],
            procs: HashMap::from([(10, proc_ref(10, "postgres")), (20, proc_ref(20, "app"))]),
            fail: false,
        };

        let report = build_report(&facts, UtilizationSeries::unavailable("skipped"));

        assert_eq!(
            report.listening_services[&5432].owner.as_ref().map(|p| p.name.as_str()),
            Some("postgres")
        );
        assert_eq!(report.service_to_ports["postgres"], vec![5432]);
        assert_eq!(report.communication_matrix.len(), 1);
        assert_eq!(report.dependency_graph.len(), 1);
        assert_eq!(report.dependency_graph[0].client_process, "app");
        assert_eq!(report.dependency_graph[0].server_service, "postgres");
        assert_eq!(report.port_usage_map[&5432].client_count, 1);
        assert_eq!(report.service_clients["postgres"][0].client, "app");
        assert_eq!(report.stats.established, 1);
        assert!(report.error.is_none());
    }

    #[test]
    fn enumeration_failure_degrades_sections() {
        let facts = MapFacts {
            conns: Vec::new(),
            procs: HashMap::new(),
            fail: true,
        };
        let series = UtilizationSeries {
            available: true,
            date: Some("2025-08-24".to_string()),
            ..Default::default()
        };

        let report = build_report(&facts, series);

        assert_eq!(
            report.error.as_deref(),
            Some("facts source unavailable: connection table unreadable")
        );
        assert!(report.listening_services.is_empty());
        assert!(report.communication_matrix.is_empty());
        assert!(report.dependency_graph.is_empty());
        // history availability is independent of the facts failure
        assert!(report.cpu_history.available);
    }

    #[test]
    fn identical_facts_serialize_identically() {
        let conns = vec![
            Connection {
                protocol: Protocol::Tcp,
                local: Endpoint::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 22),
                remote: None,
                status: SockStatus::Listen,
                owner_pid: Some(7),
            },
            Connection {
                protocol: Protocol::Tcp,
                local: loopback(50001),
                remote: Some(loopback(22)),
                status: SockStatus::Established,
                owner_pid: Some(8),
            },
        ];
        let facts = MapFacts {
            conns: conns.clone(),
            procs: HashMap::from([(7, proc_ref(7, "sshd")), (8, proc_ref(8, "scp"))]),
            fail: false,
        };

        let first = correlate(&conns, &facts, UtilizationSeries::default());
        let second = correlate(&conns, &facts, UtilizationSeries::default());
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn report_serializes_with_section_keys() {
        let facts = MapFacts {
            conns: Vec::new(),
            procs: HashMap::new(),
            fail: false,
        };
        let report = build_report(&facts, UtilizationSeries::default());
        let value = serde_json::to_value(&report).unwrap();

        for key in [
            "listening_services",
            "port_usage_map",
            "communication_matrix",
            "service_clients",
            "dependency_graph",
            "cpu_history",
        ] {
            assert!(value.get(key).is_some(), "missing section {key}");
        }
        assert!(value.get("error").is_none());
    }
}
