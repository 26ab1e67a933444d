//! Port/service index built from listening-socket facts.
//!
//! Built once per snapshot and read-only afterwards. The index keeps one
//! binding per (port, protocol); the port-level views collapse the pair,
//! preferring TCP when both protocols hold a port.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::Serialize;

use crate::facts::{Connection, FactsProvider, Protocol, SockStatus};
use crate::wellknown;

/// One retained listening-socket binding.
///
/// `owner` is `None` when the owning process could not be resolved; the
/// binding still occupies its port slot.
#[derive(Debug, Clone, Serialize)]
pub struct PortBinding {
    pub port: u16,
    pub protocol: Protocol,
    pub address: IpAddr,
    pub owner: Option<crate::facts::ProcessRef>,
    pub well_known_label: String,
}

/// Owning service of a listening port, as the downstream stages see it.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceOwner {
    pub service: Option<String>,
    pub pid: Option<i32>,
}

/// Read-only bidirectional port/service index for one snapshot.
#[derive(Debug, Default)]
pub struct PortIndex {
    listening: BTreeMap<u16, PortBinding>,
    port_to_service: BTreeMap<u16, ServiceOwner>,
    service_to_ports: BTreeMap<String, Vec<u16>>,
}

impl PortIndex {
    /// Collapsed port-level view: one binding per listening port.
    pub fn listening_services(&self) -> &BTreeMap<u16, PortBinding> {
        &self.listening
    }

    pub fn port_to_service(&self) -> &BTreeMap<u16, ServiceOwner> {
        &self.port_to_service
    }

    /// Ports per owning service, in binding order. Not deduplicated: a
    /// service re-binding a port over both protocols lists it twice.
    pub fn service_to_ports(&self) -> &BTreeMap<String, Vec<u16>> {
        &self.service_to_ports
    }

    pub fn has_listener(&self, port: u16) -> bool {
        self.port_to_service.contains_key(&port)
    }

    /// Resolved owning-service name for a port, when the owner is known.
    pub fn service_name(&self, port: u16) -> Option<&str> {
        self.port_to_service
            .get(&port)
            .and_then(|o| o.service.as_deref())
    }
}

// Resolved owner beats unresolved; among resolved owners the lowest pid
// wins. Keeps the index stable under enumeration order.
fn wins_over(candidate: &PortBinding, held: &PortBinding) -> bool {
    match (&candidate.owner, &held.owner) {
        (Some(_), None) => true,
        (Some(c), Some(h)) => c.pid < h.pid,
        _ => false,
    }
}

/// Build the index from LISTEN facts joined with process lookups.
pub fn build_port_index(conns: &[Connection], facts: &dyn FactsProvider) -> PortIndex {
    let mut bindings: BTreeMap<(u16, Protocol), PortBinding> = BTreeMap::new();
    for conn in conns.iter().filter(|c| c.status == SockStatus::Listen) {
        let owner = conn.owner_pid.and_then(|pid| facts.lookup_process(pid));
        let candidate = PortBinding {
            port: conn.local.port,
            protocol: conn.protocol,
            address: conn.local.ip,
            owner,
            well_known_label: wellknown::label(conn.local.port),
        };
        let key = (conn.local.port, conn.protocol);
        match bindings.get(&key) {
            Some(held) if !wins_over(&candidate, held) => {}
            _ => {
                bindings.insert(key, candidate);
            }
        }
    }

    let mut index = PortIndex::default();
    // Key order is (port, protocol) with TCP first, so the first binding
    // seen per port is the TCP one when both protocols are bound.
    for ((port, _), binding) in &bindings {
        if let Some(owner) = &binding.owner {
            index
                .service_to_ports
                .entry(owner.name.clone())
                .or_default()
                .push(*port);
        }
        if index.listening.contains_key(port) {
            continue;
        }
        index.port_to_service.insert(
            *port,
            ServiceOwner {
                service: binding.owner.as_ref().map(|o| o.name.clone()),
                pid: binding.owner.as_ref().map(|o| o.pid),
            },
        );
        index.listening.insert(*port, binding.clone());
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::facts::{FactsError, ProcessRef};
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    struct MapFacts(HashMap<i32, ProcessRef>);

    impl MapFacts {
        fn with(entries: &[(i32, &str)]) -> Self {
            let map = entries
                .iter()
                .map(|(pid, name)| {
                    (
                        *pid,
                        ProcessRef {
                            pid: *pid,
                            name: name.to_string(),
                            username: None,
                            cmdline: None,
                        },
                    )
                })
                .collect();
            MapFacts(map)
        }
    }

    impl FactsProvider for MapFacts {
        fn list_connections(&self) -> Result<Vec<Connection>, FactsError> {
            Ok(Vec::new())
        }
        fn lookup_process(&self, pid: i32) -> Option<ProcessRef> {
            self.0.get(&pid).cloned()
        }
    }

    fn listen(port: u16, protocol: Protocol, pid: Option<i32>) -> Connection {
        Connection {
            protocol,
            local: Endpoint::new(Ipv4Addr::UNSPECIFIED.into(), port),
            remote: None,
            status: SockStatus::Listen,
            owner_pid: pid,
        }
    }

    #[test]
    fn indexes_owned_listener() {
        let facts = MapFacts::with(&[(10, "postgres")]);
        let index = build_port_index(&[listen(5432, Protocol::Tcp, Some(10))], &facts);
        assert_eq!(index.service_name(5432), Some("postgres"));
        assert!(index.has_listener(5432));
        assert_eq!(index.service_to_ports()["postgres"], vec![5432]);
        assert_eq!(
            index.listening_services()[&5432].well_known_label,
            "PostgreSQL"
        );
    }

    #[test]
    fn unresolved_owner_occupies_slot() {
        let facts = MapFacts::with(&[]);
        let index = build_port_index(&[listen(8080, Protocol::Tcp, Some(42))], &facts);
        assert!(index.has_listener(8080));
        assert_eq!(index.service_name(8080), None);
        assert!(index.service_to_ports().is_empty());
    }

    #[test]
    fn tie_break_prefers_resolved_then_lowest_pid() {
        let facts = MapFacts::with(&[(30, "workerB"), (20, "workerA")]);
        // enumeration order deliberately unhelpful: unresolved first,
        // higher pid before lower
        let conns = vec![
            listen(9000, Protocol::Tcp, None),
            listen(9000, Protocol::Tcp, Some(30)),
            listen(9000, Protocol::Tcp, Some(20)),
        ];
        let index = build_port_index(&conns, &facts);
        assert_eq!(index.service_name(9000), Some("workerA"));
        assert_eq!(index.port_to_service()[&9000].pid, Some(20));
    }

    #[test]
    fn tcp_preferred_at_port_level() {
        let facts = MapFacts::with(&[(1, "dns-tcp"), (2, "dns-udp")]);
        let conns = vec![
            listen(53, Protocol::Udp, Some(2)),
            listen(53, Protocol::Tcp, Some(1)),
        ];
        let index = build_port_index(&conns, &facts);
        assert_eq!(index.service_name(53), Some("dns-tcp"));
        assert_eq!(index.listening_services()[&53].protocol, Protocol::Tcp);
    }

    #[test]
    fn rebinding_service_lists_port_per_protocol() {
        let facts = MapFacts::with(&[(7, "resolver")]);
        let conns = vec![
            listen(53, Protocol::Tcp, Some(7)),
            listen(53, Protocol::Udp, Some(7)),
        ];
        let index = build_port_index(&conns, &facts);
        assert_eq!(index.service_to_ports()["resolver"], vec![53, 53]);
        // port-level views still hold a single slot
        assert_eq!(index.listening_services().len(), 1);
    }

    #[test]
    fn established_facts_are_ignored() {
        let facts = MapFacts::with(&[(5, "app")]);
        let conn = Connection {
            protocol: Protocol::Tcp,
            local: Endpoint::new(Ipv4Addr::LOCALHOST.into(), 40000),
            remote: Some(Endpoint::new(Ipv4Addr::LOCALHOST.into(), 5432)),
            status: SockStatus::Established,
            owner_pid: Some(5),
        };
        let index = build_port_index(&[conn], &facts);
        assert!(index.listening_services().is_empty());
    }
}
