//! Socket and process facts from /proc.
//!
//! Takes one snapshot at construction: the kernel socket tables joined to
//! their owning processes via socket inodes, plus a pid-keyed process cache
//! for later lookups. The snapshot is immutable afterwards, so repeated
//! queries against one [`ProcFacts`] observe one consistent fact set.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;

use hostinv_core::endpoint::Endpoint;
use hostinv_core::facts::{Connection, FactsError, FactsProvider, ProcessRef, Protocol, SockStatus};
use procfs::net::{TcpState, UdpState};
use procfs::process::FDTarget;
use tracing::{debug, warn};

pub struct ProcFacts {
    conns: Vec<Connection>,
    procs: HashMap<i32, ProcessRef>,
}

impl ProcFacts {
    /// Snapshot the current socket tables and process list.
    pub fn collect() -> Result<Self, FactsError> {
        let users = read_passwd();
        let (procs, inode_to_pid, fd_errors) = scan_processes(&users);
        if fd_errors > 0 {
            // without root most other-user fd directories are unreadable;
            // their sockets stay unowned
            warn!(
                unreadable = fd_errors,
                "partial process visibility; some socket owners will be unresolved"
            );
        }

        let conns = read_socket_tables(&inode_to_pid)?;
        debug!(connections = conns.len(), processes = procs.len(), "snapshot complete");
        Ok(ProcFacts { conns, procs })
    }
}

impl FactsProvider for ProcFacts {
    fn list_connections(&self) -> Result<Vec<Connection>, FactsError> {
        Ok(self.conns.clone())
    }

    fn lookup_process(&self, pid: i32) -> Option<ProcessRef> {
        self.procs.get(&pid).cloned()
    }
}

fn scan_processes(users: &HashMap<u32, String>) -> (HashMap<i32, ProcessRef>, HashMap<u64, i32>, usize) {
    let mut procs = HashMap::new();
    let mut inode_to_pid = HashMap::new();
    let mut fd_errors = 0usize;

    let all = match procfs::process::all_processes() {
        Ok(all) => all,
        Err(err) => {
            warn!(error = %err, "process enumeration failed");
            return (procs, inode_to_pid, fd_errors);
        }
    };

    for proc in all.flatten() {
        let pid = proc.pid();
        let name = match proc.stat() {
            Ok(stat) => stat.comm,
            // exited between listing and stat read
            Err(_) => continue,
        };
        let cmdline = proc
            .cmdline()
            .ok()
            .map(|args| args.join(" "))
            .filter(|s| !s.is_empty());
        let username = proc.uid().ok().and_then(|uid| users.get(&uid).cloned());
        procs.insert(
            pid,
            ProcessRef {
                pid,
                name,
                username,
                cmdline,
            },
        );

        match proc.fd() {
            Ok(fds) => {
                for fd in fds.flatten() {
                    if let FDTarget::Socket(inode) = fd.target {
                        inode_to_pid.insert(inode, pid);
                    }
                }
            }
            Err(_) => fd_errors += 1,
        }
    }

    (procs, inode_to_pid, fd_errors)
}

fn read_socket_tables(inode_to_pid: &HashMap<u64, i32>) -> Result<Vec<Connection>, FactsError> {
    let mut conns = Vec::new();
    let mut readable = 0usize;
    let mut failures = Vec::new();

    for (table, result) in [
        ("tcp", procfs::net::tcp()),
        ("tcp6", procfs::net::tcp6()),
    ] {
        match result {
            Ok(entries) => {
                readable += 1;
                for entry in entries {
                    conns.push(tcp_connection(
                        entry.local_address,
                        entry.remote_address,
                        entry.state,
                        inode_to_pid.get(&entry.inode).copied(),
                    ));
                }
            }
            Err(err) => {
                debug!(table, error = %err, "socket table unreadable");
                failures.push(err);
            }
        }
    }

    for (table, result) in [
        ("udp", procfs::net::udp()),
        ("udp6", procfs::net::udp6()),
    ] {
        match result {
            Ok(entries) => {
                readable += 1;
                for entry in entries {
                    conns.push(udp_connection(
                        entry.local_address,
                        entry.remote_address,
                        entry.state,
                        inode_to_pid.get(&entry.inode).copied(),
                    ));
                }
            }
            Err(err) => {
                debug!(table, error = %err, "socket table unreadable");
                failures.push(err);
            }
        }
    }

    if readable == 0 {
        return Err(classify_table_failures(&failures));
    }
    Ok(conns)
}

// with every table unreadable the snapshot would be empty; tell a
// permissions problem apart from a missing or broken /proc/net
fn classify_table_failures(failures: &[procfs::ProcError]) -> FactsError {
    if failures
        .iter()
        .any(|err| matches!(err, procfs::ProcError::PermissionDenied(_)))
    {
        FactsError::PermissionDenied("/proc/net socket tables unreadable".to_string())
    } else {
        FactsError::Unavailable("no socket table under /proc/net could be read".to_string())
    }
}

fn tcp_connection(
    local: SocketAddr,
    remote: SocketAddr,
    state: TcpState,
    owner_pid: Option<i32>,
) -> Connection {
    let status = match state {
        TcpState::Listen => SockStatus::Listen,
        TcpState::Established => SockStatus::Established,
        _ => SockStatus::Other,
    };
    Connection {
        protocol: Protocol::Tcp,
        local: Endpoint::new(local.ip(), local.port()),
        remote: remote_endpoint(remote, status),
        status,
        owner_pid,
    }
}

fn udp_connection(
    local: SocketAddr,
    remote: SocketAddr,
    state: UdpState,
    owner_pid: Option<i32>,
) -> Connection {
    // an unconnected datagram socket is a listener in this model
    let status = match state {
        UdpState::Close => SockStatus::Listen,
        UdpState::Established => SockStatus::Established,
        _ => SockStatus::Other,
    };
    Connection {
        protocol: Protocol::Udp,
        local: Endpoint::new(local.ip(), local.port()),
        remote: remote_endpoint(remote, status),
        status,
        owner_pid,
    }
}

fn remote_endpoint(remote: SocketAddr, status: SockStatus) -> Option<Endpoint> {
    if status == SockStatus::Listen || remote.port() == 0 {
        return None;
    }
    Some(Endpoint::new(remote.ip(), remote.port()))
}

fn read_passwd() -> HashMap<u32, String> {
    fs::read_to_string("/etc/passwd")
        .map(|content| parse_passwd(&content))
        .unwrap_or_default()
}

/// Maps uid to login name from passwd-format text. Malformed lines skipped.
fn parse_passwd(content: &str) -> HashMap<u32, String> {
    let mut users = HashMap::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 3 {
            continue;
        }
        if let Ok(uid) = fields[2].parse::<u32>() {
            users.insert(uid, fields[0].to_string());
        }
    }
    users
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn passwd_maps_uid_to_name() {
        let text = "root:x:0:0:root:/root:/bin/bash\n\
                    daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
                    broken line\n\
                    postgres:x:115:121::/var/lib/postgresql:/bin/bash\n";
        let users = parse_passwd(text);
        assert_eq!(users.get(&0).map(String::as_str), Some("root"));
        assert_eq!(users.get(&115).map(String::as_str), Some("postgres"));
        assert_eq!(users.len(), 3);
    }

    #[test]
    fn listen_entries_have_no_remote() {
        let local: SocketAddr = "0.0.0.0:5432".parse().unwrap();
        let remote: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let conn = tcp_connection(local, remote, TcpState::Listen, Some(10));
        assert_eq!(conn.status, SockStatus::Listen);
        assert!(conn.remote.is_none());
        assert_eq!(conn.local.port, 5432);
    }

    #[test]
    fn denied_tables_classify_as_permission_error() {
        let denied = vec![
            procfs::ProcError::Other("tcp parse failed".to_string()),
            procfs::ProcError::PermissionDenied(None),
        ];
        assert!(matches!(
            classify_table_failures(&denied),
            FactsError::PermissionDenied(_)
        ));

        let unavailable = vec![procfs::ProcError::Other("tcp parse failed".to_string())];
        assert!(matches!(
            classify_table_failures(&unavailable),
            FactsError::Unavailable(_)
        ));
    }

    #[test]
    fn snapshot_sees_own_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let facts = ProcFacts::collect().unwrap();
        let conns = facts.list_connections().unwrap();
        let own = conns
            .iter()
            .find(|c| c.status == SockStatus::Listen && c.local.port == port)
            .expect("own listener visible in snapshot");

        // we can always read our own fd table
        assert_eq!(own.owner_pid, Some(std::process::id() as i32));
        assert_eq!(own.protocol, Protocol::Tcp);
        drop(listener);
    }
}
