//! Static well-known port labels.

/// Conventional labels for commonly deployed services, sorted by port.
const WELL_KNOWN: &[(u16, &str)] = &[
    (20, "FTP-DATA"),
    (21, "FTP"),
    (22, "SSH"),
    (23, "Telnet"),
    (25, "SMTP"),
    (53, "DNS"),
    (80, "HTTP"),
    (110, "POP3"),
    (143, "IMAP"),
    (443, "HTTPS"),
    (445, "SMB"),
    (587, "SMTP-Submission"),
    (993, "IMAPS"),
    (995, "POP3S"),
    (1433, "MS-SQL"),
    (1521, "Oracle-DB"),
    (3306, "MySQL"),
    (3389, "RDP"),
    (5432, "PostgreSQL"),
    (5672, "AMQP/RabbitMQ"),
    (5900, "VNC"),
    (6379, "Redis"),
    (8080, "HTTP-Alt"),
    (8443, "HTTPS-Alt"),
    (9200, "Elasticsearch"),
    (11211, "Memcached"),
    (27017, "MongoDB"),
    (50000, "DB2"),
];

/// Exact label for a well-known port, if there is one.
pub fn well_known(port: u16) -> Option<&'static str> {
    WELL_KNOWN
        .binary_search_by_key(&port, |e| e.0)
        .ok()
        .map(|i| WELL_KNOWN[i].1)
}

/// Label for any port: the well-known name, or `Unknown-<port>`.
pub fn label(port: u16) -> String {
    match well_known(port) {
        Some(name) => name.to_string(),
        None => format!("Unknown-{}", port),
    }
}
