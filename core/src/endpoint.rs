//! Endpoint normalization at the facts boundary.
//!
//! Every address entering the pipeline is turned into an [`Endpoint`] here,
//! whatever shape the source handed over: a decomposed (ip, port) pair, a
//! plain `ip:port` string, or a bracketed IPv6 literal like `[::1]:5432`.
//! Downstream components never see raw address strings.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// A normalized network endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    /// Build an endpoint from already-decomposed parts.
    ///
    /// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`, as dual-stack socket
    /// tables report them) collapse to their IPv4 form so loopback
    /// classification sees one representation per address.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let ip = match ip {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        Endpoint { ip, port }
    }

    /// True when the address is same-host: 127.0.0.0/8 or ::1.
    pub fn is_loopback(&self) -> bool {
        self.ip.is_loopback()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V6(v6) => write!(f, "[{}]:{}", v6, self.port),
            IpAddr::V4(v4) => write!(f, "{}:{}", v4, self.port),
        }
    }
}

/// Parse a textual address into an endpoint.
///
/// Accepts `ip:port`, `[v6]:port`, and the unbracketed `v6:port` form some
/// tools emit; the port is always the piece after the last colon.
pub fn parse_endpoint(s: &str) -> Result<Endpoint> {
    if let Ok(sa) = SocketAddr::from_str(s) {
        return Ok(Endpoint::new(sa.ip(), sa.port()));
    }
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("address missing port: {}", s))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let ip = IpAddr::from_str(host).map_err(|_| anyhow!("invalid address: {}", s))?;
    let port: u16 = port.parse().map_err(|_| anyhow!("invalid port in address: {}", s))?;
    Ok(Endpoint::new(ip, port))
}
