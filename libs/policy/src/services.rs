//! External lookups about the remote peer.
//!
//! Everything a [`HostInfo`](crate::hostinfo::HostInfo) needs to learn about
//! a connection goes through this trait, so tests can substitute a
//! table-driven fake. All operations are blocking with hard deadlines and
//! absorb errors into "absent" answers.

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, TcpStream};
use std::time::Duration;

use crate::identd;

/// Experimental values.
pub const IDENTD_TIMEOUT: Duration = Duration::from_millis(500);
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

pub trait HostServices: Send + Sync {
    /// The PTR name for an address, if any.
    fn reverse_lookup(&self, ip: Ipv4Addr) -> Option<String>;

    /// All IPv4 addresses a name resolves to; empty on failure.
    fn forward_lookup(&self, name: &str) -> Vec<Ipv4Addr>;

    /// The identd-advertised user for the connection, if any.
    fn identd(&self, remote: SocketAddrV4, local: SocketAddrV4) -> Option<String>;

    /// Whether the peer accepts TCP connections on `port`.
    fn answers_on(&self, ip: Ipv4Addr, port: u16) -> bool;
}

/// The real thing: libc resolver, RFC 1413 client, connect probe.
#[derive(Debug, Default)]
pub struct SystemServices;

impl HostServices for SystemServices {
    fn reverse_lookup(&self, ip: Ipv4Addr) -> Option<String> {
        dns_lookup::lookup_addr(&IpAddr::V4(ip)).ok()
    }

    fn forward_lookup(&self, name: &str) -> Vec<Ipv4Addr> {
        dns_lookup::lookup_host(name)
            .into_iter()
            .flatten()
            .filter_map(|addr| match addr {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect()
    }

    fn identd(&self, remote: SocketAddrV4, local: SocketAddrV4) -> Option<String> {
        identd::ident(remote, local, IDENTD_TIMEOUT)
    }

    fn answers_on(&self, ip: Ipv4Addr, port: u16) -> bool {
        TcpStream::connect_timeout(&(ip, port).into(), CONNECT_TIMEOUT).is_ok()
    }
}
