//! Table-driven fakes for the host-lookup services, shared by the unit
//! tests of this crate.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use crate::hostinfo::HostInfo;
use crate::iptime::IpTimeCache;
use crate::services::HostServices;

pub struct FakeServices {
    reverse: HashMap<Ipv4Addr, String>,
    forward: HashMap<String, Vec<Ipv4Addr>>,
    /// identd answers keyed by the remote port.
    identd: HashMap<u16, String>,
    /// ports the "peer" answers on.
    open_ports: Vec<u16>,
}

fn ip(s: &str) -> Ipv4Addr {
    s.parse().expect("test addresses are literal")
}

impl FakeServices {
    pub fn new() -> Self {
        let reverse = [
            ("127.0.0.1", "localhost"),
            ("127.0.0.100", "127.0.0.100"),
            ("127.0.0.101", "not-a-forward"),
            ("127.0.0.102", "mismatch-reverse"),
            ("127.0.0.103", "is-a-good-name"),
            ("127.0.0.105", "many-ip-addrs"),
            ("127.100.2.0", "many-ip-addrs"),
            // 127.0.0.104 deliberately has no reverse name.
            ("127.0.1.1", "franklin.com"),
            ("127.0.1.2", "b.a.franklin.com"),
            ("127.0.2.1", "BIGBUCKS.SMACK.COM"),
        ]
        .into_iter()
        .map(|(a, n)| (ip(a), n.to_owned()))
        .collect();

        let forward = [
            ("localhost", vec!["127.0.0.1"]),
            ("is-a-good-name", vec!["127.0.0.103"]),
            ("mismatch-reverse", vec!["127.0.0.255"]),
            (
                "many-ip-addrs",
                vec!["127.100.0.0", "127.100.1.0", "127.100.2.0", "127.0.0.105"],
            ),
            ("franklin.com", vec!["127.0.1.1"]),
            ("b.a.franklin.com", vec!["127.0.1.2"]),
            ("BIGBUCKS.SMACK.COM", vec!["127.0.2.1"]),
            ("no-reverse-name", vec!["127.0.10.1"]),
            // DNS blocklist entries.
            ("10.11.12.13.dnsbl1", vec!["127.0.0.4"]),
            ("5.6.7.8.dnsbl1", vec!["127.0.0.3"]),
            ("1.2.3.15.dnsbl2", vec!["127.0.0.5", "127.0.0.6"]),
        ]
        .into_iter()
        .map(|(n, ips)| (n.to_owned(), ips.into_iter().map(ip).collect()))
        .collect();

        let identd = [(202, "cks"), (203, "[abcdef]")]
            .into_iter()
            .map(|(p, u)| (p, u.to_owned()))
            .collect();

        Self {
            reverse,
            forward,
            identd,
            open_ports: vec![25, 80],
        }
    }
}

impl HostServices for FakeServices {
    fn reverse_lookup(&self, ip: Ipv4Addr) -> Option<String> {
        self.reverse.get(&ip).cloned()
    }

    fn forward_lookup(&self, name: &str) -> Vec<Ipv4Addr> {
        self.forward.get(name).cloned().unwrap_or_default()
    }

    fn identd(&self, remote: SocketAddrV4, _local: SocketAddrV4) -> Option<String> {
        self.identd.get(&remote.port()).cloned()
    }

    fn answers_on(&self, _ip: Ipv4Addr, port: u16) -> bool {
        self.open_ports.contains(&port)
    }
}

/// A `HostInfo` for a connection from `remote` (as `ip:port`) to the
/// standard local endpoint 127.0.0.1:23, backed by the fake tables and a
/// fresh time cache.
pub fn hostinfo_from(remote: &str) -> HostInfo {
    hostinfo_between("127.0.0.1:23", remote)
}

pub fn hostinfo_between(local: &str, remote: &str) -> HostInfo {
    HostInfo::new(
        local.parse().expect("test addresses are literal"),
        remote.parse().expect("test addresses are literal"),
        Arc::new(FakeServices::new()),
        Arc::new(IpTimeCache::new(None)),
    )
}
