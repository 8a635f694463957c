//! Host information for one accepted connection.
//!
//! Expensive lookups (reverse DNS, identd, connection history, probes) run
//! on first access and are cached for the lifetime of the object. A
//! `HostInfo` is exclusively owned by whichever task is processing the
//! connection, so the caches are plain fields, not locks.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use crate::iptime::{self, IpTimeCache};
use crate::services::HostServices;
use crate::util::is_ip_addr;

/// The verification state of the peer's reverse DNS name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostnameStatus {
    /// No name is known for the address.
    Unknown,
    /// There is a name, but it does not exist in the DNS.
    NoForward,
    /// There is a name, but its addresses do not include the peer.
    AddrMismatch,
    /// The name and address information is consistent.
    Good,
}

impl HostnameStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HostnameStatus::Unknown => "unknown",
            HostnameStatus::NoForward => "noforward",
            HostnameStatus::AddrMismatch => "addrmismatch",
            HostnameStatus::Good => "good",
        }
    }
}

impl fmt::Display for HostnameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct NameData {
    status: HostnameStatus,
    /// What the PTR record said, regardless of verification.
    claimed: Option<String>,
    claimed_lower: Option<String>,
    /// Set only when the status is [`HostnameStatus::Good`].
    verified: Option<String>,
    verified_lower: Option<String>,
}

pub struct HostInfo {
    services: Arc<dyn HostServices>,
    iptimes: Arc<IpTimeCache>,

    local: SocketAddrV4,
    remote: SocketAddrV4,

    ip_string: String,
    reversed_ip: Option<String>,

    names: Option<NameData>,
    identd: Option<Option<String>>,
    times: Option<(u64, Option<u64>)>,

    classes: Vec<String>,
    answers: HashMap<u16, bool>,
    lookups: HashMap<String, Vec<Ipv4Addr>>,
}

impl HostInfo {
    pub fn new(
        local: SocketAddrV4,
        remote: SocketAddrV4,
        services: Arc<dyn HostServices>,
        iptimes: Arc<IpTimeCache>,
    ) -> Self {
        Self {
            services,
            iptimes,
            local,
            remote,
            ip_string: remote.ip().to_string(),
            reversed_ip: None,
            names: None,
            identd: None,
            times: None,
            classes: Vec::new(),
            answers: HashMap::new(),
            lookups: HashMap::new(),
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.remote.ip()
    }

    pub fn ip_str(&self) -> &str {
        &self.ip_string
    }

    pub fn ip_num(&self) -> u32 {
        u32::from(*self.remote.ip())
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        *self.local.ip()
    }

    pub fn local_ip_num(&self) -> u32 {
        u32::from(*self.local.ip())
    }

    pub fn port(&self) -> u16 {
        self.remote.port()
    }

    pub fn local_port(&self) -> u16 {
        self.local.port()
    }

    /// The peer address with its octets reversed, as used for DNS
    /// blocklist lookups.
    pub fn reversed_ip(&mut self) -> &str {
        self.reversed_ip.get_or_insert_with(|| {
            let [a, b, c, d] = self.remote.ip().octets();
            format!("{d}.{c}.{b}.{a}")
        })
    }

    fn fill_names(&mut self) -> &NameData {
        if self.names.is_none() {
            self.names = Some(resolve_names(self.services.as_ref(), *self.remote.ip()));
        }

        self.names.as_ref().expect("names were just filled")
    }

    pub fn hostname_status(&mut self) -> HostnameStatus {
        self.fill_names().status
    }

    /// The verified hostname; present only when the status is good.
    pub fn hostname(&mut self) -> Option<&str> {
        self.fill_names();
        self.names.as_ref().and_then(|n| n.verified.as_deref())
    }

    pub fn hostname_lower(&mut self) -> Option<&str> {
        self.fill_names();
        self.names
            .as_ref()
            .and_then(|n| n.verified_lower.as_deref())
    }

    /// Whatever the reverse lookup said, verified or not.
    pub fn claimed_hostname(&mut self) -> Option<&str> {
        self.fill_names();
        self.names.as_ref().and_then(|n| n.claimed.as_deref())
    }

    pub fn claimed_hostname_lower(&mut self) -> Option<&str> {
        self.fill_names();
        self.names.as_ref().and_then(|n| n.claimed_lower.as_deref())
    }

    pub fn identd(&mut self) -> Option<&str> {
        if self.identd.is_none() {
            self.identd = Some(self.services.identd(self.remote, self.local));
        }

        self.identd.as_ref().and_then(|id| id.as_deref())
    }

    fn fill_times(&mut self) -> (u64, Option<u64>) {
        *self
            .times
            .get_or_insert_with(|| self.iptimes.touch(*self.remote.ip(), iptime::unix_now()))
    }

    /// Seconds since the first connection from this address; zero on first
    /// sight.
    pub fn first_time(&mut self) -> u64 {
        self.fill_times().0
    }

    /// Seconds since the previous connection from this address, or `None`
    /// on first sight.
    pub fn last_time(&mut self) -> Option<u64> {
        self.fill_times().1
    }

    /// Test installs of precomputed values.
    pub fn set_times(&mut self, first: u64, last: Option<u64>) {
        self.times = Some((first, last));
    }

    pub fn answers_on(&mut self, port: u16) -> bool {
        if let Some(known) = self.answers.get(&port) {
            return *known;
        }
        let result = self.services.answers_on(*self.remote.ip(), port);
        self.answers.insert(port, result);

        result
    }

    pub fn host_ips(&mut self, name: &str) -> &[Ipv4Addr] {
        if !self.lookups.contains_key(name) {
            let ips = self.services.forward_lookup(name);
            self.lookups.insert(name.to_owned(), ips);
        }

        self.lookups.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Class membership accumulates on the connection as rules match.
    /// Set semantics, insertion order preserved.
    pub fn add_class(&mut self, class: &str) {
        if !self.classes.iter().any(|c| c == class) {
            self.classes.push(class.to_owned());
        }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// `user@name` or `user@ip`, from whatever has been computed so far.
    /// Never triggers a lookup.
    pub fn pretty(&self, ip_only: bool) -> String {
        let prefix = match self.identd.as_ref().and_then(|id| id.as_deref()) {
            Some(user) => format!("{user}@"),
            None => String::new(),
        };
        let name = self
            .names
            .as_ref()
            .and_then(|n| n.verified.as_deref())
            .filter(|_| !ip_only)
            .unwrap_or(&self.ip_string);

        format!("{prefix}{name}")
    }

    /// The substitution dictionary for message formatting, built from what
    /// we know. Optional keys appear only once computed.
    pub fn info(&self) -> BTreeMap<&'static str, String> {
        let mut d = BTreeMap::new();
        d.insert("ip", self.ip_string.clone());
        d.insert("remport", self.remote.port().to_string());
        d.insert("localip", self.local.ip().to_string());
        d.insert("port", self.local.port().to_string());
        if let Some(names) = &self.names {
            d.insert("hnstatus", names.status.to_string());
            if let Some(claimed) = &names.claimed {
                d.insert("claimedhn", claimed.clone());
            }
        }
        d.insert(
            "hostname",
            self.names
                .as_ref()
                .and_then(|n| n.verified.clone())
                .unwrap_or_else(|| self.ip_string.clone()),
        );
        if let Some(Some(user)) = &self.identd {
            d.insert("identd", user.clone());
        }
        if let Some((first, last)) = &self.times {
            d.insert("seensince", first.to_string());
            if let Some(last) = last {
                d.insert("lastseen", last.to_string());
            }
        }
        d.insert("connsum", self.pretty(false));
        d.insert("connipsum", self.pretty(true));

        d
    }
}

impl fmt::Debug for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostInfo")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("classes", &self.classes)
            .finish_non_exhaustive()
    }
}

/// Determines the name of an address as paranoidly as possible.
fn resolve_names(services: &dyn HostServices, ip: Ipv4Addr) -> NameData {
    let absent = NameData {
        status: HostnameStatus::Unknown,
        claimed: None,
        claimed_lower: None,
        verified: None,
        verified_lower: None,
    };

    let Some(claimed) = services.reverse_lookup(ip) else {
        return absent;
    };
    let claimed_lower = claimed.to_lowercase();

    // The forward lookup would happily resolve a literal address, so that
    // case has to be caught explicitly.
    let status = if is_ip_addr(&claimed) {
        HostnameStatus::NoForward
    } else {
        let forward = services.forward_lookup(&claimed);
        if forward.is_empty() {
            HostnameStatus::NoForward
        } else if forward.contains(&ip) {
            HostnameStatus::Good
        } else {
            HostnameStatus::AddrMismatch
        }
    };

    let (verified, verified_lower) = if status == HostnameStatus::Good {
        (Some(claimed.clone()), Some(claimed_lower.clone()))
    } else {
        (None, None)
    };

    NameData {
        status,
        claimed: Some(claimed),
        claimed_lower: Some(claimed_lower),
        verified,
        verified_lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeServices, hostinfo_from};

    #[test]
    fn good_names_verify() {
        let mut hi = hostinfo_from("127.0.0.103:4000");

        assert_eq!(hi.hostname_status(), HostnameStatus::Good);
        assert_eq!(hi.hostname(), Some("is-a-good-name"));
        assert_eq!(hi.claimed_hostname(), Some("is-a-good-name"));
    }

    #[test]
    fn missing_reverse_is_unknown() {
        let mut hi = hostinfo_from("127.0.0.104:4000");

        assert_eq!(hi.hostname_status(), HostnameStatus::Unknown);
        assert_eq!(hi.hostname(), None);
        assert_eq!(hi.claimed_hostname(), None);
    }

    #[test]
    fn literal_ip_reverse_is_noforward() {
        let mut hi = hostinfo_from("127.0.0.100:4000");

        assert_eq!(hi.hostname_status(), HostnameStatus::NoForward);
        assert_eq!(hi.hostname(), None);
        assert_eq!(hi.claimed_hostname(), Some("127.0.0.100"));
    }

    #[test]
    fn unresolvable_reverse_is_noforward() {
        let mut hi = hostinfo_from("127.0.0.101:4000");

        assert_eq!(hi.hostname_status(), HostnameStatus::NoForward);
        assert_eq!(hi.claimed_hostname(), Some("not-a-forward"));
    }

    #[test]
    fn mismatched_forward_is_addrmismatch() {
        let mut hi = hostinfo_from("127.0.0.102:4000");

        assert_eq!(hi.hostname_status(), HostnameStatus::AddrMismatch);
        assert_eq!(hi.hostname(), None);
        assert_eq!(hi.claimed_hostname(), Some("mismatch-reverse"));
    }

    #[test]
    fn mixed_case_names_lowercase() {
        let mut hi = hostinfo_from("127.0.2.1:4000");

        assert_eq!(hi.hostname_status(), HostnameStatus::Good);
        assert_eq!(hi.hostname(), Some("BIGBUCKS.SMACK.COM"));
        assert_eq!(hi.hostname_lower(), Some("bigbucks.smack.com"));
    }

    #[test]
    fn identd_answers_are_cached() {
        let mut hi = hostinfo_from("127.0.0.1:202");

        assert_eq!(hi.identd(), Some("cks"));
        assert_eq!(hi.identd(), Some("cks"));

        let mut hi = hostinfo_from("127.0.0.1:4000");
        assert_eq!(hi.identd(), None);
    }

    #[test]
    fn reversed_ip_flips_octets() {
        let mut hi = hostinfo_from("10.11.12.13:4000");

        assert_eq!(hi.reversed_ip(), "13.12.11.10");
    }

    #[test]
    fn classes_keep_insertion_order_without_duplicates() {
        let mut hi = hostinfo_from("127.0.0.1:4000");
        hi.add_class("b");
        hi.add_class("a");
        hi.add_class("b");

        assert_eq!(hi.classes(), ["b".to_owned(), "a".to_owned()]);
    }

    #[test]
    fn info_grows_as_fields_are_computed() {
        let mut hi = hostinfo_from("127.0.0.103:4000");

        let d = hi.info();
        assert_eq!(d.get("ip"), Some(&"127.0.0.103".to_owned()));
        assert_eq!(d.get("hostname"), Some(&"127.0.0.103".to_owned()));
        assert_eq!(d.get("remport"), Some(&"4000".to_owned()));
        assert_eq!(d.get("port"), Some(&"23".to_owned()));
        assert_eq!(d.get("localip"), Some(&"127.0.0.1".to_owned()));
        assert!(!d.contains_key("hnstatus"));
        assert!(!d.contains_key("seensince"));

        hi.hostname_status();
        hi.set_times(30, Some(7));
        let d = hi.info();
        assert_eq!(d.get("hostname"), Some(&"is-a-good-name".to_owned()));
        assert_eq!(d.get("hnstatus"), Some(&"good".to_owned()));
        assert_eq!(d.get("seensince"), Some(&"30".to_owned()));
        assert_eq!(d.get("lastseen"), Some(&"7".to_owned()));
    }

    #[test]
    fn pretty_prefers_identd_and_hostname() {
        let mut hi = hostinfo_from("127.0.0.103:202");

        assert_eq!(hi.pretty(false), "127.0.0.103");
        hi.identd();
        hi.hostname_status();
        assert_eq!(hi.pretty(false), "cks@is-a-good-name");
        assert_eq!(hi.pretty(true), "cks@127.0.0.103");
    }

    #[test]
    fn first_access_touches_the_time_cache() {
        let services = Arc::new(FakeServices::new());
        let iptimes = Arc::new(IpTimeCache::new(None));
        let local = "127.0.0.1:23".parse().unwrap();
        let remote = "10.0.0.9:5000".parse().unwrap();

        let mut hi = HostInfo::new(local, remote, services.clone(), iptimes.clone());
        assert_eq!(hi.first_time(), 0);
        assert_eq!(hi.last_time(), None);
        assert_eq!(iptimes.len(), 1);

        // A second connection from the same address sees history.
        let mut hi = HostInfo::new(local, remote, services, iptimes);
        assert!(hi.last_time().is_some());
    }

    #[test]
    fn forward_lookups_are_cached_per_hostinfo() {
        let mut hi = hostinfo_from("127.0.0.1:4000");

        let first = hi.host_ips("many-ip-addrs").to_vec();
        assert_eq!(first.len(), 4);
        assert_eq!(hi.host_ips("many-ip-addrs"), first.as_slice());
        assert!(hi.host_ips("no-such-name").is_empty());
    }
}
