//! Predicates over the characteristics of a connection.
//!
//! Characteristics are expressed broadly in the style of tcpwrappers, plus
//! regexps on the remote host name, DNS blocklist lookups, and information
//! about previous connections from the same address. Matchers either take a
//! required argument (their table name ends in `:`) or none at all; the
//! simplest no-argument matcher is `ALL`.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use doorman_netblock::IpRanges;
use regex::Regex;

use crate::hostinfo::{HostInfo, HostnameStatus};
use crate::memo::Memos;
use crate::util::{duration_secs, is_ip_addr};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BadArg {
    #[error("bad characters in IP address match {0}")]
    BadIpChars(String),
    #[error("bad IP address specifier: {0}")]
    BadIpPrefix(String),
    #[error("bad CIDR netblock {0}: {1}")]
    BadNetblock(String, String),
    #[error("bad regexp '{0}': {1}")]
    BadRegex(String, String),
    #[error("bad hostname: {0}")]
    BadHostname(String),
    #[error("unrecognized hostname state: {0}")]
    BadHostnameState(String),
    #[error("bad local: values: {0}")]
    BadLocal(String),
    #[error("bad position of / in dnsbl: argument: {0}")]
    BadDnsblSlash(String),
    #[error("dnsbl: IP address portion isn't an IP address: {0}")]
    BadDnsblIp(String),
    #[error("not an integer: {0}")]
    NotAnInteger(String),
    #[error("port number outside of OK range: {0}")]
    BadPort(String),
    #[error("{0}")]
    BadDuration(#[from] crate::util::DurationError),
    #[error("matcher {0} takes no argument")]
    UnwantedArgument(String),
    #[error("matcher {0} requires an argument")]
    MissingArgument(String),
    #[error("no handler called {0}")]
    UnknownMatcher(String),
}

/// Which end of the connection an address matcher looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Remote,
    Local,
}

/// Which name a hostname/regexp matcher looks at: the verified one, or
/// whatever the reverse lookup claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameSource {
    Verified,
    Claimed,
}

/// Address matching. Supports literal addresses, CIDR netblocks,
/// `LOW-HIGH` ranges, and tcpwrappers-style shortened prefixes
/// (`127.10.`). Adjacent address matchers over the same side merge into
/// one set at parse time.
#[derive(Debug, Clone)]
pub struct IpAddrMatcher {
    side: Side,
    /// The argument strings, in the order given.
    parts: Vec<String>,
    /// Set when this is a single prefix-style match.
    prefix: Option<String>,
    /// Set by finalization for everything else.
    ranges: Option<Arc<IpRanges>>,
}

/// Is this a good partial IP address, tcpwrappers style? Called on a
/// string that ends in a dot and contains only digits and dots.
fn validate_ip_prefix(val: &str) -> Result<(), BadArg> {
    let octets = val.split('.').collect::<Vec<_>>();
    // The trailing dot leaves an empty final element.
    let octets = &octets[..octets.len() - 1];
    if octets.is_empty() || octets.len() > 3 {
        return Err(BadArg::BadIpPrefix(val.to_owned()));
    }
    for octet in octets {
        if octet.is_empty() || octet.parse::<u8>().is_err() {
            return Err(BadArg::BadIpPrefix(val.to_owned()));
        }
    }

    Ok(())
}

/// Do we accept this as some form of IP address specification?
fn valid_ip_spec(val: &str) -> bool {
    !val.starts_with('.')
        && !val.is_empty()
        && val.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | '/' | '-'))
}

impl IpAddrMatcher {
    fn new(side: Side, val: &str, check: bool) -> Result<Self, BadArg> {
        if check && !valid_ip_spec(val) {
            return Err(BadArg::BadIpChars(val.to_owned()));
        }
        let prefix = if val.contains('/') || val.contains('-') || !val.ends_with('.') {
            // Validation happens in finalization.
            None
        } else {
            validate_ip_prefix(val)?;
            Some(val.to_owned())
        };

        Ok(Self {
            side,
            parts: vec![val.to_owned()],
            prefix,
            ranges: None,
        })
    }

    fn cname(&self) -> &'static str {
        match self.side {
            Side::Remote => "ip:",
            Side::Local => "localip:",
        }
    }

    /// Folds another address matcher over the same side into this one.
    /// The real work happens in finalization.
    pub fn merge(&mut self, other: &IpAddrMatcher) -> bool {
        if other.side != self.side {
            return false;
        }
        self.prefix = None;
        self.parts.extend(other.parts.iter().cloned());

        true
    }

    pub fn finalize(&mut self, memos: &mut Memos) -> Result<(), BadArg> {
        // A single prefix-style part stays a plain string match.
        if self.parts.len() == 1 && self.prefix.is_some() {
            return Ok(());
        }
        self.ranges = Some(memos.compile_ranges(&self.parts)?);
        self.prefix = None;

        Ok(())
    }

    fn eval(&self, hi: &mut HostInfo) -> bool {
        if let Some(prefix) = &self.prefix {
            let s = match self.side {
                Side::Remote => hi.ip_str().to_owned(),
                Side::Local => hi.local_ip().to_string(),
            };
            return s.starts_with(prefix.as_str());
        }
        let Some(ranges) = &self.ranges else {
            // Never finalized; cannot match anything.
            return false;
        };
        let num = match self.side {
            Side::Remote => hi.ip_num(),
            Side::Local => hi.local_ip_num(),
        };

        ranges.contains(num)
    }
}

impl fmt::Display for IpAddrMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .parts
            .iter()
            .map(|p| format!("{} {}", self.cname(), p))
            .collect::<Vec<_>>()
            .join(" ");
        f.write_str(&rendered)
    }
}

/// Under some mental protest, `_` is accepted as a valid character in
/// hostnames; strictly speaking it is not, but it is in common usage.
fn valid_hostname(hn: &str) -> bool {
    hn != "."
        && !hn.is_empty()
        && hn
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'))
}

/// The kinds of timed matches over the per-IP connection history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeKind {
    /// First connection was more than N seconds ago.
    Waited,
    /// First connection was within the last N seconds.
    StallFor,
    /// Previous connection was within the last N seconds.
    SeenWithin,
    /// Previous connection was more than N seconds ago (or never).
    NotSeenFor,
}

impl TimeKind {
    fn cname(self) -> &'static str {
        match self {
            TimeKind::Waited => "waited:",
            TimeKind::StallFor => "stallfor:",
            TimeKind::SeenWithin => "seenwithin:",
            TimeKind::NotSeenFor => "notseenfor:",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Matcher {
    All,
    Identd { want: Option<String> },
    Local { host: Option<Ipv4Addr>, port: Option<u16> },
    HnStatus { name: String, states: Vec<HostnameStatus> },
    IpAddr(IpAddrMatcher),
    Hostname { source: NameSource, host: String, tail: Option<String> },
    Class { name: String },
    Regex { source: NameSource, pattern: Arc<Regex> },
    Forwhn { host: String },
    Dnsbl { zone: String, want_ip: Option<Ipv4Addr> },
    AnswersOn { port: u16 },
    Timed { kind: TimeKind, secs: u64 },
    FirstTime,
}

fn hnstatus_states(val: &str) -> Option<Vec<HostnameStatus>> {
    use HostnameStatus::*;

    let states = match val {
        "KNOWN" | "good" => vec![Good],
        "UNKNOWN" | "unknown" => vec![Unknown],
        "PARANOID" => vec![NoForward, AddrMismatch],
        "noforward" => vec![NoForward],
        "addrmismatch" => vec![AddrMismatch],
        _ => return None,
    };

    Some(states)
}

fn hostname_matcher(source: NameSource, val: &str) -> Result<Matcher, BadArg> {
    let val = val.to_lowercase();
    if !valid_hostname(&val) {
        return Err(BadArg::BadHostname(val));
    }
    // A leading dot matches either `nnn.foobar` or `foobar` itself, so both
    // the tail form and the bare name are kept.
    let (host, tail) = match val.strip_prefix('.') {
        Some(host) => (host.to_owned(), Some(val.clone())),
        None => (val, None),
    };

    Ok(Matcher::Hostname { source, host, tail })
}

fn dnsbl_matcher(val: &str) -> Result<Matcher, BadArg> {
    if val.starts_with('/') || val.ends_with('/') {
        // Very funny: -10 points.
        return Err(BadArg::BadDnsblSlash(val.to_owned()));
    }
    let (zone, want_ip) = match val.split_once('/') {
        Some((zone, ip)) => {
            if !is_ip_addr(ip) {
                return Err(BadArg::BadDnsblIp(val.to_owned()));
            }
            (zone, Some(ip.parse().map_err(|_| BadArg::BadDnsblIp(val.to_owned()))?))
        }
        None => (val, None),
    };

    Ok(Matcher::Dnsbl {
        zone: format!(".{zone}"),
        want_ip,
    })
}

fn timed_matcher(kind: TimeKind, val: &str) -> Result<Matcher, BadArg> {
    let secs = duration_secs(val)?;

    Ok(Matcher::Timed {
        kind,
        secs: secs.max(0) as u64,
    })
}

/// Builds a matcher from a terminal name and its optional argument.
///
/// Names ending in `:` require an argument; bare names refuse one. This is
/// the table the expression parser consults.
pub fn make_matcher(name: &str, val: Option<&str>, memos: &mut Memos) -> Result<Matcher, BadArg> {
    let required = || val.ok_or_else(|| BadArg::MissingArgument(name.to_owned()));
    let forbidden = || match val {
        Some(_) => Err(BadArg::UnwantedArgument(name.to_owned())),
        None => Ok(()),
    };

    match name {
        "ALL" => {
            forbidden()?;
            Ok(Matcher::All)
        }
        "identd:" => Ok(Matcher::Identd {
            want: Some(required()?.to_owned()),
        }),
        "IDENTD" => {
            forbidden()?;
            Ok(Matcher::Identd { want: None })
        }
        "local:" => {
            let val = required()?;
            let (host, port) = crate::util::parse_host_port(val)
                .ok_or_else(|| BadArg::BadLocal(val.to_owned()))?;

            Ok(Matcher::Local { host, port })
        }
        "hnstatus:" => {
            let val = required()?;
            let states =
                hnstatus_states(val).ok_or_else(|| BadArg::BadHostnameState(val.to_owned()))?;

            Ok(Matcher::HnStatus {
                name: val.to_owned(),
                states,
            })
        }
        // The tcpwrappers aliases double as zero-argument terminals.
        "KNOWN" | "UNKNOWN" | "PARANOID" => {
            let val = val.unwrap_or(name);
            let states =
                hnstatus_states(val).ok_or_else(|| BadArg::BadHostnameState(val.to_owned()))?;

            Ok(Matcher::HnStatus {
                name: val.to_owned(),
                states,
            })
        }
        "ip:" => Ok(Matcher::IpAddr(IpAddrMatcher::new(
            Side::Remote,
            required()?,
            true,
        )?)),
        "localip:" => Ok(Matcher::IpAddr(IpAddrMatcher::new(
            Side::Local,
            required()?,
            true,
        )?)),
        "hostname:" => hostname_matcher(NameSource::Verified, required()?),
        "claimedhn:" => hostname_matcher(NameSource::Claimed, required()?),
        "re:" => Ok(Matcher::Regex {
            source: NameSource::Verified,
            pattern: memos.compile_regex(required()?)?,
        }),
        "claimedre:" => Ok(Matcher::Regex {
            source: NameSource::Claimed,
            pattern: memos.compile_regex(required()?)?,
        }),
        "forwhn:" => {
            let val = required()?.to_lowercase();
            if !valid_hostname(&val) {
                return Err(BadArg::BadHostname(val));
            }

            Ok(Matcher::Forwhn { host: val })
        }
        "dnsbl:" => dnsbl_matcher(required()?),
        "answerson:" => {
            let val = required()?;
            let port = val
                .parse::<u32>()
                .map_err(|_| BadArg::NotAnInteger(val.to_owned()))?;
            if port > 65535 {
                return Err(BadArg::BadPort(val.to_owned()));
            }

            Ok(Matcher::AnswersOn { port: port as u16 })
        }
        "stallfor:" => timed_matcher(TimeKind::StallFor, required()?),
        "waited:" => timed_matcher(TimeKind::Waited, required()?),
        "seenwithin:" => timed_matcher(TimeKind::SeenWithin, required()?),
        "notseenfor:" => timed_matcher(TimeKind::NotSeenFor, required()?),
        "firsttime" => {
            forbidden()?;
            Ok(Matcher::FirstTime)
        }
        "class:" => Ok(Matcher::Class {
            name: required()?.to_owned(),
        }),
        _ => Err(BadArg::UnknownMatcher(name.to_owned())),
    }
}

/// The fallback for bare words: first an IP address form, then a hostname.
pub fn default_matcher(word: &str, memos: &mut Memos) -> Result<Matcher, BadArg> {
    if valid_ip_spec(word) {
        return Ok(Matcher::IpAddr(IpAddrMatcher::new(Side::Remote, word, false)?));
    }

    make_matcher("hostname:", Some(word), memos)
}

impl Matcher {
    pub fn eval(&self, hi: &mut HostInfo) -> bool {
        match self {
            Matcher::All => true,
            Matcher::Identd { want } => match (hi.identd(), want) {
                (None, _) => false,
                (Some(id), Some(want)) => id == want.as_str(),
                (Some(_), None) => true,
            },
            Matcher::Local { host, port } => {
                if port.is_some_and(|p| p != hi.local_port()) {
                    return false;
                }
                if host.is_some_and(|h| h != hi.local_ip()) {
                    return false;
                }

                true
            }
            Matcher::HnStatus { states, .. } => states.contains(&hi.hostname_status()),
            Matcher::IpAddr(m) => m.eval(hi),
            Matcher::Hostname { source, host, tail } => {
                let hn = match source {
                    NameSource::Verified => hi.hostname_lower(),
                    NameSource::Claimed => hi.claimed_hostname_lower(),
                };
                let Some(hn) = hn else {
                    return false;
                };
                match tail {
                    Some(tail) => hn.ends_with(tail.as_str()) || hn == host,
                    None => hn == host,
                }
            }
            Matcher::Class { name } => hi.classes().iter().any(|c| c == name),
            Matcher::Regex { source, pattern } => {
                let hn = match source {
                    NameSource::Verified => hi.hostname(),
                    NameSource::Claimed => hi.claimed_hostname(),
                };

                hn.is_some_and(|hn| pattern.is_match(hn))
            }
            Matcher::Forwhn { host } => {
                let ip = hi.ip();

                hi.host_ips(host).contains(&ip)
            }
            Matcher::Dnsbl { zone, want_ip } => {
                let name = format!("{}{}", hi.reversed_ip(), zone);
                let ips = hi.host_ips(&name);
                match want_ip {
                    None => !ips.is_empty(),
                    Some(want) => ips.contains(want),
                }
            }
            Matcher::AnswersOn { port } => hi.answers_on(*port),
            Matcher::Timed { kind, secs } => match kind {
                TimeKind::Waited => hi.first_time() > *secs,
                TimeKind::StallFor => hi.first_time() <= *secs,
                TimeKind::SeenWithin => hi.last_time().is_some_and(|t| t <= *secs),
                TimeKind::NotSeenFor => hi.last_time().is_none_or(|t| t > *secs),
            },
            Matcher::FirstTime => hi.last_time().is_none(),
        }
    }

    /// Supports the OR-list merge protocol: adjacent address matchers over
    /// the same side collapse into one.
    pub fn try_merge(&mut self, other: &Matcher) -> bool {
        let (Matcher::IpAddr(mine), Matcher::IpAddr(theirs)) = (self, other) else {
            return false;
        };

        mine.merge(theirs)
    }

    pub fn is_mergeable(&self) -> bool {
        matches!(self, Matcher::IpAddr(_))
    }

    pub fn finalize(&mut self, memos: &mut Memos) -> Result<(), BadArg> {
        match self {
            Matcher::IpAddr(m) => m.finalize(memos),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::All => f.write_str("ALL"),
            Matcher::Identd { want: Some(want) } => write!(f, "identd: {want}"),
            Matcher::Identd { want: None } => f.write_str("IDENTD"),
            Matcher::Local { host, port } => {
                let host = host.map(|h| h.to_string()).unwrap_or_default();
                let port = port.map(|p| p.to_string()).unwrap_or_default();
                write!(f, "local: {port}@{host}")
            }
            Matcher::HnStatus { name, .. } => write!(f, "hnstatus: {name}"),
            Matcher::IpAddr(m) => m.fmt(f),
            Matcher::Hostname { source, host, tail } => {
                let cname = match source {
                    NameSource::Verified => "hostname:",
                    NameSource::Claimed => "claimedhn:",
                };
                match tail {
                    Some(tail) => write!(f, "{cname} {tail}"),
                    None => write!(f, "{cname} {host}"),
                }
            }
            Matcher::Class { name } => write!(f, "class: {name}"),
            Matcher::Regex { source, pattern } => {
                let cname = match source {
                    NameSource::Verified => "re:",
                    NameSource::Claimed => "claimedre:",
                };
                write!(f, "{cname} '{}'", pattern.as_str())
            }
            Matcher::Forwhn { host } => write!(f, "forwhn: {host}"),
            Matcher::Dnsbl { zone, want_ip } => {
                // The leading period was glued on at parse time.
                let zone = &zone[1..];
                match want_ip {
                    Some(ip) => write!(f, "dnsbl: {zone}/{ip}"),
                    None => write!(f, "dnsbl: {zone}"),
                }
            }
            Matcher::AnswersOn { port } => write!(f, "answerson: {port}"),
            Matcher::Timed { kind, secs } => write!(f, "{} {}s", kind.cname(), secs),
            Matcher::FirstTime => f.write_str("firsttime"),
        }
    }
}
