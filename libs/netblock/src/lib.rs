#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Sets of IPv4 address ranges.
//!
//! An [`IpRanges`] accepts plain addresses, CIDR netblocks (including short
//! forms such as `127.0/16`), and `LOW-HIGH` ranges, merges everything into a
//! sorted list of disjoint inclusive ranges, and can decompose itself back
//! into minimal CIDR netblocks.

use std::fmt;
use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NetblockError {
    #[error("invalid number of IP octets in `{0}`")]
    BadOctetCount(String),
    #[error("invalid IP octet in `{0}`")]
    BadOctet(String),
    #[error("invalid CIDR size in `{0}`")]
    BadCidrSize(String),
    #[error("CIDR start IP is not properly aligned: {0}")]
    MisalignedCidr(String),
    #[error("IP range has start larger than end: {0}")]
    InvertedRange(String),
}

/// The network mask for a given prefix length.
fn len_mask(len: u8) -> u32 {
    debug_assert!(len <= 32);

    if len == 0 {
        0
    } else {
        u32::MAX << (32 - len)
    }
}

/// The low and high addresses of the CIDR block starting at `addr`.
fn cidr_range(addr: u32, len: u8) -> (u32, u32) {
    let mask = len_mask(len);
    let low = addr & mask;
    let high = low | !mask;

    (low, high)
}

/// Parses a dotted-quad address with at least `min_octets` octets.
///
/// Omitted trailing octets are treated as zero, so `127.0` with
/// `min_octets <= 2` is `127.0.0.0`. Normal addresses require all four.
pub fn parse_ip(s: &str, min_octets: usize) -> Result<u32, NetblockError> {
    let octets = s.split('.').collect::<Vec<_>>();
    if octets.len() > 4 || octets.len() < min_octets {
        return Err(NetblockError::BadOctetCount(s.to_owned()));
    }

    let mut res: u32 = 0;
    for octet in &octets {
        let value = octet
            .parse::<u8>()
            .map_err(|_| NetblockError::BadOctet(s.to_owned()))?;
        res = (res << 8) | u32::from(value);
    }

    Ok(res << (8 * (4 - octets.len())))
}

fn parse_cidr(s: &str) -> Result<(u32, u32), NetblockError> {
    let (addr, size) = s.split_once('/').unwrap_or((s, ""));
    let ip = parse_ip(addr, 1)?;
    let size = size
        .parse::<u8>()
        .ok()
        .filter(|s| *s <= 32)
        .ok_or_else(|| NetblockError::BadCidrSize(s.to_owned()))?;

    let (low, high) = cidr_range(ip, size);
    if low != ip {
        return Err(NetblockError::MisalignedCidr(s.to_owned()));
    }

    Ok((low, high))
}

fn parse_range(s: &str) -> Result<(u32, u32), NetblockError> {
    let (l, h) = s.split_once('-').unwrap_or((s, ""));
    let low = parse_ip(l, 4)?;
    let high = parse_ip(h, 4)?;
    if low > high {
        return Err(NetblockError::InvertedRange(s.to_owned()));
    }

    Ok((low, high))
}

/// Converts an address, CIDR netblock, or `LOW-HIGH` range into an inclusive
/// range pair. The three forms cannot be confused for each other.
fn convert(s: &str) -> Result<(u32, u32), NetblockError> {
    if s.contains('/') {
        parse_cidr(s)
    } else if s.contains('-') {
        parse_range(s)
    } else {
        let ip = parse_ip(s, 4)?;

        Ok((ip, ip))
    }
}

/// The largest CIDR prefix length that can start at `ip`.
fn max_len_at(ip: u32) -> u8 {
    for i in 0..32 {
        if ip & (1 << i) != 0 {
            return 32 - i;
        }
    }

    0
}

/// Decomposes an inclusive range into minimal aligned CIDR blocks.
fn range_to_cidrs(mut low: u32, high: u32, out: &mut Vec<(u32, u8)>) {
    loop {
        let mut len = max_len_at(low);
        let (mut blow, mut bhigh) = cidr_range(low, len);
        while len < 32 && (blow != low || bhigh > high) {
            len += 1;
            (blow, bhigh) = cidr_range(low, len);
        }
        debug_assert!(blow == low && bhigh <= high);
        out.push((low, len));

        if bhigh >= high {
            return;
        }
        low = bhigh + 1;
    }
}

fn cidr_to_string(ip: u32, len: u8) -> String {
    if len == 32 {
        Ipv4Addr::from(ip).to_string()
    } else {
        format!("{}/{}", Ipv4Addr::from(ip), len)
    }
}

/// A set of IPv4 addresses stored as sorted, disjoint inclusive ranges.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IpRanges {
    ranges: Vec<(u32, u32)>,
}

impl IpRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an address, CIDR netblock, or `LOW-HIGH` range in string form.
    pub fn add(&mut self, val: &str) -> Result<(), NetblockError> {
        let (low, high) = convert(val)?;
        self.add_range(low, high);

        Ok(())
    }

    /// Adds an inclusive numeric range, merging overlapping and adjacent
    /// entries.
    pub fn add_range(&mut self, low: u32, high: u32) {
        debug_assert!(low <= high);

        // The first range that could touch [low, high].
        let start = self.ranges.partition_point(|(_, h)| {
            // `h + 1 < low` without overflowing at u32::MAX.
            *h < low && h + 1 < low
        });
        let mut low = low;
        let mut high = high;
        let mut end = start;
        while end < self.ranges.len() && self.ranges[end].0 <= high.saturating_add(1) {
            low = low.min(self.ranges[end].0);
            high = high.max(self.ranges[end].1);
            end += 1;
        }
        self.ranges.splice(start..end, [(low, high)]);
    }

    pub fn contains(&self, ip: u32) -> bool {
        let idx = self.ranges.partition_point(|(_, h)| *h < ip);

        self.ranges.get(idx).is_some_and(|(l, _)| *l <= ip)
    }

    pub fn contains_addr(&self, addr: Ipv4Addr) -> bool {
        self.contains(u32::from(addr))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The set as a list of minimal CIDR netblocks in string form.
    pub fn to_cidrs(&self) -> Vec<String> {
        let mut blocks = Vec::new();
        for (low, high) in &self.ranges {
            range_to_cidrs(*low, *high, &mut blocks);
        }

        blocks
            .into_iter()
            .map(|(ip, len)| cidr_to_string(ip, len))
            .collect()
    }
}

impl fmt::Display for IpRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<IpRanges:")?;
        for (low, high) in &self.ranges {
            if low == high {
                write!(f, " {}", Ipv4Addr::from(*low))?;
            } else {
                write!(f, " {}-{}", Ipv4Addr::from(*low), Ipv4Addr::from(*high))?;
            }
        }
        write!(f, ">")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> u32 {
        parse_ip(s, 4).unwrap()
    }

    #[test]
    fn parses_plain_addresses() {
        assert_eq!(ip("0.0.0.0"), 0);
        assert_eq!(ip("255.255.255.255"), u32::MAX);
        assert_eq!(ip("127.0.0.1"), 0x7f00_0001);
    }

    #[test]
    fn rejects_bad_addresses() {
        assert_eq!(
            parse_ip("1.2.3", 4),
            Err(NetblockError::BadOctetCount("1.2.3".to_owned()))
        );
        assert_eq!(
            parse_ip("1.2.3.4.5", 4),
            Err(NetblockError::BadOctetCount("1.2.3.4.5".to_owned()))
        );
        assert_eq!(
            parse_ip("1.2.3.256", 4),
            Err(NetblockError::BadOctet("1.2.3.256".to_owned()))
        );
        assert_eq!(
            parse_ip("1.2.3.x", 4),
            Err(NetblockError::BadOctet("1.2.3.x".to_owned()))
        );
    }

    #[test]
    fn accepts_short_cidrs() {
        let mut r = IpRanges::new();
        r.add("127.0/16").unwrap();

        assert!(r.contains(ip("127.0.0.1")));
        assert!(r.contains(ip("127.0.255.255")));
        assert!(!r.contains(ip("127.1.0.0")));
    }

    #[test]
    fn rejects_misaligned_cidrs() {
        let mut r = IpRanges::new();

        assert_eq!(
            r.add("127.0.0.1/24"),
            Err(NetblockError::MisalignedCidr("127.0.0.1/24".to_owned()))
        );
        assert_eq!(
            r.add("10.0.0.0/33"),
            Err(NetblockError::BadCidrSize("10.0.0.0/33".to_owned()))
        );
    }

    #[test]
    fn accepts_low_high_ranges() {
        let mut r = IpRanges::new();
        r.add("10.0.0.5-10.0.0.10").unwrap();

        assert!(!r.contains(ip("10.0.0.4")));
        assert!(r.contains(ip("10.0.0.5")));
        assert!(r.contains(ip("10.0.0.10")));
        assert!(!r.contains(ip("10.0.0.11")));
    }

    #[test]
    fn rejects_inverted_ranges() {
        let mut r = IpRanges::new();

        assert_eq!(
            r.add("10.0.0.10-10.0.0.5"),
            Err(NetblockError::InvertedRange("10.0.0.10-10.0.0.5".to_owned()))
        );
    }

    #[test]
    fn range_comparisons_span_the_sign_bit() {
        // The high half of the address space must compare above the low half.
        let mut r = IpRanges::new();
        r.add("127.255.255.255-128.0.0.1").unwrap();

        assert!(r.contains(ip("128.0.0.0")));
        assert!(!r.contains(ip("128.0.0.2")));
    }

    #[test]
    fn merges_overlapping_and_adjacent_ranges() {
        let mut r = IpRanges::new();
        r.add("10.0.0.0-10.0.0.10").unwrap();
        r.add("10.0.0.11-10.0.0.20").unwrap();
        r.add("10.0.0.5-10.0.0.15").unwrap();

        assert_eq!(r.ranges, vec![(ip("10.0.0.0"), ip("10.0.0.20"))]);
    }

    #[test]
    fn membership_is_preserved_across_merging() {
        let mut merged = IpRanges::new();
        let parts = ["1.2.3.4", "1.2.3.0/24", "10.0.0.1-10.0.1.7", "10.0.1.8"];
        for p in &parts {
            merged.add(p).unwrap();
        }

        for probe in [
            "1.2.3.4",
            "1.2.3.255",
            "1.2.4.0",
            "10.0.0.0",
            "10.0.0.1",
            "10.0.1.8",
            "10.0.1.9",
        ] {
            let single = parts.iter().any(|p| {
                let mut r = IpRanges::new();
                r.add(p).unwrap();
                r.contains(ip(probe))
            });
            assert_eq!(merged.contains(ip(probe)), single, "probe {probe}");
        }
    }

    #[test]
    fn decomposes_to_minimal_cidrs() {
        let mut r = IpRanges::new();
        r.add("10.0.0.0/24").unwrap();
        assert_eq!(r.to_cidrs(), vec!["10.0.0.0/24"]);

        let mut r = IpRanges::new();
        r.add("10.0.0.1").unwrap();
        assert_eq!(r.to_cidrs(), vec!["10.0.0.1"]);

        let mut r = IpRanges::new();
        r.add("10.0.0.1-10.0.0.6").unwrap();
        assert_eq!(
            r.to_cidrs(),
            vec!["10.0.0.1", "10.0.0.2/31", "10.0.0.4/31", "10.0.0.6"]
        );
    }

    #[test]
    fn full_space_round_trips() {
        let mut r = IpRanges::new();
        r.add("0.0.0.0/0").unwrap();

        assert!(r.contains(0));
        assert!(r.contains(u32::MAX));
        assert_eq!(r.to_cidrs(), vec!["0.0.0.0/0"]);
    }
}
