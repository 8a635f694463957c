//! Small parsing helpers shared between the matchers and the daemon
//! configuration.

use std::net::Ipv4Addr;

/// Is this a full dotted-quad IPv4 address?
pub fn is_ip_addr(s: &str) -> bool {
    s.parse::<Ipv4Addr>().is_ok()
}

/// Parses a `PORT@HOST` pair where either half is optional (in which case
/// the `@` is too) and `*` wildcards either half. The host must be a
/// literal IPv4 address. Returns `None` on anything else, including the
/// fully-empty pair.
pub fn parse_host_port(s: &str) -> Option<(Option<Ipv4Addr>, Option<u16>)> {
    let Some((port, host)) = s.split_once('@') else {
        // No @ means it is either a port or an address, and we have to
        // figure out which.
        if is_ip_addr(s) {
            return Some((Some(s.parse().ok()?), None));
        }

        return Some((None, Some(s.parse().ok()?)));
    };

    let port = match port {
        "" | "*" => None,
        p => Some(p.parse::<u16>().ok()?),
    };
    let host = match host {
        "" | "*" => None,
        h if is_ip_addr(h) => Some(h.parse::<Ipv4Addr>().ok()?),
        _ => return None,
    };

    if host.is_none() && port.is_none() {
        return None;
    }

    Some((host, port))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("time duration does not end in s/m/h/d: `{0}`")]
    BadSuffix(String),
    #[error("not a number in time duration: `{0}`")]
    BadNumber(String),
}

/// Parses `Ns`, `Nm`, `Nh`, or `Nd` into seconds.
pub fn duration_secs(val: &str) -> Result<i64, DurationError> {
    let (num, unit) = val.split_at(val.len().saturating_sub(1));
    let scale = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 60 * 60 * 24,
        _ => return Err(DurationError::BadSuffix(val.to_owned())),
    };
    let num = num
        .parse::<i64>()
        .map_err(|_| DurationError::BadNumber(val.to_owned()))?;

    Ok(num * scale)
}
