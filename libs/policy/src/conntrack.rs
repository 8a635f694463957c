//! Tracking of active handler processes.
//!
//! Connections come up with PID / IP / classes and go down by PID. The
//! indexes answer how many live connections exist for a given IP address or
//! class.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("duplicate pid {0}")]
pub struct DuplicatePid(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnInfo {
    pub pid: u32,
    pub ip: Ipv4Addr,
    pub classes: Vec<String>,
}

impl fmt::Display for ConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<CI: PID {}, IP {}, classes: {}>",
            self.pid,
            self.ip,
            self.classes.join(" ")
        )
    }
}

#[derive(Debug, Default)]
pub struct ConnTrack {
    pids: HashMap<u32, ConnInfo>,
    ips: HashMap<Ipv4Addr, HashSet<u32>>,
    classes: HashMap<String, HashSet<u32>>,
}

impl ConnTrack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn up(
        &mut self,
        pid: u32,
        ip: Ipv4Addr,
        classes: Vec<String>,
    ) -> Result<(), DuplicatePid> {
        if self.pids.contains_key(&pid) {
            return Err(DuplicatePid(pid));
        }

        self.ips.entry(ip).or_default().insert(pid);
        for class in &classes {
            self.classes.entry(class.clone()).or_default().insert(pid);
        }
        self.pids.insert(pid, ConnInfo { pid, ip, classes });

        Ok(())
    }

    /// Unknown PIDs are ignored; reaping can race with a failed
    /// registration.
    pub fn down(&mut self, pid: u32) {
        let Some(info) = self.pids.remove(&pid) else {
            return;
        };

        if let Some(bucket) = self.ips.get_mut(&info.ip) {
            bucket.remove(&pid);
            if bucket.is_empty() {
                self.ips.remove(&info.ip);
            }
        }
        for class in &info.classes {
            if let Some(bucket) = self.classes.get_mut(class) {
                bucket.remove(&pid);
                if bucket.is_empty() {
                    self.classes.remove(class);
                }
            }
        }
    }

    pub fn ip_count(&self, ip: Ipv4Addr) -> usize {
        self.ips.get(&ip).map_or(0, HashSet::len)
    }

    pub fn class_count(&self, class: &str) -> usize {
        self.classes.get(class).map_or(0, HashSet::len)
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    /// A snapshot of the live connections, ordered by PID.
    pub fn connections(&self) -> Vec<&ConnInfo> {
        let mut all = self.pids.values().collect::<Vec<_>>();
        all.sort_by_key(|info| info.pid);

        all
    }
}
