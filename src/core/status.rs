/// Operational status bitmask for backend servers
///
/// Status is a set of independent flags combined with bitwise OR / AND-NOT.
/// The monitor owns most transitions; the router and reporting code read the
/// bits without locks. Masked predicates combine several bits the way the
/// routing layer needs them (a master in maintenance is not a master).
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Server is up and accepting connections
pub const RUNNING: u64 = 1 << 0;
/// Server is the replication master
pub const MASTER: u64 = 1 << 1;
/// Server is a replication slave
pub const SLAVE: u64 = 1 << 2;
/// Server relays between a master and slaves
pub const RELAY: u64 = 1 << 3;
/// Server is a synced member of a cluster
pub const JOINED: u64 = 1 << 4;
/// Server is in administrative maintenance
pub const MAINT: u64 = 1 << 5;
/// Server was the master before the current one was promoted
pub const WAS_MASTER: u64 = 1 << 6;
/// Existing sessions may finish, no new sessions are routed here
pub const DRAINING: u64 = 1 << 7;
/// A monitored disk usage limit has been exceeded
pub const DISK_SPACE_EXHAUSTED: u64 = 1 << 8;

/// Atomic status bitmask plus the master-error reporting latch
#[derive(Debug)]
pub struct Status {
    bits: AtomicU64,
    /// Latched once a master failure has been logged, so repeated monitor
    /// ticks do not flood the log. Reset when the master bit is cleared.
    master_error_logged: AtomicBool,
}

impl Status {
    pub fn new(bits: u64) -> Self {
        Self {
            bits: AtomicU64::new(bits),
            master_error_logged: AtomicBool::new(false),
        }
    }

    /// Current raw bitmask
    pub fn bits(&self) -> u64 {
        self.bits.load(Ordering::Relaxed)
    }

    /// Overwrite the whole bitmask
    pub fn assign(&self, bits: u64) {
        self.bits.store(bits, Ordering::Relaxed);
    }

    /// Set the given bits
    pub fn set(&self, mask: u64) {
        self.bits.fetch_or(mask, Ordering::Relaxed);
    }

    /// Clear the given bits
    ///
    /// Clearing MASTER also resets the master-error latch so the next
    /// failure of a newly promoted master is reported again.
    pub fn clear(&self, mask: u64) {
        self.bits.fetch_and(!mask, Ordering::Relaxed);
        if mask & MASTER != 0 {
            self.master_error_logged.store(false, Ordering::Relaxed);
        }
    }

    /// Mark that a master failure has been logged; returns false if it
    /// already was, letting the caller skip duplicate log lines.
    pub fn latch_master_error(&self) -> bool {
        !self.master_error_logged.swap(true, Ordering::Relaxed)
    }

    pub fn master_error_logged(&self) -> bool {
        self.master_error_logged.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.bits() & RUNNING != 0
    }

    pub fn is_down(&self) -> bool {
        !self.is_running()
    }

    pub fn in_maint(&self) -> bool {
        self.bits() & MAINT != 0
    }

    pub fn is_draining(&self) -> bool {
        self.bits() & DRAINING != 0
    }

    /// Running and neither in maintenance nor draining; eligible for new
    /// routing decisions
    pub fn is_usable(&self) -> bool {
        self.bits() & (RUNNING | MAINT | DRAINING) == RUNNING
    }

    pub fn is_master(&self) -> bool {
        self.bits() & (RUNNING | MASTER | MAINT) == RUNNING | MASTER
    }

    pub fn is_slave(&self) -> bool {
        self.bits() & (RUNNING | SLAVE | MAINT) == RUNNING | SLAVE
    }

    pub fn is_relay(&self) -> bool {
        self.bits() & (RUNNING | RELAY | MAINT) == RUNNING | RELAY
    }

    pub fn is_joined(&self) -> bool {
        self.bits() & (RUNNING | JOINED | MAINT) == RUNNING | JOINED
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Map an administrative status token to its bit, 0 for unknown tokens
pub fn status_from_string(token: &str) -> u64 {
    const TOKENS: &[(&str, u64)] = &[
        ("running", RUNNING),
        ("master", MASTER),
        ("slave", SLAVE),
        ("synced", JOINED),
        ("maintenance", MAINT),
        ("maint", MAINT),
        ("stale", WAS_MASTER),
        ("drain", DRAINING),
    ];

    for (name, bit) in TOKENS {
        if token.eq_ignore_ascii_case(name) {
            return *bit;
        }
    }
    0
}

/// Render a bitmask as the human-readable status list, e.g. "Master, Running"
pub fn status_string(bits: u64) -> String {
    let mut parts: Vec<&str> = Vec::new();

    if bits & MAINT != 0 {
        parts.push("Maintenance");
    }
    if bits & DRAINING != 0 {
        parts.push("Draining");
    }
    if bits & MASTER != 0 {
        parts.push("Master");
    }
    if bits & RELAY != 0 {
        parts.push("Relay Master");
    }
    if bits & SLAVE != 0 {
        parts.push("Slave");
    }
    if bits & JOINED != 0 {
        parts.push("Synced");
    }
    if bits & WAS_MASTER != 0 && bits & MASTER == 0 {
        parts.push("Stale");
    }
    if bits & DISK_SPACE_EXHAUSTED != 0 {
        parts.push("Disk space exhausted");
    }
    parts.push(if bits & RUNNING != 0 { "Running" } else { "Down" });

    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_roundtrip() {
        let status = Status::new(RUNNING | SLAVE);
        let before = status.bits();

        status.set(MAINT);
        assert!(status.in_maint());
        status.clear(MAINT);
        assert_eq!(status.bits(), before);
    }

    #[test]
    fn test_clear_master_resets_error_latch() {
        let status = Status::new(RUNNING | MASTER);
        assert!(status.latch_master_error());
        assert!(!status.latch_master_error()); // already latched
        assert!(status.master_error_logged());

        status.clear(MASTER);
        assert!(!status.master_error_logged());
        assert!(status.latch_master_error()); // reports again after demotion
    }

    #[test]
    fn test_clearing_other_bits_keeps_latch() {
        let status = Status::new(RUNNING | MASTER);
        status.latch_master_error();
        status.clear(SLAVE | JOINED);
        assert!(status.master_error_logged());
    }

    #[test]
    fn test_maintenance_masks_roles() {
        let status = Status::new(RUNNING | MASTER);
        assert!(status.is_master());
        assert!(status.is_usable());

        status.set(MAINT);
        assert!(!status.is_master());
        assert!(!status.is_usable());
        assert!(status.is_running()); // still reachable, just not routable
    }

    #[test]
    fn test_draining_is_running_but_not_usable() {
        let status = Status::new(RUNNING | SLAVE);
        status.set(DRAINING);
        assert!(status.is_running());
        assert!(status.is_draining());
        assert!(!status.is_usable());
        assert!(status.is_slave()); // draining does not mask the role
    }

    #[test]
    fn test_status_from_string() {
        assert_eq!(status_from_string("running"), RUNNING);
        assert_eq!(status_from_string("Master"), MASTER);
        assert_eq!(status_from_string("SYNCED"), JOINED);
        assert_eq!(status_from_string("maint"), MAINT);
        assert_eq!(status_from_string("maintenance"), MAINT);
        assert_eq!(status_from_string("stale"), WAS_MASTER);
        assert_eq!(status_from_string("drain"), DRAINING);
        assert_eq!(status_from_string("bogus"), 0);
    }

    #[test]
    fn test_status_string_rendering() {
        assert_eq!(status_string(RUNNING | MASTER), "Master, Running");
        assert_eq!(status_string(RUNNING | SLAVE | JOINED), "Slave, Synced, Running");
        assert_eq!(status_string(0), "Down");
        assert_eq!(
            status_string(RUNNING | WAS_MASTER),
            "Stale, Running"
        );
        assert_eq!(
            status_string(RUNNING | MAINT | MASTER),
            "Maintenance, Master, Running"
        );
    }
}
