/// Backend version and flavor detection
///
/// The monitor is the only writer; the router and reporting code read
/// without synchronization beyond per-field atomics. Writers serialize on a
/// mutex so two monitor ticks cannot interleave, but a reader racing a
/// writer may observe a version string and numeric fields from different
/// updates. Writes happen on a seconds-to-minutes cadence, so the window is
/// negligible and tolerated.
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::utils::truncate_to;

/// Longest stored version string, longer values are cut
pub const MAX_VERSION_LEN: usize = 256;

/// Detected backend flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    MySql,
    MariaDb,
    Clustrix,
}

impl BackendType {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BackendType::MariaDb,
            2 => BackendType::Clustrix,
            _ => BackendType::MySql,
        }
    }

    /// Detect the flavor from a server version string
    pub fn detect(version_str: &str) -> Self {
        let lower = version_str.to_ascii_lowercase();
        if lower.contains("clustrix") {
            BackendType::Clustrix
        } else if lower.contains("mariadb") {
            BackendType::MariaDb
        } else {
            BackendType::MySql
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::MySql => "mysql",
            BackendType::MariaDb => "mariadb",
            BackendType::Clustrix => "clustrix",
        }
    }
}

/// Numeric server version decomposed from `major * 10000 + minor * 100 + patch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct VersionNumber {
    pub total: u64,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// Version fields of a server, updated by the monitor only
#[derive(Debug)]
pub struct VersionInfo {
    total: AtomicU64,
    major: AtomicU32,
    minor: AtomicU32,
    patch: AtomicU32,
    backend_type: AtomicU8,
    version_str: Mutex<String>,
    write_lock: Mutex<()>,
}

impl VersionInfo {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            major: AtomicU32::new(0),
            minor: AtomicU32::new(0),
            patch: AtomicU32::new(0),
            backend_type: AtomicU8::new(0),
            version_str: Mutex::new(String::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Store a new version; concurrent writers are serialized, readers are not
    pub fn set(&self, version: u64, version_str: &str) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        self.total.store(version, Ordering::Relaxed);
        let major = version / 10000;
        let minor = (version - major * 10000) / 100;
        let patch = version - major * 10000 - minor * 100;
        self.major.store(major as u32, Ordering::Relaxed);
        self.minor.store(minor as u32, Ordering::Relaxed);
        self.patch.store(patch as u32, Ordering::Relaxed);

        let (bounded, _) = truncate_to(version_str, MAX_VERSION_LEN);
        let detected = BackendType::detect(&bounded);
        self.backend_type.store(detected as u8, Ordering::Relaxed);

        let mut stored = self.version_str.lock().unwrap_or_else(|e| e.into_inner());
        *stored = bounded;
    }

    pub fn version_num(&self) -> VersionNumber {
        VersionNumber {
            total: self.total.load(Ordering::Relaxed),
            major: self.major.load(Ordering::Relaxed),
            minor: self.minor.load(Ordering::Relaxed),
            patch: self.patch.load(Ordering::Relaxed),
        }
    }

    pub fn version_string(&self) -> String {
        self.version_str
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn backend_type(&self) -> BackendType {
        BackendType::from_u8(self.backend_type.load(Ordering::Relaxed))
    }
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_decomposition() {
        let info = VersionInfo::new();
        info.set(100301, "10.3.1-MariaDB");

        let num = info.version_num();
        assert_eq!(num.total, 100301);
        assert_eq!(num.major, 10);
        assert_eq!(num.minor, 3);
        assert_eq!(num.patch, 1);
    }

    #[test]
    fn test_flavor_detection() {
        assert_eq!(
            BackendType::detect("5.5.5-10.3.1-MariaDB"),
            BackendType::MariaDb
        );
        assert_eq!(BackendType::detect("5.7.21-Clustrix"), BackendType::Clustrix);
        assert_eq!(BackendType::detect("5.7.21"), BackendType::MySql);
    }

    #[test]
    fn test_detection_prefers_clustrix() {
        // Clustrix engines report a MySQL-compatible string; the clustrix
        // marker wins over anything else in it
        assert_eq!(
            BackendType::detect("5.0.45-clustrix-mariadb-compat"),
            BackendType::Clustrix
        );
    }

    #[test]
    fn test_version_info_stores_flavor_and_string() {
        let info = VersionInfo::new();
        info.set(50721, "5.7.21-Clustrix");
        assert_eq!(info.backend_type(), BackendType::Clustrix);
        assert_eq!(info.version_string(), "5.7.21-Clustrix");

        info.set(80023, "8.0.23");
        assert_eq!(info.backend_type(), BackendType::MySql);
        let num = info.version_num();
        assert_eq!((num.major, num.minor, num.patch), (8, 0, 23));
    }

    #[test]
    fn test_version_string_bounded() {
        let info = VersionInfo::new();
        let long = "9".repeat(MAX_VERSION_LEN + 100);
        info.set(90000, &long);
        assert_eq!(info.version_string().len(), MAX_VERSION_LEN);
    }
}
