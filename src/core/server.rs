/// Backend server aggregate
///
/// A `Server` is the unit the router, monitor and admin layers interact
/// with: identity and administrative settings, the operational status
/// bitmask, detected version info, the adaptive response time estimate, the
/// per-worker connection pool, and usage counters. Cross-cutting fields are
/// atomics because reads happen on every routed query while writes arrive
/// on a monitor cadence; small aggregate state (custom parameters, the
/// response time tracker) sits behind narrow mutexes that are never held
/// across calls into other components.
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{parse_disk_space_threshold, DiskSpaceLimits, Rank, ServerParams, SslParams};
use crate::core::connection::BackendConnection;
use crate::core::pool::{ConnectionPool, PoolStats, ReleaseOutcome};
use crate::core::response_time::ResponseTimeTracker;
use crate::core::status::{self, Status};
use crate::core::version::{BackendType, VersionInfo, VersionNumber};
use crate::error::{RegistryError, RegistryResult};
use crate::workers::WorkerId;

/// Longest stored server address; longer values are truncated at creation
pub const MAX_ADDRESS_LEN: usize = 1024;
/// Longest accepted monitor user name
pub const MAX_MONUSER_LEN: usize = 512;
/// Longest accepted monitor password
pub const MAX_MONPW_LEN: usize = 512;

/// Where a server is in its life from construction to destruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Constructed but not yet accepted into the registry
    Provisional,
    /// Visible to routing
    Active,
    /// Removed from configuration; existing connections may finish
    Draining,
    /// No connections remain; the object dies with its last reference
    Retired,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Lifecycle::Active,
            2 => Lifecycle::Draining,
            3 => Lifecycle::Retired,
            _ => Lifecycle::Provisional,
        }
    }
}

/// Connection traffic counters, updated by router hooks
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Total connections ever opened to this server
    n_connections: AtomicU64,
    /// Connections currently open (new + reused)
    n_current: AtomicI64,
    /// Operations currently in flight
    n_current_ops: AtomicI64,
    /// Packets routed to this server
    packets: AtomicU64,
}

impl ServerStats {
    pub fn total_connections(&self) -> u64 {
        self.n_connections.load(Ordering::Relaxed)
    }

    pub fn current_connections(&self) -> i64 {
        self.n_current.load(Ordering::Relaxed).max(0)
    }

    pub fn current_operations(&self) -> i64 {
        self.n_current_ops.load(Ordering::Relaxed).max(0)
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }
}

/// A backend database server known to the registry
#[derive(Debug)]
pub struct Server {
    name: String,
    address: RwLock<String>,
    uses_socket: bool,
    port: AtomicU16,
    extra_port: AtomicU16,
    protocol: String,
    proxy_protocol: AtomicBool,
    rank: AtomicU8,
    monitor_user: Mutex<String>,
    monitor_password: Mutex<String>,
    persistpoolmax: AtomicUsize,
    persistmaxtime_secs: AtomicU64,
    ssl: Mutex<Option<SslParams>>,
    disk_space_limits: Mutex<Option<DiskSpaceLimits>>,
    custom_parameters: Mutex<BTreeMap<String, String>>,
    status: Status,
    active: AtomicBool,
    lifecycle: AtomicU8,
    version: VersionInfo,
    response_time: Mutex<ResponseTimeTracker>,
    pool: ConnectionPool,
    stats: ServerStats,
}

impl Server {
    /// Build a server from validated parameters.
    ///
    /// Cross-field invariants the parameter layer cannot see are enforced
    /// here: monitor credentials must be paired (both or neither), and
    /// credential lengths are bounded. Failure leaves nothing behind. The
    /// address is truncated with a warning instead of failing, matching
    /// how an over-long address is handled at startup.
    pub fn new(name: &str, params: &ServerParams, workers: usize) -> RegistryResult<Self> {
        params.validate()?;
        validate_monitor_pairing(name, params)?;

        let monitor_user = params.monitor_user.clone().unwrap_or_default();
        let monitor_password = params.monitor_password.clone().unwrap_or_default();
        check_len(&monitor_user, MAX_MONUSER_LEN, "monitoruser")?;
        check_len(&monitor_password, MAX_MONPW_LEN, "monitorpw")?;

        let (address, truncated) = crate::utils::truncate_to(params.target(), MAX_ADDRESS_LEN);
        if truncated {
            warn!(
                server = name,
                max = MAX_ADDRESS_LEN,
                "Truncated server address to the maximum length"
            );
        }

        let disk_space_limits = match &params.disk_space_threshold {
            Some(text) => Some(parse_disk_space_threshold(text)?),
            None => None,
        };

        let server = Self {
            name: name.to_string(),
            address: RwLock::new(address),
            uses_socket: params.socket.is_some(),
            port: AtomicU16::new(params.port),
            extra_port: AtomicU16::new(params.extra_port),
            protocol: params.protocol.clone(),
            proxy_protocol: AtomicBool::new(params.proxy_protocol),
            rank: AtomicU8::new(rank_to_u8(params.rank)),
            monitor_user: Mutex::new(monitor_user),
            monitor_password: Mutex::new(monitor_password),
            persistpoolmax: AtomicUsize::new(params.persistpoolmax),
            persistmaxtime_secs: AtomicU64::new(params.persistmaxtime),
            ssl: Mutex::new(params.ssl.clone()),
            disk_space_limits: Mutex::new(disk_space_limits),
            custom_parameters: Mutex::new(params.custom.clone()),
            status: Status::new(status::RUNNING),
            active: AtomicBool::new(false),
            lifecycle: AtomicU8::new(Lifecycle::Provisional as u8),
            version: VersionInfo::new(),
            response_time: Mutex::new(ResponseTimeTracker::new()),
            pool: ConnectionPool::new(workers),
            stats: ServerStats::default(),
        };

        Ok(server)
    }

    // --- Identity and settings ---

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> String {
        self.address.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn uses_socket(&self) -> bool {
        self.uses_socket
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    pub fn extra_port(&self) -> u16 {
        self.extra_port.load(Ordering::Relaxed)
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn rank(&self) -> Rank {
        rank_from_u8(self.rank.load(Ordering::Relaxed))
    }

    pub fn proxy_protocol(&self) -> bool {
        self.proxy_protocol.load(Ordering::Relaxed)
    }

    pub fn persistpoolmax(&self) -> usize {
        self.persistpoolmax.load(Ordering::Relaxed)
    }

    pub fn persistmaxtime(&self) -> Duration {
        Duration::from_secs(self.persistmaxtime_secs.load(Ordering::Relaxed))
    }

    pub fn monitor_user(&self) -> String {
        self.monitor_user
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn monitor_password(&self) -> String {
        self.monitor_password
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Update the address; unlike creation, an over-long value is rejected
    pub fn update_address(&self, new_address: &str) -> RegistryResult<()> {
        check_len(new_address, MAX_ADDRESS_LEN, "address")?;
        let mut address = self.address.write().unwrap_or_else(|e| e.into_inner());
        *address = new_address.to_string();
        Ok(())
    }

    pub fn update_port(&self, new_port: u16) {
        self.port.store(new_port, Ordering::Relaxed);
    }

    pub fn update_extra_port(&self, new_port: u16) {
        self.extra_port.store(new_port, Ordering::Relaxed);
    }

    /// Set the monitor user; values over the limit are rejected and the
    /// previous value stays in place
    pub fn set_monitor_user(&self, username: &str) -> RegistryResult<()> {
        check_len(username, MAX_MONUSER_LEN, "monitoruser")?;
        let mut user = self.monitor_user.lock().unwrap_or_else(|e| e.into_inner());
        *user = username.to_string();
        Ok(())
    }

    /// Set the monitor password with the same bound as the user
    pub fn set_monitor_password(&self, password: &str) -> RegistryResult<()> {
        check_len(password, MAX_MONPW_LEN, "monitorpw")?;
        let mut pw = self
            .monitor_password
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *pw = password.to_string();
        Ok(())
    }

    /// Custom parameters are written by configuration reload and read by
    /// reporting code from arbitrary threads, hence the dedicated lock
    pub fn set_custom_parameter(&self, name: &str, value: &str) {
        let mut custom = self
            .custom_parameters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        custom.insert(name.to_string(), value.to_string());
    }

    pub fn get_custom_parameter(&self, name: &str) -> Option<String> {
        let custom = self
            .custom_parameters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        custom.get(name).cloned()
    }

    pub fn custom_parameters(&self) -> BTreeMap<String, String> {
        self.custom_parameters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn ssl(&self) -> Option<SslParams> {
        self.ssl.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_ssl(&self, ssl: Option<SslParams>) {
        *self.ssl.lock().unwrap_or_else(|e| e.into_inner()) = ssl;
    }

    pub fn disk_space_limits(&self) -> Option<DiskSpaceLimits> {
        self.disk_space_limits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_disk_space_limits(&self, threshold: &str) -> RegistryResult<()> {
        let limits = parse_disk_space_threshold(threshold)?;
        *self
            .disk_space_limits
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(limits);
        Ok(())
    }

    /// Apply a new parameter set in place, preserving object identity.
    ///
    /// Everything is validated before the first field is written so a
    /// failed apply leaves the server exactly as it was.
    pub fn update_from_params(&self, params: &ServerParams) -> RegistryResult<()> {
        params.validate()?;
        validate_monitor_pairing(&self.name, params)?;

        if params.protocol != self.protocol {
            return Err(RegistryError::validation(format!(
                "Server '{}': protocol cannot be changed after creation",
                self.name
            )));
        }
        if params.socket.is_some() != self.uses_socket {
            return Err(RegistryError::validation(format!(
                "Server '{}': cannot switch between address and socket",
                self.name
            )));
        }

        let monitor_user = params.monitor_user.clone().unwrap_or_default();
        let monitor_password = params.monitor_password.clone().unwrap_or_default();
        check_len(params.target(), MAX_ADDRESS_LEN, "address")?;
        check_len(&monitor_user, MAX_MONUSER_LEN, "monitoruser")?;
        check_len(&monitor_password, MAX_MONPW_LEN, "monitorpw")?;
        let disk_space_limits = match &params.disk_space_threshold {
            Some(text) => Some(parse_disk_space_threshold(text)?),
            None => None,
        };

        // All checks passed; now mutate
        self.update_address(params.target())?;
        self.update_port(params.port);
        self.update_extra_port(params.extra_port);
        self.persistpoolmax
            .store(params.persistpoolmax, Ordering::Relaxed);
        self.persistmaxtime_secs
            .store(params.persistmaxtime, Ordering::Relaxed);
        self.proxy_protocol
            .store(params.proxy_protocol, Ordering::Relaxed);
        self.rank.store(rank_to_u8(params.rank), Ordering::Relaxed);
        self.set_monitor_user(&monitor_user)?;
        self.set_monitor_password(&monitor_password)?;
        self.set_ssl(params.ssl.clone());
        *self
            .disk_space_limits
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = disk_space_limits;

        let mut custom = self
            .custom_parameters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for (key, value) in &params.custom {
            custom.insert(key.clone(), value.clone());
        }

        Ok(())
    }

    // --- Status and lifecycle ---

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn status_bits(&self) -> u64 {
        self.status.bits()
    }

    pub fn set_status(&self, mask: u64) {
        self.status.set(mask);
    }

    pub fn clear_status(&self, mask: u64) {
        self.status.clear(mask);
    }

    pub fn status_string(&self) -> String {
        status::status_string(self.status.bits())
    }

    /// Still defined in the current configuration; distinct from reachable
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Relaxed))
    }

    pub(crate) fn activate(&self) {
        self.active.store(true, Ordering::Relaxed);
        self.lifecycle.store(Lifecycle::Active as u8, Ordering::Relaxed);
    }

    /// Take the server out of configuration: no new routing decisions, the
    /// object lingers while in-flight connections drain
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Relaxed);
        self.lifecycle
            .store(Lifecycle::Draining as u8, Ordering::Relaxed);
        self.maybe_retire();
    }

    fn maybe_retire(&self) {
        if self.lifecycle() == Lifecycle::Draining
            && self.stats.current_connections() == 0
            && self.pool.stats().pooled() == 0
        {
            self.lifecycle
                .store(Lifecycle::Retired as u8, Ordering::Relaxed);
            info!(server = %self.name, "Server drained, eligible for destruction");
        }
    }

    // --- Version ---

    pub fn set_version(&self, version_num: u64, version_str: &str) {
        if version_str != self.version.version_string() {
            info!(server = %self.name, version = version_str, "Server version");
        }
        self.version.set(version_num, version_str);
    }

    pub fn version_num(&self) -> VersionNumber {
        self.version.version_num()
    }

    pub fn version_string(&self) -> String {
        self.version.version_string()
    }

    pub fn backend_type(&self) -> BackendType {
        self.version.backend_type()
    }

    // --- Response time ---

    /// Feed one batch of measured latencies from the routing layer
    pub fn response_time_observe(&self, average: f64, num_samples: i64) {
        let mut tracker = self
            .response_time
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        tracker.observe(average, num_samples);
    }

    pub fn response_time_average(&self) -> Option<Duration> {
        self.response_time
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .average_duration()
    }

    pub fn response_time_num_samples(&self) -> u64 {
        self.response_time
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .num_samples()
    }

    // --- Connection pool ---

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn pool_stats(&self) -> &PoolStats {
        self.pool.stats()
    }

    /// Fetch a reusable pooled connection for the calling worker.
    ///
    /// Returns `None` when pooling is disabled, the server is not
    /// operational, or nothing matches; the caller then opens a fresh
    /// connection. A hit counts as an open connection immediately.
    pub fn get_persistent_connection(
        &self,
        user: &str,
        peer_addr: &str,
        protocol: &str,
        worker: WorkerId,
    ) -> Option<BackendConnection> {
        let capacity = self.persistpoolmax();
        let max_age = self.persistmaxtime();
        if capacity == 0 || max_age.is_zero() {
            return None;
        }
        if !self.is_active() || !self.status.is_running() {
            return None;
        }

        let conn = self.pool.fetch(user, peer_addr, protocol, worker, max_age)?;
        self.stats.n_current.fetch_add(1, Ordering::Relaxed);
        Some(conn)
    }

    /// Return a connection whose client session ended.
    ///
    /// Pooled if the server is still active and settings allow, closed
    /// otherwise. Either way the connection no longer counts as open.
    pub fn release_persistent_connection(
        &self,
        conn: BackendConnection,
        worker: WorkerId,
    ) -> ReleaseOutcome {
        self.stats.n_current.fetch_sub(1, Ordering::Relaxed);

        let outcome = if self.is_active() {
            self.pool
                .release(conn, worker, self.persistpoolmax(), self.persistmaxtime())
        } else {
            conn.close();
            ReleaseOutcome::Closed
        };

        self.maybe_retire();
        outcome
    }

    /// Evict stale pooled connections in the calling worker's bucket
    pub fn sweep_pool(&self, worker: WorkerId) -> usize {
        let max_age = self.persistmaxtime();
        if max_age.is_zero() {
            return self.pool.purge(worker);
        }
        self.pool.sweep(worker, max_age)
    }

    /// Close every pooled connection in the calling worker's bucket
    pub fn purge_pool(&self, worker: WorkerId) -> usize {
        let purged = self.pool.purge(worker);
        self.maybe_retire();
        purged
    }

    // --- Router hooks ---

    /// A new (non-pooled) backend connection was opened to this server
    pub fn connection_opened(&self) {
        self.stats.n_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.n_current.fetch_add(1, Ordering::Relaxed);
    }

    /// A backend connection was closed without entering the pool
    pub fn connection_closed(&self) {
        self.stats.n_current.fetch_sub(1, Ordering::Relaxed);
        self.maybe_retire();
    }

    pub fn operation_started(&self) {
        self.stats.n_current_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operation_finished(&self) {
        self.stats.n_current_ops.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn packets_routed(&self, count: u64) {
        self.stats.packets.fetch_add(count, Ordering::Relaxed);
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    // --- Reporting ---

    /// Point-in-time snapshot for external serialization.
    ///
    /// Each field is a single atomic read or a brief lock; fields may be
    /// mutually inconsistent across a concurrent update, which reporting
    /// tolerates.
    pub fn to_report(&self) -> ServerReport {
        let pool_stats = self.pool.stats();
        let from_pool = pool_stats.from_pool();
        let total_connections = self.stats.total_connections();
        let pool_availability =
            from_pool as f64 / (total_connections + from_pool + 1) as f64;

        ServerReport {
            name: self.name.clone(),
            address: self.address(),
            port: self.port(),
            extra_port: self.extra_port(),
            protocol: self.protocol.clone(),
            status: self.status_string(),
            active: self.is_active(),
            lifecycle: self.lifecycle(),
            rank: self.rank(),
            version: self.version.version_num(),
            version_string: self.version.version_string(),
            backend_type: self.version.backend_type(),
            total_connections,
            current_connections: self.stats.current_connections(),
            current_operations: self.stats.current_operations(),
            routed_packets: self.stats.packets(),
            pooled_connections: pool_stats.pooled(),
            pool_high_water: pool_stats.max_pooled(),
            connections_from_pool: from_pool,
            pool_availability,
            persistpoolmax: self.persistpoolmax(),
            persistmaxtime_secs: self.persistmaxtime().as_secs(),
            response_time_average_secs: self
                .response_time_average()
                .map(|avg| avg.as_secs_f64()),
            custom_parameters: self.custom_parameters(),
        }
    }

    // --- Persistence ---

    /// Textual `key=value` form of the effective configuration
    pub fn config_string(&self) -> String {
        let mut out = format!("[{}]\ntype=server\n", self.name);

        if self.uses_socket {
            out += &format!("socket={}\n", self.address());
        } else {
            out += &format!("address={}\n", self.address());
            out += &format!("port={}\n", self.port());
        }
        if self.extra_port() != 0 {
            out += &format!("extra_port={}\n", self.extra_port());
        }
        out += &format!("protocol={}\n", self.protocol);

        let monitor_user = self.monitor_user();
        if !monitor_user.is_empty() {
            out += &format!("monitoruser={}\n", monitor_user);
            out += &format!("monitorpw={}\n", self.monitor_password());
        }
        if self.persistpoolmax() != 0 {
            out += &format!("persistpoolmax={}\n", self.persistpoolmax());
            out += &format!("persistmaxtime={}\n", self.persistmaxtime().as_secs());
        }
        if self.proxy_protocol() {
            out += "proxy_protocol=true\n";
        }
        out += &format!("rank={}\n", self.rank());

        if let Some(limits) = self.disk_space_limits() {
            let rendered: Vec<String> = limits
                .iter()
                .map(|(path, pct)| format!("{}:{}", path, pct))
                .collect();
            out += &format!("disk_space_threshold={}\n", rendered.join(","));
        }

        if let Some(ssl) = self.ssl() {
            if ssl.mode == crate::config::SslMode::Required {
                out += "ssl=required\n";
                if let Some(cert) = &ssl.cert {
                    out += &format!("ssl_cert={}\n", cert);
                }
                if let Some(key) = &ssl.key {
                    out += &format!("ssl_key={}\n", key);
                }
                if let Some(ca) = &ssl.ca_cert {
                    out += &format!("ssl_ca_cert={}\n", ca);
                }
                out += &format!("ssl_version={}\n", ssl.version);
                out += &format!("ssl_cert_verify_depth={}\n", ssl.cert_verify_depth);
                out += &format!(
                    "ssl_verify_peer_certificate={}\n",
                    ssl.verify_peer_certificate
                );
            }
        }

        // Custom parameters are not part of the fixed set above
        let custom = self
            .custom_parameters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for (key, value) in custom.iter() {
            out += &format!("{}={}\n", key, value);
        }

        out
    }

    /// Write the configuration fragment to a path that must not yet exist.
    ///
    /// The exclusive create means a concurrent writer or a leftover file
    /// fails the call without touching existing content.
    pub fn write_config_fragment(&self, path: &Path) -> RegistryResult<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| RegistryError::serialization(&self.name, path, e))?;

        file.write_all(self.config_string().as_bytes())
            .map_err(|e| RegistryError::serialization(&self.name, path, e))?;

        Ok(())
    }

    /// Persist the configuration as `<dir>/<name>.cnf`.
    ///
    /// Written to a temporary sibling first and renamed into place, so a
    /// reader never observes a partially written file and a crash mid-write
    /// leaves only a harmless `.tmp`.
    pub fn persist(&self, dir: &Path) -> RegistryResult<PathBuf> {
        let final_path = dir.join(format!("{}.cnf", self.name));
        let temp_path = dir.join(format!("{}.cnf.tmp", self.name));

        match fs::remove_file(&temp_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(RegistryError::serialization(&self.name, &temp_path, e));
            }
        }

        self.write_config_fragment(&temp_path)?;

        fs::rename(&temp_path, &final_path)
            .map_err(|e| RegistryError::serialization(&self.name, &final_path, e))?;

        Ok(final_path)
    }
}

fn rank_to_u8(rank: Rank) -> u8 {
    match rank {
        Rank::Primary => 0,
        Rank::Secondary => 1,
    }
}

fn rank_from_u8(value: u8) -> Rank {
    match value {
        1 => Rank::Secondary,
        _ => Rank::Primary,
    }
}

fn check_len(value: &str, max: usize, what: &str) -> RegistryResult<()> {
    if value.len() > max {
        tracing::error!(
            field = what,
            max,
            "The new value is too long, rejecting"
        );
        return Err(RegistryError::validation(format!(
            "The new value for {} is too long, maximum length is {} characters",
            what, max
        )));
    }
    Ok(())
}

fn validate_monitor_pairing(name: &str, params: &ServerParams) -> RegistryResult<()> {
    let user = params.monitor_user.as_deref().unwrap_or("");
    let password = params.monitor_password.as_deref().unwrap_or("");

    if user.is_empty() != password.is_empty() {
        let (defined, missing) = if password.is_empty() {
            ("monitoruser", "monitorpw")
        } else {
            ("monitorpw", "monitoruser")
        };
        tracing::error!(
            server = name,
            defined,
            missing,
            "Monitor credentials must be defined in pairs"
        );
        return Err(RegistryError::validation(format!(
            "'{}' is defined for server '{}', '{}' must also be defined",
            defined, name, missing
        )));
    }
    Ok(())
}

/// Serializable point-in-time view of one server
#[derive(Debug, Clone, Serialize)]
pub struct ServerReport {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub extra_port: u16,
    pub protocol: String,
    pub status: String,
    pub active: bool,
    pub lifecycle: Lifecycle,
    pub rank: Rank,
    pub version: VersionNumber,
    pub version_string: String,
    pub backend_type: BackendType,
    pub total_connections: u64,
    pub current_connections: i64,
    pub current_operations: i64,
    pub routed_packets: u64,
    pub pooled_connections: usize,
    pub pool_high_water: usize,
    pub connections_from_pool: u64,
    pub pool_availability: f64,
    pub persistpoolmax: usize,
    pub persistmaxtime_secs: u64,
    pub response_time_average_secs: Option<f64>,
    pub custom_parameters: BTreeMap<String, String>,
}

impl fmt::Display for ServerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Server {} ({})", self.name, self.address)?;
        writeln!(f, "\tStatus:                  {}", self.status)?;
        writeln!(f, "\tProtocol:                {}", self.protocol)?;
        writeln!(f, "\tPort:                    {}", self.port)?;
        if self.version_string.is_empty() {
            writeln!(f, "\tServer version:          unknown")?;
        } else {
            writeln!(f, "\tServer version:          {}", self.version_string)?;
        }
        writeln!(f, "\tTotal connections:       {}", self.total_connections)?;
        writeln!(f, "\tCurrent connections:     {}", self.current_connections)?;
        writeln!(f, "\tCurrent operations:      {}", self.current_operations)?;
        writeln!(f, "\tRouted packets:          {}", self.routed_packets)?;
        match self.response_time_average_secs {
            Some(avg) => writeln!(f, "\tAdaptive avg. time:      {:.3}ms", avg * 1000.0)?,
            None => writeln!(f, "\tAdaptive avg. time:      not available")?,
        }
        if self.persistpoolmax != 0 {
            writeln!(f, "\tPersistent pool size:    {}", self.pooled_connections)?;
            writeln!(f, "\tPersistent size max:     {}", self.pool_high_water)?;
            writeln!(f, "\tPersistent pool limit:   {}", self.persistpoolmax)?;
            writeln!(f, "\tPersistent max time:     {}s", self.persistmaxtime_secs)?;
            writeln!(f, "\tTaken from pool:         {}", self.connections_from_pool)?;
            writeln!(
                f,
                "\tPool availability:       {:.2}%",
                self.pool_availability * 100.0
            )?;
        }
        for (key, value) in &self.custom_parameters {
            writeln!(f, "\t{}: {}", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::status::{DRAINING, MAINT, MASTER, RUNNING, SLAVE};
    use tempfile::tempdir;

    const MAX_AGE: Duration = Duration::from_secs(60);

    fn pooled_params() -> ServerParams {
        let mut params = ServerParams::with_address("10.0.0.1", 3306);
        params.persistpoolmax = 2;
        params.persistmaxtime = 60;
        params
    }

    fn active_server(params: &ServerParams) -> Server {
        let server = Server::new("db-1", params, 4).unwrap();
        server.activate();
        server
    }

    #[test]
    fn test_creation_defaults() {
        let params = ServerParams::with_address("10.0.0.1", 3306);
        let server = Server::new("db-1", &params, 4).unwrap();

        assert_eq!(server.name(), "db-1");
        assert_eq!(server.address(), "10.0.0.1");
        assert_eq!(server.port(), 3306);
        assert_eq!(server.extra_port(), 0);
        assert_eq!(server.protocol(), "mariadb-backend");
        assert!(server.status().is_running());
        assert!(!server.is_active());
        assert_eq!(server.lifecycle(), Lifecycle::Provisional);
    }

    #[test]
    fn test_over_long_address_truncated_at_creation() {
        let long_address = "a".repeat(MAX_ADDRESS_LEN + 50);
        let params = ServerParams::with_address(long_address, 3306);
        let server = Server::new("db-1", &params, 1).unwrap();
        assert_eq!(server.address().len(), MAX_ADDRESS_LEN);
    }

    #[test]
    fn test_monitor_credentials_must_be_paired() {
        let mut params = ServerParams::with_address("10.0.0.1", 3306);
        params.monitor_user = Some("admin".to_string());
        params.monitor_password = Some("".to_string());

        let result = Server::new("db-1", &params, 4);
        assert!(matches!(result, Err(RegistryError::Validation(_))));

        params.monitor_password = Some("secret".to_string());
        let server = Server::new("db-1", &params, 4).unwrap();
        assert_eq!(server.monitor_user(), "admin");
        assert_eq!(server.monitor_password(), "secret");
    }

    #[test]
    fn test_password_without_user_rejected() {
        let mut params = ServerParams::with_address("10.0.0.1", 3306);
        params.monitor_password = Some("secret".to_string());
        assert!(Server::new("db-1", &params, 4).is_err());
    }

    #[test]
    fn test_over_long_monitor_user_rejected_without_mutation() {
        let params = ServerParams::with_address("10.0.0.1", 3306);
        let server = Server::new("db-1", &params, 4).unwrap();

        server.set_monitor_user("admin").unwrap();
        let too_long = "u".repeat(MAX_MONUSER_LEN + 1);
        assert!(server.set_monitor_user(&too_long).is_err());
        assert_eq!(server.monitor_user(), "admin");

        let too_long_pw = "p".repeat(MAX_MONPW_LEN + 1);
        assert!(server.set_monitor_password(&too_long_pw).is_err());
        assert_eq!(server.monitor_password(), "");
    }

    #[test]
    fn test_status_set_clear_roundtrip() {
        let params = ServerParams::with_address("10.0.0.1", 3306);
        let server = Server::new("db-1", &params, 1).unwrap();
        server.set_status(SLAVE);
        let before = server.status_bits();

        server.set_status(MAINT);
        server.clear_status(MAINT);
        assert_eq!(server.status_bits(), before);
    }

    #[test]
    fn test_port_updates_are_visible() {
        let params = ServerParams::with_address("10.0.0.1", 3306);
        let server = Server::new("db-1", &params, 1).unwrap();

        server.update_port(3307);
        server.update_extra_port(3308);
        assert_eq!(server.port(), 3307);
        assert_eq!(server.extra_port(), 3308);
    }

    #[test]
    fn test_custom_parameter_roundtrip() {
        let params = ServerParams::with_address("10.0.0.1", 3306);
        let server = Server::new("db-1", &params, 1).unwrap();

        assert!(server.get_custom_parameter("weight").is_none());
        server.set_custom_parameter("weight", "3");
        assert_eq!(server.get_custom_parameter("weight").as_deref(), Some("3"));
    }

    #[test]
    fn test_pool_scenario_capacity_two() {
        let params = pooled_params();
        let server = active_server(&params);
        let worker = WorkerId::new(0);

        let a = BackendConnection::new("userA", "ipX", "mariadb-backend");
        let b = BackendConnection::new("userB", "ipY", "mariadb-backend");
        server.connection_opened();
        server.connection_opened();
        server.release_persistent_connection(a, worker);
        server.release_persistent_connection(b, worker);
        assert_eq!(server.pool_stats().pooled(), 2);

        let first = server.get_persistent_connection("userA", "ipX", "mariadb-backend", worker);
        assert!(first.is_some());

        let second = server.get_persistent_connection("userA", "ipX", "mariadb-backend", worker);
        assert!(second.is_none());
    }

    #[test]
    fn test_fetch_refused_when_not_running() {
        let params = pooled_params();
        let server = active_server(&params);
        let worker = WorkerId::new(0);

        server.connection_opened();
        server.release_persistent_connection(
            BackendConnection::new("userA", "ipX", "mariadb-backend"),
            worker,
        );

        server.clear_status(RUNNING);
        assert!(server
            .get_persistent_connection("userA", "ipX", "mariadb-backend", worker)
            .is_none());

        server.set_status(RUNNING);
        assert!(server
            .get_persistent_connection("userA", "ipX", "mariadb-backend", worker)
            .is_some());
    }

    #[test]
    fn test_pooling_disabled_by_default() {
        let params = ServerParams::with_address("10.0.0.1", 3306);
        let server = active_server(&params);
        let worker = WorkerId::new(0);

        server.connection_opened();
        let outcome = server.release_persistent_connection(
            BackendConnection::new("userA", "ipX", "mariadb-backend"),
            worker,
        );
        assert_eq!(outcome, ReleaseOutcome::Closed);
        assert!(server
            .get_persistent_connection("userA", "ipX", "mariadb-backend", worker)
            .is_none());
    }

    #[test]
    fn test_release_on_inactive_server_closes() {
        let params = pooled_params();
        let server = active_server(&params);
        let worker = WorkerId::new(0);

        server.connection_opened();
        server.deactivate();

        let outcome = server.release_persistent_connection(
            BackendConnection::new("userA", "ipX", "mariadb-backend"),
            worker,
        );
        assert_eq!(outcome, ReleaseOutcome::Closed);
        assert_eq!(server.pool_stats().pooled(), 0);
    }

    #[test]
    fn test_lifecycle_drain_to_retired() {
        let params = pooled_params();
        let server = active_server(&params);
        let worker = WorkerId::new(0);
        assert_eq!(server.lifecycle(), Lifecycle::Active);

        server.connection_opened();
        server.deactivate();
        // One connection is still in flight
        assert_eq!(server.lifecycle(), Lifecycle::Draining);

        server.release_persistent_connection(
            BackendConnection::new("userA", "ipX", "mariadb-backend"),
            worker,
        );
        assert_eq!(server.lifecycle(), Lifecycle::Retired);
    }

    #[test]
    fn test_update_from_params_preserves_on_failure() {
        let params = pooled_params();
        let server = active_server(&params);

        let mut bad = pooled_params();
        bad.port = 3400;
        bad.monitor_user = Some("admin".to_string());
        bad.monitor_password = Some("p".repeat(MAX_MONPW_LEN + 1));

        assert!(server.update_from_params(&bad).is_err());
        // Nothing changed, including the earlier fields of the update
        assert_eq!(server.port(), 3306);
        assert_eq!(server.monitor_user(), "");
    }

    #[test]
    fn test_update_from_params_rejects_protocol_change() {
        let params = pooled_params();
        let server = active_server(&params);

        let mut changed = pooled_params();
        changed.protocol = "postgres-backend".to_string();
        assert!(server.update_from_params(&changed).is_err());
    }

    #[test]
    fn test_update_from_params_applies_settings() {
        let params = pooled_params();
        let server = active_server(&params);

        let mut updated = pooled_params();
        updated.port = 3400;
        updated.persistpoolmax = 8;
        updated.persistmaxtime = 120;
        updated.rank = Rank::Secondary;
        updated.custom.insert("weight".to_string(), "5".to_string());

        server.update_from_params(&updated).unwrap();
        assert_eq!(server.port(), 3400);
        assert_eq!(server.persistpoolmax(), 8);
        assert_eq!(server.persistmaxtime(), Duration::from_secs(120));
        assert_eq!(server.rank(), Rank::Secondary);
        assert_eq!(server.get_custom_parameter("weight").as_deref(), Some("5"));
    }

    #[test]
    fn test_response_time_feed() {
        let params = ServerParams::with_address("10.0.0.1", 3306);
        let server = Server::new("db-1", &params, 1).unwrap();

        assert!(server.response_time_average().is_none());
        server.response_time_observe(0.020, 50);
        let avg = server.response_time_average().unwrap();
        assert!((avg.as_secs_f64() - 0.020).abs() < 1e-9);
        assert_eq!(server.response_time_num_samples(), 50);
    }

    #[test]
    fn test_report_snapshot() {
        let params = pooled_params();
        let server = active_server(&params);
        server.set_status(MASTER);
        server.set_version(100301, "10.3.1-MariaDB");
        server.set_custom_parameter("datacenter", "east");

        let report = server.to_report();
        assert_eq!(report.name, "db-1");
        assert_eq!(report.status, "Master, Running");
        assert_eq!(report.backend_type, BackendType::MariaDb);
        assert_eq!(report.version.major, 10);
        assert_eq!(
            report.custom_parameters.get("datacenter").map(String::as_str),
            Some("east")
        );
        assert!(report.response_time_average_secs.is_none());

        // Renders without panicking and mentions the essentials
        let text = report.to_string();
        assert!(text.contains("db-1"));
        assert!(text.contains("Master, Running"));
        assert!(text.contains("not available"));
    }

    #[test]
    fn test_pool_availability_ratio() {
        let params = pooled_params();
        let server = active_server(&params);
        let worker = WorkerId::new(0);

        // One opened, released into pool, then reused once
        server.connection_opened();
        server.release_persistent_connection(
            BackendConnection::new("userA", "ipX", "mariadb-backend"),
            worker,
        );
        server
            .get_persistent_connection("userA", "ipX", "mariadb-backend", worker)
            .unwrap();

        let report = server.to_report();
        assert_eq!(report.connections_from_pool, 1);
        // 1 / (1 + 1 + 1)
        assert!((report.pool_availability - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_config_string_contents() {
        let mut params = pooled_params();
        params.monitor_user = Some("monitor".to_string());
        params.monitor_password = Some("secret".to_string());
        params.custom.insert("weight".to_string(), "3".to_string());
        let server = active_server(&params);

        let config = server.config_string();
        assert!(config.starts_with("[db-1]\ntype=server\n"));
        assert!(config.contains("address=10.0.0.1\n"));
        assert!(config.contains("port=3306\n"));
        assert!(config.contains("protocol=mariadb-backend\n"));
        assert!(config.contains("monitoruser=monitor\n"));
        assert!(config.contains("monitorpw=secret\n"));
        assert!(config.contains("persistpoolmax=2\n"));
        assert!(config.contains("persistmaxtime=60\n"));
        assert!(config.contains("rank=primary\n"));
        assert!(config.contains("weight=3\n"));
    }

    #[test]
    fn test_persist_writes_fragment() {
        let dir = tempdir().unwrap();
        let server = active_server(&pooled_params());

        let path = server.persist(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("db-1.cnf"));

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("[db-1]"));
        assert!(content.contains("address=10.0.0.1"));

        // No stray temp file
        assert!(!dir.path().join("db-1.cnf.tmp").exists());
    }

    #[test]
    fn test_persist_overwrites_previous_fragment() {
        let dir = tempdir().unwrap();
        let server = active_server(&pooled_params());

        server.persist(dir.path()).unwrap();
        server.update_port(3400);
        server.persist(dir.path()).unwrap();

        let content = fs::read_to_string(dir.path().join("db-1.cnf")).unwrap();
        assert!(content.contains("port=3400"));
    }

    #[test]
    fn test_write_fragment_refuses_existing_path() {
        let dir = tempdir().unwrap();
        let server = active_server(&pooled_params());

        let path = dir.path().join("db-1.cnf");
        fs::write(&path, "original content").unwrap();

        let result = server.write_config_fragment(&path);
        assert!(matches!(result, Err(RegistryError::Serialization { .. })));
        // The existing file is untouched
        assert_eq!(fs::read_to_string(&path).unwrap(), "original content");
    }

    #[test]
    fn test_draining_status_bit_independent_of_lifecycle() {
        let params = ServerParams::with_address("10.0.0.1", 3306);
        let server = active_server(&params);

        server.set_status(DRAINING);
        assert!(server.status().is_draining());
        assert!(!server.status().is_usable());
        // The monitor drain bit does not deactivate the server
        assert!(server.is_active());
        assert_eq!(server.lifecycle(), Lifecycle::Active);
    }

    #[test]
    fn test_version_logging_path() {
        let params = ServerParams::with_address("10.0.0.1", 3306);
        let server = Server::new("db-1", &params, 1).unwrap();

        server.set_version(100301, "10.3.1-MariaDB");
        assert_eq!(server.version_string(), "10.3.1-MariaDB");
        assert_eq!(server.backend_type(), BackendType::MariaDb);

        // Setting the same version again is a no-op for the stored values
        server.set_version(100301, "10.3.1-MariaDB");
        assert_eq!(server.version_num().total, 100301);
    }
}
