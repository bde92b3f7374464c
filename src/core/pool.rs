/// Per-worker pooling of idle backend connections
///
/// Each server keeps one bucket per worker. A worker's hot path only ever
/// touches its own bucket, so the per-bucket locks are uncontended; they
/// exist so the broadcast maintenance pass may safely run a worker's sweep
/// from wherever the runtime schedules it. Buckets are plain vectors with
/// swap-remove eviction, scanned in full on fetch — bucket sizes are
/// administrator-bounded and small.
///
/// An idle connection that errors is detected lazily at the next sweep or
/// fetch rather than actively polled; detection latency is traded for zero
/// idle overhead.
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::core::connection::BackendConnection;
use crate::workers::WorkerId;

/// Counters describing pool usage, all updated atomically
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Connections currently pooled across all buckets
    n_pooled: AtomicUsize,
    /// Total connections handed out for reuse
    n_from_pool: AtomicU64,
    /// Highest pooled count ever observed
    max_pooled: AtomicUsize,
}

impl PoolStats {
    pub fn pooled(&self) -> usize {
        self.n_pooled.load(Ordering::Relaxed)
    }

    pub fn from_pool(&self) -> u64 {
        self.n_from_pool.load(Ordering::Relaxed)
    }

    pub fn max_pooled(&self) -> usize {
        self.max_pooled.load(Ordering::Relaxed)
    }

    fn incr_pooled(&self) {
        let now = self.n_pooled.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_pooled.fetch_max(now, Ordering::Relaxed);
    }

    fn decr_pooled(&self, count: usize) {
        self.n_pooled.fetch_sub(count, Ordering::Relaxed);
    }
}

/// Pool of reusable backend connections, sharded per worker
#[derive(Debug)]
pub struct ConnectionPool {
    buckets: Vec<Mutex<Vec<BackendConnection>>>,
    stats: PoolStats,
}

/// Outcome of offering a connection back to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Kept for reuse in the worker's bucket
    Pooled,
    /// Closed: pooling disabled, bucket full, or connection errored
    Closed,
}

impl ConnectionPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            buckets: (0..workers).map(|_| Mutex::new(Vec::new())).collect(),
            stats: PoolStats::default(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    fn bucket(&self, worker: WorkerId) -> &Mutex<Vec<BackendConnection>> {
        &self.buckets[worker.index() % self.buckets.len()]
    }

    /// Find a reusable connection in the calling worker's bucket.
    ///
    /// Expired and errored entries are evicted first; then the first entry
    /// matching (user, peer, protocol) exactly is removed and returned.
    pub fn fetch(
        &self,
        user: &str,
        peer_addr: &str,
        protocol: &str,
        worker: WorkerId,
        max_age: Duration,
    ) -> Option<BackendConnection> {
        let mut bucket = self.bucket(worker).lock().unwrap_or_else(|e| e.into_inner());

        if !bucket.is_empty() {
            let evicted = Self::sweep_bucket(&mut bucket, max_age);
            self.stats.decr_pooled(evicted);
        }

        let position = bucket
            .iter()
            .position(|conn| conn.matches(user, peer_addr, protocol))?;

        let mut conn = bucket.swap_remove(position);
        drop(bucket);

        conn.leave_pool();
        self.stats.decr_pooled(1);
        self.stats.n_from_pool.fetch_add(1, Ordering::Relaxed);
        debug!(
            id = %conn.id(),
            user,
            worker = worker.index(),
            "Reusing pooled backend connection"
        );
        Some(conn)
    }

    /// Offer a connection back to the calling worker's bucket.
    ///
    /// `capacity` and `max_age` are the server's `persistpoolmax` and
    /// `persistmaxtime` settings; zero for either disables pooling and the
    /// connection is closed instead.
    pub fn release(
        &self,
        mut conn: BackendConnection,
        worker: WorkerId,
        capacity: usize,
        max_age: Duration,
    ) -> ReleaseOutcome {
        if capacity == 0 || max_age.is_zero() || conn.is_errored() {
            conn.close();
            return ReleaseOutcome::Closed;
        }

        let mut bucket = self.bucket(worker).lock().unwrap_or_else(|e| e.into_inner());

        // Make room by aging out stale entries before checking capacity
        let evicted = Self::sweep_bucket(&mut bucket, max_age);
        self.stats.decr_pooled(evicted);

        if bucket.len() >= capacity {
            drop(bucket);
            conn.close();
            return ReleaseOutcome::Closed;
        }

        conn.enter_pool();
        debug!(
            id = %conn.id(),
            worker = worker.index(),
            pooled = bucket.len() + 1,
            "Pooling backend connection for reuse"
        );
        bucket.push(conn);
        drop(bucket);

        self.stats.incr_pooled();
        ReleaseOutcome::Pooled
    }

    /// Evict errored and over-age entries from the calling worker's bucket
    pub fn sweep(&self, worker: WorkerId, max_age: Duration) -> usize {
        let mut bucket = self.bucket(worker).lock().unwrap_or_else(|e| e.into_inner());
        let evicted = Self::sweep_bucket(&mut bucket, max_age);
        drop(bucket);

        self.stats.decr_pooled(evicted);
        evicted
    }

    /// Close every connection in the calling worker's bucket
    pub fn purge(&self, worker: WorkerId) -> usize {
        let mut bucket = self.bucket(worker).lock().unwrap_or_else(|e| e.into_inner());
        let drained: Vec<BackendConnection> = bucket.drain(..).collect();
        drop(bucket);

        let count = drained.len();
        for conn in drained {
            conn.close();
        }
        self.stats.decr_pooled(count);
        count
    }

    /// Number of connections currently pooled in one worker's bucket
    pub fn pooled_in(&self, worker: WorkerId) -> usize {
        self.bucket(worker)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn sweep_bucket(bucket: &mut Vec<BackendConnection>, max_age: Duration) -> usize {
        let mut evicted = 0;
        let mut i = 0;
        while i < bucket.len() {
            let stale = bucket[i].is_errored() || bucket[i].idle_expired(max_age);
            if stale {
                let conn = bucket.swap_remove(i);
                debug!(id = %conn.id(), "Evicting stale pooled connection");
                conn.close();
                evicted += 1;
            } else {
                i += 1;
            }
        }
        evicted
    }

    #[cfg(test)]
    pub(crate) fn backdate_pooled(&self, worker: WorkerId, age: Duration) {
        let mut bucket = self.bucket(worker).lock().unwrap();
        for conn in bucket.iter_mut() {
            conn.backdate_pooled_since(age);
        }
    }

    #[cfg(test)]
    pub(crate) fn mark_all_errored(&self, worker: WorkerId) {
        let mut bucket = self.bucket(worker).lock().unwrap();
        for conn in bucket.iter_mut() {
            conn.mark_errored();
        }
    }
}
