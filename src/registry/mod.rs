/// Process-wide registry of backend servers
///
/// The registry owns the name→server mapping and its lifecycle: servers are
/// created or updated when configuration is applied, drained when removed
/// from it, and destroyed only when the last reference goes away. Routing
/// and monitoring code hold `Arc<Server>` references, so an update never
/// replaces an existing object and a deactivated server stays valid for
/// whoever is still using it.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::ServerParams;
use crate::core::server::{Server, ServerReport};
use crate::error::{RegistryError, RegistryResult};
use crate::workers::Workers;

/// Registry of all known backend servers
pub struct ServerRegistry {
    servers: RwLock<HashMap<String, Arc<Server>>>,
    workers: Workers,
}

impl ServerRegistry {
    /// Create a registry with its own worker set; must run on a runtime
    pub fn new(worker_count: usize) -> Self {
        Self::with_workers(Workers::new(worker_count))
    }

    pub fn with_workers(workers: Workers) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            workers,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.count()
    }

    pub fn workers(&self) -> &Workers {
        &self.workers
    }

    /// Create a server from parameters or update the existing one in place.
    ///
    /// An existing server keeps its object identity so in-flight references
    /// observe the new settings; a failed validation leaves the registry
    /// and the server untouched.
    pub async fn apply_config(
        &self,
        name: &str,
        params: &ServerParams,
    ) -> RegistryResult<Arc<Server>> {
        let mut servers = self.servers.write().await;

        if let Some(existing) = servers.get(name) {
            existing.update_from_params(params)?;
            debug!(server = name, "Updated server parameters in place");
            return Ok(Arc::clone(existing));
        }

        let server = Server::new(name, params, self.workers.count())?;
        server.activate();
        let server = Arc::new(server);
        servers.insert(name.to_string(), Arc::clone(&server));
        info!(server = name, address = %server.address(), "Created server");
        Ok(server)
    }

    /// Look up an active server by name
    pub async fn get(&self, name: &str) -> Option<Arc<Server>> {
        let servers = self.servers.read().await;
        servers.get(name).cloned()
    }

    pub async fn server_names(&self) -> Vec<String> {
        let servers = self.servers.read().await;
        let mut names: Vec<String> = servers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of all active servers
    pub async fn servers(&self) -> Vec<Arc<Server>> {
        let servers = self.servers.read().await;
        servers.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.servers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.servers.read().await.is_empty()
    }

    /// Remove a server from configuration.
    ///
    /// The server is marked inactive and drained: every worker closes its
    /// pooled connections, new routing decisions no longer see it, and the
    /// object itself is destroyed when the last `Arc` drops.
    pub async fn deactivate(&self, name: &str) -> RegistryResult<Arc<Server>> {
        let removed = {
            let mut servers = self.servers.write().await;
            servers.remove(name)
        };

        let server = removed.ok_or_else(|| RegistryError::UnknownServer(name.to_string()))?;
        server.deactivate();

        let for_purge = Arc::clone(&server);
        self.workers
            .broadcast(move |worker| {
                for_purge.purge_pool(worker);
            })
            .wait()
            .await;

        info!(server = name, "Deactivated server, draining connections");
        Ok(server)
    }

    /// Run the idle-connection sweep for every server on every worker.
    ///
    /// Each worker ages out its own buckets, so no lock is shared; awaiting
    /// the gather gives callers fresh pool counts. The pass is idempotent
    /// and safe to re-run at any cadence.
    pub async fn broadcast_sweep(&self) {
        let servers = self.servers().await;
        if servers.is_empty() {
            return;
        }

        self.workers
            .broadcast(move |worker| {
                for server in &servers {
                    let evicted = server.sweep_pool(worker);
                    if evicted > 0 {
                        debug!(
                            server = server.name(),
                            worker = worker.index(),
                            evicted,
                            "Swept idle backend connections"
                        );
                    }
                }
            })
            .wait()
            .await;
    }

    /// Point-in-time reports for every server, sorted by name
    pub async fn reports(&self) -> Vec<ServerReport> {
        let servers = self.servers.read().await;
        let mut reports: Vec<ServerReport> =
            servers.values().map(|server| server.to_report()).collect();
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        reports
    }

    /// Persist every server's configuration fragment into `dir`
    pub async fn persist_all(&self, dir: &Path) -> RegistryResult<Vec<PathBuf>> {
        let servers = self.servers().await;
        let mut written = Vec::with_capacity(servers.len());
        for server in servers {
            written.push(server.persist(dir)?);
        }
        written.sort();
        Ok(written)
    }

    /// Tear the registry down, stopping its workers
    pub async fn shutdown(self) {
        self.workers.shutdown().await;
    }
}
