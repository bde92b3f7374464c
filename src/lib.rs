pub mod config;
pub mod error;
/// Puente - Backend server registry and connection pooling core for database proxies
///
/// Puente owns the state a database proxy keeps per backend server:
/// 1. The registry of known servers, tied to configuration load and reload
/// 2. A per-worker pool of reusable, already-authenticated backend connections
/// 3. Operational status bits, detected version info, and an adaptive
///    response-time estimate feeding weighted routing
///
/// Wire-protocol codecs, routing policy and monitor scheduling are external
/// collaborators that call into this crate through `Server` and
/// `ServerRegistry`.
pub mod core;
pub mod registry;
pub mod utils;
pub mod workers;

pub use crate::config::{RegistryConfig, ServerParams};
pub use crate::core::server::{Server, ServerReport};
pub use crate::error::{RegistryError, RegistryResult};
pub use crate::registry::ServerRegistry;
pub use crate::workers::{WorkerId, Workers};
