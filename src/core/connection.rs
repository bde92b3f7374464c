/// Pooled backend connection state
///
/// A `BackendConnection` records the negotiated identity of an established
/// backend session: who authenticated it, which client peer it was opened
/// for, and which protocol module speaks on it. The wire-protocol layer owns
/// the actual transport and attaches it here so the pool can keep the whole
/// session alive between client sessions. A connection is exclusively owned
/// at all times, either by a worker's pool bucket or by the code path using
/// it; closing is dropping.
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::debug;

use crate::utils::generate_id;

#[derive(Debug)]
pub struct BackendConnection {
    id: String,
    user: String,
    peer_addr: String,
    protocol: String,
    stream: Option<TcpStream>,
    errored: bool,
    pooled_since: Option<Instant>,
}

impl BackendConnection {
    /// New connection identity without an attached transport
    pub fn new(
        user: impl Into<String>,
        peer_addr: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_id("conn"),
            user: user.into(),
            peer_addr: peer_addr.into(),
            protocol: protocol.into(),
            stream: None,
            errored: false,
            pooled_since: None,
        }
    }

    /// Attach the established transport to this connection
    pub fn with_stream(mut self, stream: TcpStream) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Hand the transport back to the wire-protocol layer
    pub fn take_stream(&mut self) -> Option<TcpStream> {
        self.stream.take()
    }

    /// Exact reuse match: same user, same client peer, same protocol, and
    /// no error observed on the session
    pub fn matches(&self, user: &str, peer_addr: &str, protocol: &str) -> bool {
        !self.errored
            && self.user == user
            && self.peer_addr == peer_addr
            && self.protocol == protocol
    }

    /// Flag the session as failed; sweeps will evict it
    pub fn mark_errored(&mut self) {
        self.errored = true;
    }

    pub fn is_errored(&self) -> bool {
        self.errored
    }

    pub(crate) fn enter_pool(&mut self) {
        self.pooled_since = Some(Instant::now());
    }

    pub(crate) fn leave_pool(&mut self) {
        self.pooled_since = None;
    }

    /// How long the connection has sat idle in a pool
    pub fn idle_for(&self) -> Option<Duration> {
        self.pooled_since.map(|since| since.elapsed())
    }

    /// True if the connection has been pooled longer than `max_age`
    pub fn idle_expired(&self, max_age: Duration) -> bool {
        match self.pooled_since {
            Some(since) => since.elapsed() > max_age,
            None => false,
        }
    }

    /// Close the backend session, dropping the transport
    pub fn close(self) {
        debug!(id = %self.id, user = %self.user, "Closing backend connection");
        // Dropping the stream closes the socket
    }

    #[cfg(test)]
    pub(crate) fn backdate_pooled_since(&mut self, age: Duration) {
        self.pooled_since = Instant::now().checked_sub(age);
    }
}
