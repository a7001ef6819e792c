//! Seams between the transport and the consensus engine.
//!
//! The engine is opaque to this crate. It sees peers only through
//! [`PeerLink`], and the transport drives it only through
//! [`ConsensusEngine`], always from behind the agent's lock.

use crate::error::WireError;
use k256::PublicKey;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// The consensus algorithm, driven by [`crate::TcpAgent`].
///
/// Implementations need not be thread-safe: every call is serialized by the
/// agent. Errors are logged by the caller and never stop the update cadence.
pub trait ConsensusEngine: Send + 'static {
    /// Register a newly connected peer. Returns `false` if the engine
    /// refused it.
    fn add_peer(&mut self, peer: Arc<dyn PeerLink>) -> bool;

    /// Advance time-driven state (timeouts, round changes).
    fn update(&mut self, now: Instant) -> Result<(), String>;

    /// Ingest one consensus message received from any peer.
    fn receive_message(&mut self, message: &[u8], now: Instant) -> Result<(), String>;

    /// The peer at `remote_addr` has proven it holds the secret for `key`.
    fn peer_authenticated(&mut self, _remote_addr: SocketAddr, _key: PublicKey) {}
}

/// What the engine can do with a connected peer.
pub trait PeerLink: Send + Sync {
    /// Queue a consensus message. Never blocks; delivery is best-effort.
    fn send(&self, message: Vec<u8>) -> Result<(), WireError>;

    fn remote_addr(&self) -> SocketAddr;

    /// The peer's proven identity, or `None` until the handshake completes.
    fn public_key(&self) -> Option<PublicKey>;
}
