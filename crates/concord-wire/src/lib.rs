//! Concord wire: TCP transport for a BFT consensus engine.
//!
//! Carries consensus messages between nodes over plain TCP and proves each
//! remote node's secp256k1 identity with an ephemeral-ECDH challenge before
//! its public key is trusted.
//!
//! ## Architecture
//!
//! - **frame**: 4-byte little-endian length-prefixed framing with size and
//!   idle-time limits
//! - **message**: `Envelope` command tags and handshake bodies (MessagePack)
//! - **handshake**: forward-only key-auth state machine
//! - **TcpPeer**: per-connection actor with a read task and a write task
//! - **TcpAgent**: owns the consensus engine and drives it on a fixed cadence
//! - **ConsensusEngine / PeerLink**: the narrow seams to the engine

pub mod agent;
pub mod engine;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod peer;

pub use agent::TcpAgent;
pub use engine::{ConsensusEngine, PeerLink};
pub use error::WireError;
pub use frame::{read_frame, write_frame, FrameLimits};
pub use handshake::{AuthState, Handshake, LocalAuthState};
pub use message::{Command, Envelope, KeyAuthChallenge, KeyAuthChallengeReply, KeyAuthInit};
pub use peer::{PeerInfo, TcpPeer};

/// Re-exported key types used throughout the public API.
pub use k256::{PublicKey, SecretKey};
