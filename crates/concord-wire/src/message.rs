//! Envelope and handshake message types.
//!
//! Every frame carries one [`Envelope`]: a command tag plus an opaque body.
//! Handshake bodies are themselves MessagePack documents; consensus bodies
//! are handed to the engine verbatim. Byte fields are encoded as MessagePack
//! `bin` values.

use crate::error::WireError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Size of the plaintext challenge, and therefore of its ciphertext.
pub const CHALLENGE_SIZE: usize = 128;

/// Size of the challenge cipher's initialization vector (one AES block).
pub const IV_SIZE: usize = 16;

/// Size of one secp256k1 affine coordinate.
pub const COORDINATE_SIZE: usize = 32;

/// Command tag carried by every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Command {
    /// Keepalive; the body is ignored.
    Nop = 0,
    /// The sender claims a long-term public key.
    KeyAuthInit = 1,
    /// Encrypted challenge for a claimed key.
    KeyAuthChallenge = 2,
    /// Decrypted challenge, proving possession of the private key.
    KeyAuthChallengeReply = 3,
    /// Opaque consensus engine payload.
    Consensus = 4,
}

impl From<Command> for u8 {
    fn from(command: Command) -> u8 {
        command as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = String;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Command::Nop),
            1 => Ok(Command::KeyAuthInit),
            2 => Ok(Command::KeyAuthChallenge),
            3 => Ok(Command::KeyAuthChallengeReply),
            4 => Ok(Command::Consensus),
            other => Err(format!("unknown command tag {other}")),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nop => write!(f, "nop"),
            Self::KeyAuthInit => write!(f, "key_auth_init"),
            Self::KeyAuthChallenge => write!(f, "key_auth_challenge"),
            Self::KeyAuthChallengeReply => write!(f, "key_auth_challenge_reply"),
            Self::Consensus => write!(f, "consensus"),
        }
    }
}

/// The outer wrapper of every frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub command: Command,
    #[serde(with = "serde_bytes")]
    pub message: Vec<u8>,
}

impl Envelope {
    pub fn new(command: Command, message: Vec<u8>) -> Self {
        Self { command, message }
    }

    /// An empty keepalive envelope.
    pub fn nop() -> Self {
        Self::new(Command::Nop, Vec::new())
    }

    /// Wrap a consensus payload.
    pub fn consensus(payload: Vec<u8>) -> Self {
        Self::new(Command::Consensus, payload)
    }

    /// Serialize a handshake body and wrap it with `command`.
    pub fn wrap<T: Serialize>(command: Command, body: &T) -> Result<Self, WireError> {
        Ok(Self::new(command, rmp_serde::to_vec(body)?))
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Decode the body as a handshake message and check its field sizes.
    pub fn body<T>(&self) -> Result<T, WireError>
    where
        T: DeserializeOwned + Validate,
    {
        let body: T = rmp_serde::from_slice(&self.message)?;
        body.validate()?;
        Ok(body)
    }
}

/// Structural checks applied after a handshake body is decoded.
pub trait Validate {
    fn validate(&self) -> Result<(), WireError>;
}

fn check_coordinate(name: &str, value: &[u8]) -> Result<(), WireError> {
    if value.is_empty() || value.len() > COORDINATE_SIZE {
        return Err(WireError::Decode(format!(
            "coordinate {name} must be 1..={COORDINATE_SIZE} bytes, got {}",
            value.len()
        )));
    }
    Ok(())
}

fn check_exact(name: &str, value: &[u8], expected: usize) -> Result<(), WireError> {
    if value.len() != expected {
        return Err(WireError::Decode(format!(
            "{name} must be {expected} bytes, got {}",
            value.len()
        )));
    }
    Ok(())
}

/// A peer announces the long-term public key it wants to prove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAuthInit {
    /// Affine X, big-endian.
    #[serde(with = "serde_bytes")]
    pub x: Vec<u8>,
    /// Affine Y, big-endian.
    #[serde(with = "serde_bytes")]
    pub y: Vec<u8>,
}

impl Validate for KeyAuthInit {
    fn validate(&self) -> Result<(), WireError> {
        check_coordinate("x", &self.x)?;
        check_coordinate("y", &self.y)
    }
}

/// Challenge encrypted under the ECDH secret of an ephemeral key and the
/// claimed key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAuthChallenge {
    /// Ephemeral public key X, big-endian.
    #[serde(with = "serde_bytes")]
    pub x: Vec<u8>,
    /// Ephemeral public key Y, big-endian.
    #[serde(with = "serde_bytes")]
    pub y: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub iv: Vec<u8>,
}

impl Validate for KeyAuthChallenge {
    fn validate(&self) -> Result<(), WireError> {
        check_coordinate("x", &self.x)?;
        check_coordinate("y", &self.y)?;
        check_exact("ciphertext", &self.ciphertext, CHALLENGE_SIZE)?;
        check_exact("iv", &self.iv, IV_SIZE)
    }
}

/// The decrypted challenge sent back to the challenger.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAuthChallengeReply {
    #[serde(with = "serde_bytes")]
    pub plaintext: Vec<u8>,
}

impl Validate for KeyAuthChallengeReply {
    // Any length decodes; a wrong-sized answer is a failed authentication,
    // decided by the handshake's comparison.
    fn validate(&self) -> Result<(), WireError> {
        Ok(())
    }
}

impl std::fmt::Debug for KeyAuthChallengeReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyAuthChallengeReply")
            .field("plaintext", &format_args!("<{} bytes>", self.plaintext.len()))
            .finish()
    }
}
