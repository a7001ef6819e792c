//! Public-key authentication handshake.
//!
//! A peer proves it holds the private key for a claimed secp256k1 public key
//! without ever sending a long-term secret:
//!
//! ```text
//! initiator                                         responder
//!   │  KeyAuthInit { X, Y }  ──────────────────────────►  │
//!   │                                  ephemeral key e    │
//!   │                                  s = ECDH(e, claim) │
//!   │                                  c = AES-256-CFB(s, iv, random[128])
//!   │  ◄──────────────  KeyAuthChallenge { eX, eY, c, iv }│
//!   │  s = ECDH(own key, e)                               │
//!   │  p = decrypt(s, iv, c)                              │
//!   │  KeyAuthChallengeReply { p }  ───────────────────►  │
//!   │                                  p == random ? Authenticated
//!   │                                               : AuthenticationFailed
//! ```
//!
//! The responder side is a forward-only state machine; no transition leaves
//! `Authenticated` or `AuthenticationFailed`, so an authenticated or
//! challenged peer cannot restart the handshake to force a fresh secret.
//! The initiator side tracks its own small state so that a challenge is only
//! answered once, and only after we asked for it.

use crate::error::WireError;
use crate::message::{
    KeyAuthChallenge, KeyAuthChallengeReply, KeyAuthInit, CHALLENGE_SIZE, COORDINATE_SIZE, IV_SIZE,
};
use aes::Aes256;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use k256::ecdh::{diffie_hellman, EphemeralSecret, SharedSecret};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CfbEnc = cfb_mode::Encryptor<Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<Aes256>;

/// Authentication state of a remote peer, driven by the peer's own
/// `KeyAuthInit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// The peer has just connected.
    NotAuthenticated,
    /// The peer announced a key and we sent it a challenge.
    ChallengeIssued,
    /// The peer answered the challenge; its public key is trusted.
    Authenticated,
    /// The peer answered the challenge wrongly.
    AuthenticationFailed,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotAuthenticated => "not_authenticated",
            Self::ChallengeIssued => "challenge_issued",
            Self::Authenticated => "authenticated",
            Self::AuthenticationFailed => "authentication_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Authenticated | Self::AuthenticationFailed)
    }

    /// The complete transition table.
    pub fn can_transition_to(self, next: AuthState) -> bool {
        matches!(
            (self, next),
            (Self::NotAuthenticated, Self::ChallengeIssued)
                | (Self::ChallengeIssued, Self::Authenticated)
                | (Self::ChallengeIssued, Self::AuthenticationFailed)
        )
    }
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of our own proof towards the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalAuthState {
    /// We have not announced our key.
    Idle,
    /// `KeyAuthInit` sent, waiting for the challenge.
    InitSent,
    /// Challenge decrypted and answered.
    ChallengeAnswered,
}

impl LocalAuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InitSent => "init_sent",
            Self::ChallengeAnswered => "challenge_answered",
        }
    }
}

/// Challenge material held between sending a challenge and checking the
/// reply. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct Challenge {
    plaintext: Vec<u8>,
    iv: Vec<u8>,
}

/// Per-connection handshake state, both directions.
pub struct Handshake {
    state: AuthState,
    local_state: LocalAuthState,
    /// Announced key; trusted only once `state` is `Authenticated`.
    claimed_key: Option<PublicKey>,
    challenge: Option<Challenge>,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("state", &self.state)
            .field("local_state", &self.local_state)
            .field("challenge_pending", &self.challenge.is_some())
            .finish()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: AuthState::NotAuthenticated,
            local_state: LocalAuthState::Idle,
            claimed_key: None,
            challenge: None,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn local_state(&self) -> LocalAuthState {
        self.local_state
    }

    /// The peer's public key, only once it has been proven.
    pub fn peer_public_key(&self) -> Option<PublicKey> {
        match self.state {
            AuthState::Authenticated => self.claimed_key,
            _ => None,
        }
    }

    fn advance(&mut self, next: AuthState, operation: &'static str) -> Result<(), WireError> {
        if !self.state.can_transition_to(next) {
            return Err(WireError::InvalidAuthState {
                state: self.state.as_str(),
                operation,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Begin proving `own_key` to the peer.
    pub fn start(&mut self, own_key: &PublicKey) -> Result<KeyAuthInit, WireError> {
        if self.local_state != LocalAuthState::Idle {
            return Err(WireError::InvalidAuthState {
                state: self.local_state.as_str(),
                operation: "start",
            });
        }
        let (x, y) = public_key_coordinates(own_key);
        self.local_state = LocalAuthState::InitSent;
        Ok(KeyAuthInit { x, y })
    }

    /// Responder: challenge the key announced in `init`.
    pub fn handle_init(&mut self, init: &KeyAuthInit) -> Result<KeyAuthChallenge, WireError> {
        // Checked up front so a replayed init is refused before any work.
        if !self.state.can_transition_to(AuthState::ChallengeIssued) {
            return Err(WireError::InvalidAuthState {
                state: self.state.as_str(),
                operation: "key_auth_init",
            });
        }
        let claimed = public_key_from_coordinates(&init.x, &init.y)?;

        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let shared = ephemeral.diffie_hellman(&claimed);

        let mut challenge = Challenge {
            plaintext: vec![0u8; CHALLENGE_SIZE],
            iv: vec![0u8; IV_SIZE],
        };
        OsRng.fill_bytes(&mut challenge.plaintext);
        OsRng.fill_bytes(&mut challenge.iv);

        let mut ciphertext = challenge.plaintext.clone();
        encrypt_challenge(&shared, &challenge.iv, &mut ciphertext)?;

        let (x, y) = public_key_coordinates(&ephemeral.public_key());
        let message = KeyAuthChallenge {
            x,
            y,
            ciphertext,
            iv: challenge.iv.clone(),
        };

        self.advance(AuthState::ChallengeIssued, "key_auth_init")?;
        self.claimed_key = Some(claimed);
        self.challenge = Some(challenge);
        Ok(message)
    }

    /// Initiator: answer the challenge for our own key.
    ///
    /// Only one challenge is answered per connection, and only after
    /// [`Handshake::start`] announced our key.
    pub fn handle_challenge(
        &mut self,
        secret_key: &SecretKey,
        challenge: &KeyAuthChallenge,
    ) -> Result<KeyAuthChallengeReply, WireError> {
        if self.local_state != LocalAuthState::InitSent {
            return Err(WireError::UnexpectedChallenge);
        }
        let reply = answer_challenge(secret_key, challenge)?;
        self.local_state = LocalAuthState::ChallengeAnswered;
        Ok(reply)
    }

    /// Responder: check the peer's answer.
    pub fn handle_reply(&mut self, reply: &KeyAuthChallengeReply) -> Result<(), WireError> {
        if self.state != AuthState::ChallengeIssued {
            return Err(WireError::InvalidAuthState {
                state: self.state.as_str(),
                operation: "key_auth_challenge_reply",
            });
        }
        let matches: bool = self
            .challenge
            .as_ref()
            .map(|c| c.plaintext.as_slice().ct_eq(reply.plaintext.as_slice()).into())
            .unwrap_or(false);

        // Drop wipes the plaintext and IV either way.
        self.challenge = None;

        if matches {
            self.advance(AuthState::Authenticated, "key_auth_challenge_reply")
        } else {
            self.advance(AuthState::AuthenticationFailed, "key_auth_challenge_reply")?;
            self.claimed_key = None;
            Err(WireError::InvalidChallengeResponse)
        }
    }
}

/// Decrypt a challenge addressed to `secret_key` without touching any
/// handshake state.
pub fn answer_challenge(
    secret_key: &SecretKey,
    challenge: &KeyAuthChallenge,
) -> Result<KeyAuthChallengeReply, WireError> {
    let ephemeral = public_key_from_coordinates(&challenge.x, &challenge.y)?;
    let shared = diffie_hellman(secret_key.to_nonzero_scalar(), ephemeral.as_affine());

    let mut plaintext = challenge.ciphertext.clone();
    let cipher = Aes256CfbDec::new_from_slices(shared.raw_secret_bytes().as_slice(), &challenge.iv)
        .map_err(|e| WireError::Crypto(format!("challenge cipher: {e}")))?;
    cipher.decrypt(&mut plaintext);
    Ok(KeyAuthChallengeReply { plaintext })
}

fn encrypt_challenge(shared: &SharedSecret, iv: &[u8], buf: &mut [u8]) -> Result<(), WireError> {
    let cipher = Aes256CfbEnc::new_from_slices(shared.raw_secret_bytes().as_slice(), iv)
        .map_err(|e| WireError::Crypto(format!("challenge cipher: {e}")))?;
    cipher.encrypt(buf);
    Ok(())
}

/// Fixed-width big-endian affine coordinates of `key`.
pub fn public_key_coordinates(key: &PublicKey) -> (Vec<u8>, Vec<u8>) {
    let point = key.to_encoded_point(false);
    let x = point.x().map(|x| x.to_vec()).unwrap_or_default();
    let y = point.y().map(|y| y.to_vec()).unwrap_or_default();
    (x, y)
}

/// Parse big-endian coordinates into a curve point.
///
/// Leading zero bytes may have been stripped by the sender; each coordinate
/// is left-padded back to 32 bytes.
pub fn public_key_from_coordinates(x: &[u8], y: &[u8]) -> Result<PublicKey, WireError> {
    if x.len() > COORDINATE_SIZE || y.len() > COORDINATE_SIZE {
        return Err(WireError::InvalidPublicKey(format!(
            "coordinate longer than {COORDINATE_SIZE} bytes"
        )));
    }
    let mut sec1 = [0u8; 1 + 2 * COORDINATE_SIZE];
    sec1[0] = 0x04;
    sec1[1 + COORDINATE_SIZE - x.len()..1 + COORDINATE_SIZE].copy_from_slice(x);
    sec1[1 + 2 * COORDINATE_SIZE - y.len()..].copy_from_slice(y);
    PublicKey::from_sec1_bytes(&sec1)
        .map_err(|_| WireError::InvalidPublicKey("point is not on secp256k1".into()))
}

/// Short hex fingerprint of a public key for logs.
pub fn fingerprint(key: &PublicKey) -> String {
    let (x, _) = public_key_coordinates(key);
    hex::encode(&x[..8])
}
