//! Connection actor: one authenticated-or-not link to a remote node.
//!
//! Each [`TcpPeer`] owns a TCP stream split into a read half and a write half,
//! each driven by its own tokio task:
//!
//! - the **read task** pulls frames, decodes envelopes, and dispatches them to
//!   the handshake or to the agent's consensus entry point;
//! - the **write task** sleeps until one of two outgoing queues is signalled,
//!   swaps the queue out under the peer lock, and writes every payload in
//!   order.
//!
//! All mutable state sits behind one `std::sync::Mutex` that is never held
//! across an `.await`. Work signalling uses [`Notify`], which stores at most
//! one permit, so any number of enqueues before the writer wakes coalesce
//! into a single wakeup and producers never block.
//!
//! Ordering is FIFO within each queue. Between the handshake queue and the
//! consensus queue there is no ordering guarantee; the writer prefers
//! handshake traffic when both are pending.

use crate::agent::TcpAgent;
use crate::engine::PeerLink;
use crate::error::WireError;
use crate::frame::{read_frame, write_frame, FrameLimits};
use crate::handshake::{fingerprint, AuthState, Handshake, LocalAuthState};
use crate::message::{Command, Envelope, KeyAuthChallenge, KeyAuthChallengeReply, KeyAuthInit};

use chrono::{DateTime, Utc};
use k256::PublicKey;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, trace, warn};

/// State guarded by the per-peer lock.
struct PeerState {
    handshake: Handshake,
    /// Consensus payloads, wrapped into envelopes at write time.
    consensus_queue: Vec<Vec<u8>>,
    /// Already-encoded handshake envelopes.
    internal_queue: Vec<Vec<u8>>,
}

/// Point-in-time view of a peer for diagnostics.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub remote_addr: SocketAddr,
    pub auth_state: AuthState,
    pub local_auth_state: LocalAuthState,
    /// Hex fingerprint of the proven public key.
    pub fingerprint: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub closed: bool,
}

/// A connection actor for one remote node.
pub struct TcpPeer {
    remote_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    agent: Weak<TcpAgent>,
    state: Mutex<PeerState>,
    consensus_ready: Notify,
    internal_ready: Notify,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TcpPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpPeer")
            .field("remote_addr", &self.remote_addr)
            .field("auth_state", &self.auth_state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TcpPeer {
    /// Take ownership of `stream` and start its read and write tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(stream: TcpStream, agent: &Arc<TcpAgent>) -> Result<Arc<Self>, WireError> {
        let remote_addr = stream.peer_addr()?;
        let config = agent.config();
        let limits = FrameLimits::from(config);
        let keepalive = config.keepalive_interval();

        let (shutdown_tx, _) = watch::channel(false);
        let peer = Arc::new(Self {
            remote_addr,
            connected_at: Utc::now(),
            agent: Arc::downgrade(agent),
            state: Mutex::new(PeerState {
                handshake: Handshake::new(),
                consensus_queue: Vec::new(),
                internal_queue: Vec::new(),
            }),
            consensus_ready: Notify::new(),
            internal_ready: Notify::new(),
            shutdown_tx,
            closed: AtomicBool::new(false),
        });

        // Subscribe before spawning so an early close() is never missed.
        let read_shutdown = peer.shutdown_tx.subscribe();
        let write_shutdown = peer.shutdown_tx.subscribe();
        let (reader, writer) = stream.into_split();

        tokio::spawn(Arc::clone(&peer).read_loop(reader, limits, read_shutdown));
        tokio::spawn(Arc::clone(&peer).write_loop(writer, limits, keepalive, write_shutdown));

        debug!(peer = %remote_addr, "Peer tasks started");
        Ok(peer)
    }

    fn lock(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn auth_state(&self) -> AuthState {
        self.lock().handshake.state()
    }

    pub fn local_auth_state(&self) -> LocalAuthState {
        self.lock().handshake.local_state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_state() == AuthState::Authenticated
    }

    /// The peer's public key, only once the peer has proven it.
    pub fn public_key(&self) -> Option<PublicKey> {
        self.lock().handshake.peer_public_key()
    }

    pub fn info(&self) -> PeerInfo {
        let state = self.lock();
        PeerInfo {
            remote_addr: self.remote_addr,
            auth_state: state.handshake.state(),
            local_auth_state: state.handshake.local_state(),
            fingerprint: state.handshake.peer_public_key().as_ref().map(fingerprint),
            connected_at: self.connected_at,
            closed: self.is_closed(),
        }
    }

    /// Queue a consensus payload for this peer.
    ///
    /// Never blocks. Payloads sent after the peer closed are dropped.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), WireError> {
        if self.is_closed() {
            trace!(peer = %self.remote_addr, "Dropping send on closed peer");
            return Ok(());
        }
        self.lock().consensus_queue.push(payload);
        self.consensus_ready.notify_one();
        Ok(())
    }

    /// Announce our own public key so the peer can challenge it.
    pub fn start_auth(&self) -> Result<(), WireError> {
        let agent = self.agent.upgrade().ok_or(WireError::ShuttingDown)?;
        let mut state = self.lock();
        let init = state.handshake.start(&agent.public_key())?;
        let bytes = Envelope::wrap(Command::KeyAuthInit, &init)?.encode()?;
        state.internal_queue.push(bytes);
        drop(state);
        self.internal_ready.notify_one();
        debug!(peer = %self.remote_addr, "Sent key auth init");
        Ok(())
    }

    /// Close the connection.
    ///
    /// Safe from any task and any number of times. Only the first call fires
    /// the shutdown signal and returns `true`; the socket is released once
    /// both tasks have observed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown_tx.send_replace(true);
        info!(peer = %self.remote_addr, "Peer connection closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until the peer has been closed.
    pub async fn closed(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn enqueue_internal(&self, bytes: Vec<u8>) {
        self.lock().internal_queue.push(bytes);
        self.internal_ready.notify_one();
    }

    /// Read task: frame → envelope → dispatch, until anything fails.
    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        limits: FrameLimits,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => break,
                frame = read_frame(&mut reader, &limits) => frame,
            };

            if let Err(e) = frame.and_then(|bytes| self.handle_frame(&bytes)) {
                match e {
                    WireError::ConnectionClosed => {
                        debug!(peer = %self.remote_addr, "Remote closed the connection")
                    }
                    ref e if e.is_protocol_violation() => {
                        warn!(peer = %self.remote_addr, error = %e, "Handshake violation")
                    }
                    e => debug!(peer = %self.remote_addr, error = %e, "Read loop ended"),
                }
                break;
            }
        }

        self.close();
        if let Some(agent) = self.agent.upgrade() {
            agent.remove_peer(&self);
        }
    }

    fn handle_frame(&self, bytes: &[u8]) -> Result<(), WireError> {
        let envelope = Envelope::decode(bytes)?;
        trace!(peer = %self.remote_addr, command = %envelope.command, "Received envelope");

        match envelope.command {
            Command::Nop => Ok(()),
            Command::KeyAuthInit => {
                let init: KeyAuthInit = envelope.body()?;
                self.handle_key_auth_init(&init)
            }
            Command::KeyAuthChallenge => {
                let challenge: KeyAuthChallenge = envelope.body()?;
                self.handle_key_auth_challenge(&challenge)
            }
            Command::KeyAuthChallengeReply => {
                let reply: KeyAuthChallengeReply = envelope.body()?;
                self.handle_key_auth_challenge_reply(&reply)
            }
            Command::Consensus => {
                let agent = self.agent.upgrade().ok_or(WireError::ShuttingDown)?;
                agent.handle_consensus_message(self, &envelope.message);
                Ok(())
            }
        }
    }

    fn handle_key_auth_init(&self, init: &KeyAuthInit) -> Result<(), WireError> {
        let challenge = self.lock().handshake.handle_init(init)?;
        let bytes = Envelope::wrap(Command::KeyAuthChallenge, &challenge)?.encode()?;
        self.enqueue_internal(bytes);
        debug!(peer = %self.remote_addr, "Issued key auth challenge");
        Ok(())
    }

    fn handle_key_auth_challenge(&self, challenge: &KeyAuthChallenge) -> Result<(), WireError> {
        let agent = self.agent.upgrade().ok_or(WireError::ShuttingDown)?;
        let reply = self
            .lock()
            .handshake
            .handle_challenge(agent.secret_key(), challenge)?;
        let bytes = Envelope::wrap(Command::KeyAuthChallengeReply, &reply)?.encode()?;
        self.enqueue_internal(bytes);
        debug!(peer = %self.remote_addr, "Answered key auth challenge");
        Ok(())
    }

    fn handle_key_auth_challenge_reply(&self, reply: &KeyAuthChallengeReply) -> Result<(), WireError> {
        let key = {
            let mut state = self.lock();
            state.handshake.handle_reply(reply)?;
            state.handshake.peer_public_key()
        };
        if let (Some(key), Some(agent)) = (key, self.agent.upgrade()) {
            agent.peer_authenticated(self, &key);
        }
        Ok(())
    }

    /// Write task: drain whichever queue is signalled, keep the link warm.
    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        limits: FrameLimits,
        keepalive: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let result = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = self.internal_ready.notified() => self.flush_internal(&mut writer, &limits).await,
                _ = self.consensus_ready.notified() => self.flush_consensus(&mut writer, &limits).await,
                _ = tokio::time::sleep(keepalive) => self.write_keepalive(&mut writer, &limits).await,
            };

            if let Err(e) = result {
                warn!(peer = %self.remote_addr, error = %e, "Write loop ended");
                break;
            }
        }

        let _ = writer.shutdown().await;
        self.close();
    }

    async fn flush_internal(
        &self,
        writer: &mut OwnedWriteHalf,
        limits: &FrameLimits,
    ) -> Result<(), WireError> {
        let pending = std::mem::take(&mut self.lock().internal_queue);
        for bytes in pending {
            write_frame(writer, &bytes, limits).await?;
        }
        Ok(())
    }

    async fn flush_consensus(
        &self,
        writer: &mut OwnedWriteHalf,
        limits: &FrameLimits,
    ) -> Result<(), WireError> {
        let pending = std::mem::take(&mut self.lock().consensus_queue);
        for payload in pending {
            let bytes = Envelope::consensus(payload).encode()?;
            match write_frame(writer, &bytes, limits).await {
                Ok(()) => {}
                // Nothing was written; the stream is still in sync.
                Err(WireError::MessageTooLarge { size, max }) => {
                    warn!(
                        peer = %self.remote_addr,
                        size,
                        max,
                        "Dropping oversized consensus message"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn write_keepalive(
        &self,
        writer: &mut OwnedWriteHalf,
        limits: &FrameLimits,
    ) -> Result<(), WireError> {
        trace!(peer = %self.remote_addr, "Sending keepalive");
        let bytes = Envelope::nop().encode()?;
        write_frame(writer, &bytes, limits).await
    }
}

impl PeerLink for TcpPeer {
    fn send(&self, message: Vec<u8>) -> Result<(), WireError> {
        TcpPeer::send(self, message)
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn public_key(&self) -> Option<PublicKey> {
        TcpPeer::public_key(self)
    }
}
