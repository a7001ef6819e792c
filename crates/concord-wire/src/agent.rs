//! Coordinator binding a consensus engine to a set of TCP peers.
//!
//! The agent is the single owner of the engine. Every call into it, whether
//! from the periodic update or from a peer's read task delivering a consensus
//! message, goes through one coordinator-wide lock, so the engine never sees
//! concurrent calls.
//!
//! The update cadence is a self-rescheduling task: each run spawns the next
//! one only after it finishes, so slow updates stretch the period instead of
//! piling up.

use crate::engine::ConsensusEngine;
use crate::error::WireError;
use crate::handshake::fingerprint;
use crate::peer::{PeerInfo, TcpPeer};

use concord_types::{ConcordResult, WireConfig};
use k256::{PublicKey, SecretKey};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// State guarded by the coordinator lock.
struct AgentState {
    engine: Box<dyn ConsensusEngine>,
    peers: Vec<Arc<TcpPeer>>,
}

/// Coordinator for one consensus node.
pub struct TcpAgent {
    config: WireConfig,
    /// Long-term identity key; answers key-auth challenges.
    secret_key: SecretKey,
    public_key: PublicKey,
    state: Mutex<AgentState>,
    shutdown_tx: watch::Sender<bool>,
    shutting_down: AtomicBool,
}

impl TcpAgent {
    /// Create an agent around `engine`, identified by `secret_key`.
    pub fn new(
        engine: Box<dyn ConsensusEngine>,
        secret_key: SecretKey,
        config: WireConfig,
    ) -> ConcordResult<Arc<Self>> {
        config.validate()?;
        let public_key = secret_key.public_key();
        let (shutdown_tx, _) = watch::channel(false);

        info!(key = %fingerprint(&public_key), "Consensus agent created");

        Ok(Arc::new(Self {
            config,
            secret_key,
            public_key,
            state: Mutex::new(AgentState {
                engine,
                peers: Vec::new(),
            }),
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &WireConfig {
        &self.config
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub(crate) fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// Wrap an established stream in a [`TcpPeer`] and register it with the
    /// engine.
    ///
    /// The peer is kept even if the engine declines it, so the handshake can
    /// still run; the refusal is logged.
    pub fn add_peer(self: &Arc<Self>, stream: TcpStream) -> Result<Arc<TcpPeer>, WireError> {
        if self.is_shutting_down() {
            return Err(WireError::ShuttingDown);
        }
        stream.set_nodelay(true)?;
        let peer = TcpPeer::spawn(stream, self)?;

        let accepted = {
            let mut state = self.lock();
            // shutdown() raises the flag before draining under this lock, so
            // a peer pushed after this check is always drained.
            if self.is_shutting_down() {
                drop(state);
                peer.close();
                return Err(WireError::ShuttingDown);
            }
            // A peer that already died has already run remove_peer.
            if !peer.is_closed() {
                state.peers.push(Arc::clone(&peer));
            }
            state.engine.add_peer(peer.clone())
        };
        if accepted {
            info!(peer = %peer.remote_addr(), "Peer added");
        } else {
            warn!(peer = %peer.remote_addr(), "Consensus engine declined peer");
        }
        Ok(peer)
    }

    /// Dial `addr`, register the connection, and start proving our key.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<Arc<TcpPeer>, WireError> {
        info!(peer = %addr, "Connecting to peer");
        let timeout = self.config.connect_timeout();
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(WireError::Timeout {
                    operation: "connect",
                    after: timeout,
                })
            }
        };
        let peer = self.add_peer(stream)?;
        peer.start_auth()?;
        Ok(peer)
    }

    /// Bind the configured listen address and accept peers until shutdown.
    ///
    /// Returns the bound address (useful with port 0) and the accept task.
    /// Accepted peers immediately start proving our key too, so both sides
    /// end up authenticated to each other.
    pub async fn listen(self: &Arc<Self>) -> Result<(SocketAddr, JoinHandle<()>), WireError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Listening for peers");

        let agent = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = async {
                        let _ = shutdown.wait_for(|stop| *stop).await;
                    } => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, addr)) => {
                        debug!(peer = %addr, "Accepted connection");
                        match agent.add_peer(stream) {
                            Ok(peer) => {
                                if let Err(e) = peer.start_auth() {
                                    warn!(peer = %addr, error = %e, "Could not start key auth");
                                }
                            }
                            Err(e) => warn!(peer = %addr, error = %e, "Rejected connection"),
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
            debug!("Accept loop stopped");
        });

        Ok((local_addr, handle))
    }

    /// Run one engine update and schedule the next.
    ///
    /// Call once, from within a tokio runtime, to start the cadence. Stops
    /// rescheduling after [`TcpAgent::shutdown`]; a tick that was already
    /// scheduled may still run once and then stop.
    pub fn update(self: &Arc<Self>) {
        if self.is_shutting_down() {
            return;
        }

        {
            let mut state = self.lock();
            if let Err(e) = state.engine.update(Instant::now()) {
                warn!(error = %e, "Consensus update failed");
            }
        }

        let agent = Arc::downgrade(self);
        let interval = self.config.update_interval();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(agent) = agent.upgrade() {
                agent.update();
            }
        });
    }

    /// Deliver a consensus message from `peer` to the engine.
    pub(crate) fn handle_consensus_message(&self, peer: &TcpPeer, message: &[u8]) {
        if self.config.require_authenticated_consensus && !peer.is_authenticated() {
            warn!(
                peer = %peer.remote_addr(),
                state = %peer.auth_state(),
                "Dropping consensus message from unauthenticated peer"
            );
            return;
        }

        let mut state = self.lock();
        if let Err(e) = state.engine.receive_message(message, Instant::now()) {
            debug!(peer = %peer.remote_addr(), error = %e, "Consensus engine rejected message");
        }
    }

    /// Tell the engine that `peer` proved ownership of `key`.
    ///
    /// Called by the peer's read task with no peer lock held.
    pub(crate) fn peer_authenticated(&self, peer: &TcpPeer, key: &PublicKey) {
        let authenticated = {
            let mut state = self.lock();
            state.engine.peer_authenticated(peer.remote_addr(), *key);
            state.peers.iter().filter(|p| p.is_authenticated()).count()
        };
        info!(
            peer = %peer.remote_addr(),
            key = %fingerprint(key),
            authenticated,
            "Peer authenticated"
        );
    }

    /// Forget a peer whose connection has ended.
    pub(crate) fn remove_peer(&self, peer: &TcpPeer) {
        let mut state = self.lock();
        state.peers.retain(|p| !std::ptr::eq(p.as_ref(), peer));
    }

    /// All live peers.
    pub fn peers(&self) -> Vec<Arc<TcpPeer>> {
        self.lock().peers.clone()
    }

    pub fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }

    /// Public keys of every peer that has completed the handshake.
    pub fn authenticated_peers(&self) -> Vec<PublicKey> {
        self.peers().iter().filter_map(|p| p.public_key()).collect()
    }

    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.peers().iter().map(|p| p.info()).collect()
    }

    /// Stop the update cadence and close every peer.
    ///
    /// Only the first call has any effect and returns `true`.
    pub fn shutdown(&self) -> bool {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!("Consensus agent shutting down");
        self.shutdown_tx.send_replace(true);

        // Closed outside the lock: peers call back into remove_peer.
        let peers = std::mem::take(&mut self.lock().peers);
        for peer in peers {
            peer.close();
        }
        true
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}
