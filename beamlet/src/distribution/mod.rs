// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The distribution manager: owns the listening socket, the name-service
//! registration and the table of peer connections.
//!
//! Connections are memoized per peer. Concurrent callers asking for the same
//! unconnected peer share a single outbound attempt (a [Shared] future), so at
//! most one outbound connection to a peer is ever in flight. Failed attempts are
//! evicted from the table, so a later send tries again. Authenticated inbound
//! connections land in the same table.
//!
//! Outbound traffic goes through a per-peer queue drained by a pump task, which
//! keeps every sender's frames to a peer in order even while the connection is
//! still being established. A pump whose peer can't be reached fails its
//! backlog and retires; the next message starts a fresh one.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::concurrency::{self, Duration, Instant, JoinHandle, MpscUnboundedSender};
use crate::config::NodeConfig;
use crate::errors::{ConnectErr, ProtocolErr, StartupErr};
use crate::node::control::ControlMessage;
use crate::term::{self, Term};

pub mod connection;
pub mod epmd;
pub mod flags;
pub(crate) mod hash;
pub mod handshake;


pub use connection::{Connection, InboundFrame};
use epmd::{EpmdClient, Registration};
use flags::DistributionFlags;
use handshake::{LocalIdentity, SessionStatus};

type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<Connection>, ConnectErr>>>;

/// A slot in the peer table
enum PeerEntry {
    /// Our outbound attempt, possibly finished
    Pending(ConnectFuture),
    /// A connection which completed its handshake
    Established(Arc<Connection>),
}

impl PeerEntry {
    fn connection(&self) -> Option<&Arc<Connection>> {
        match self {
            Self::Established(conn) => Some(conn),
            Self::Pending(attempt) => match attempt.peek() {
                Some(Ok(conn)) => Some(conn),
                _ => None,
            },
        }
    }

    fn live_connection(&self) -> Option<&Arc<Connection>> {
        self.connection().filter(|conn| !conn.is_closed())
    }

    fn in_flight(&self) -> Option<&ConnectFuture> {
        match self {
            Self::Pending(attempt) if attempt.peek().is_none() => Some(attempt),
            _ => None,
        }
    }

    fn is_attempt(&self, attempt: &ConnectFuture) -> bool {
        matches!(self, Self::Pending(mine) if mine.ptr_eq(attempt))
    }
}

/// A peer's outbound queue. `id` tells a retired pump's queue from its
/// replacement
struct PeerQueue {
    id: u64,
    tx: MpscUnboundedSender<Outbound>,
}

/// A control message waiting on its peer's connection
struct Outbound {
    control: ControlMessage,
    payload: Option<Term>,
}

/// See the module-level documentation
pub struct Distribution {
    identity: LocalIdentity,
    hostname: String,
    epmd_host: String,
    epmd_port: u16,
    heartbeat_interval: Duration,
    liveness_timeout: Duration,
    handshake_timeout: Duration,
    local_addr: SocketAddr,

    peers: DashMap<String, PeerEntry>,
    established: Notify,
    queues: DashMap<String, PeerQueue>,
    inbound: MpscUnboundedSender<InboundFrame>,
    next_connection: AtomicU64,
    next_queue: AtomicU64,

    listener: Mutex<Option<JoinHandle<()>>>,
    registration: Mutex<Option<Registration>>,
}

impl std::fmt::Debug for Distribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distribution")
            .field("name", &self.identity.name)
            .field("creation", &self.identity.creation)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Distribution {
    /// Bind the listener, register with the name service and start accepting
    /// peers. Decoded inbound frames are forwarded to `inbound`
    pub async fn listen(
        config: &NodeConfig,
        cookie: String,
        inbound: MpscUnboundedSender<InboundFrame>,
    ) -> Result<Arc<Self>, StartupErr> {
        let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
            .await
            .map_err(StartupErr::Bind)?;
        let local_addr = listener.local_addr().map_err(StartupErr::Bind)?;
        log::info!("Distribution listening on {local_addr}");

        let registration = EpmdClient::new(config.epmd_host.clone(), config.epmd_port)
            .register(&config.name, local_addr.port())
            .await?;

        let dist = Arc::new(Self {
            identity: LocalIdentity {
                name: config.node_name(),
                flags: DistributionFlags::DEFAULT,
                creation: registration.creation,
                cookie,
            },
            hostname: config.hostname.clone(),
            epmd_host: config.epmd_host.clone(),
            epmd_port: config.epmd_port,
            heartbeat_interval: config.heartbeat_interval,
            liveness_timeout: config.liveness_timeout,
            handshake_timeout: config.handshake_timeout,
            local_addr,
            peers: DashMap::new(),
            established: Notify::new(),
            queues: DashMap::new(),
            inbound,
            next_connection: AtomicU64::new(1),
            next_queue: AtomicU64::new(1),
            listener: Mutex::new(None),
            registration: Mutex::new(Some(registration)),
        });

        let handle = concurrency::spawn(Self::accept_loop(Arc::downgrade(&dist), listener));
        *dist
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(dist)
    }

    /// Our full node name
    pub fn node_name(&self) -> &str {
        &self.identity.name
    }

    /// The creation assigned by the name service
    pub fn creation(&self) -> u32 {
        self.identity.creation
    }

    /// The address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub(crate) fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    pub(crate) fn inbound_sender(&self) -> MpscUnboundedSender<InboundFrame> {
        self.inbound.clone()
    }

    async fn accept_loop(dist: Weak<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let Some(dist) = dist.upgrade() else {
                        break;
                    };
                    log::debug!("Accepted distribution connection from {addr}");
                    concurrency::spawn(async move {
                        if let Err(err) = dist.accept(stream).await {
                            log::warn!("Inbound handshake from {addr} failed: {err}");
                        }
                    });
                }
                Err(socket_accept_error) => {
                    log::warn!("Error accepting socket {socket_accept_error}");
                }
            }
        }
    }

    async fn accept(self: &Arc<Self>, mut stream: TcpStream) -> Result<(), ProtocolErr> {
        stream.set_nodelay(true)?;
        let handshake = handshake::run_server(&mut stream, &self.identity, |peer| {
            self.check_peer(peer)
        });
        let peer = concurrency::timeout(self.handshake_timeout, handshake).await??;
        let conn = Connection::start(self, stream, peer);
        self.register_connection(conn);
        Ok(())
    }

    /// Decide the status for an incoming handshake from `peer`
    pub(crate) fn check_peer(&self, peer: &str) -> SessionStatus {
        if peer == self.identity.name {
            return SessionStatus::NotAllowed;
        }
        let Some(existing) = self.peers.get(peer) else {
            return SessionStatus::Ok;
        };
        if existing.live_connection().is_some() {
            SessionStatus::Alive
        } else if existing.in_flight().is_some() {
            // an outbound attempt of ours is in flight. The greater name wins
            if self.identity.name.as_str() > peer {
                SessionStatus::Nok
            } else {
                SessionStatus::OkSimultaneous
            }
        } else {
            SessionStatus::Ok
        }
    }

    /// Index an authenticated inbound connection under its peer's name,
    /// replacing (and closing) any previous connection to that peer
    fn register_connection(&self, conn: Arc<Connection>) {
        let previous = self
            .peers
            .insert(conn.peer().name.clone(), PeerEntry::Established(conn.clone()));
        if let Some(old) = previous.as_ref().and_then(PeerEntry::connection) {
            if old.id() != conn.id() {
                old.close();
            }
        }
        self.established.notify_waiters();
    }

    /// Drop the peer entry for a connection which closed, unless it was
    /// already replaced
    pub(crate) fn remove_connection(&self, conn: &Connection) {
        let removed = self.peers.remove_if(&conn.peer().name, |_, entry| {
            matches!(entry.connection(), Some(existing) if existing.id() == conn.id())
        });
        if removed.is_some() {
            log::info!("Peer '{}' disconnected", conn.peer().name);
        }
    }

    /// The live connection to `peer`, if there is one
    pub fn established_connection(&self, peer: &str) -> Option<Arc<Connection>> {
        self.peers.get(peer)?.live_connection().cloned()
    }

    /// The names of every peer with a live connection
    pub fn connected_nodes(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|entry| entry.value().live_connection().is_some())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Get the connection to `peer`, establishing it if needed. Concurrent
    /// callers share one attempt
    pub async fn get_connection(self: &Arc<Self>, peer: &str) -> Result<Arc<Connection>, ConnectErr> {
        let attempt = match self.peers.entry(peer.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if let Some(conn) = entry.get().live_connection() {
                    return Ok(conn.clone());
                }
                let in_flight = entry.get().in_flight().cloned();
                match in_flight {
                    Some(attempt) => attempt,
                    None => {
                        let attempt = self.connect_future(peer);
                        entry.insert(PeerEntry::Pending(attempt.clone()));
                        attempt
                    }
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let attempt = self.connect_future(peer);
                entry.insert(PeerEntry::Pending(attempt.clone()));
                attempt
            }
        };

        match attempt.clone().await {
            Ok(conn) => {
                if let Some(mut entry) = self.peers.get_mut(peer) {
                    if entry.is_attempt(&attempt) {
                        *entry = PeerEntry::Established(conn.clone());
                    }
                }
                Ok(conn)
            }
            Err(err) => {
                // failed attempts aren't cached
                self.peers.remove_if(peer, |_, entry| entry.is_attempt(&attempt));
                if err.is_lost_race() {
                    log::debug!("Outbound connection to '{peer}' lost the race, waiting on the inbound one");
                    self.wait_for_peer(peer, err).await
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn wait_for_peer(&self, peer: &str, err: ConnectErr) -> Result<Arc<Connection>, ConnectErr> {
        let deadline = Instant::now() + self.handshake_timeout;
        loop {
            let notified = self.established.notified();
            if let Some(conn) = self.established_connection(peer) {
                return Ok(conn);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(err);
            }
            // re-check periodically in case a notification raced the check above
            let wait = (deadline - now).min(Duration::from_millis(50));
            let _ = concurrency::timeout(wait, notified).await;
        }
    }

    fn connect_future(self: &Arc<Self>, peer: &str) -> ConnectFuture {
        let dist = self.clone();
        let peer = peer.to_string();
        async move { dist.connect(&peer).await }.boxed().shared()
    }

    async fn connect(self: Arc<Self>, peer: &str) -> Result<Arc<Connection>, ConnectErr> {
        let (name, host) = epmd::split_node_name(peer)?;
        if peer == self.identity.name {
            return Err(ProtocolErr::Rejected("not_allowed".to_string()).into());
        }
        let host = if host == self.hostname {
            self.epmd_host.clone()
        } else {
            host.to_string()
        };
        let entry = EpmdClient::new(host.clone(), self.epmd_port)
            .lookup(name)
            .await?;

        log::debug!("Connecting to '{peer}' at {host}:{}", entry.port);
        let mut stream = TcpStream::connect((host.as_str(), entry.port)).await?;
        stream.set_nodelay(true)?;
        let handshake = handshake::run_client(
            &mut stream,
            &self.identity,
            (entry.lowest_version, entry.highest_version),
        );
        let peer_name = concurrency::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(ProtocolErr::from)??;
        if peer_name.name != peer {
            log::warn!("Expected '{peer}' but the peer calls itself '{}'", peer_name.name);
            return Err(ProtocolErr::Rejected(peer_name.name).into());
        }

        let conn = Connection::start(&self, stream, peer_name);
        self.established.notify_waiters();
        Ok(conn)
    }

    /// Queue a control message (and payload) for `peer`. Messages to one peer
    /// are sent in the order they were queued
    pub fn dispatch(self: &Arc<Self>, peer: &str, control: ControlMessage, payload: Option<Term>) {
        let mut out = Outbound { control, payload };
        loop {
            let (id, tx) = {
                let queue = self
                    .queues
                    .entry(peer.to_string())
                    .or_insert_with(|| self.spawn_pump(peer));
                (queue.id, queue.tx.clone())
            };
            match tx.send(out) {
                Ok(()) => return,
                Err(tokio::sync::mpsc::error::SendError(returned)) => {
                    // that pump retired, start another
                    self.queues.remove_if(peer, |_, queue| queue.id == id);
                    out = returned;
                }
            }
        }
    }

    fn spawn_pump(self: &Arc<Self>, peer: &str) -> PeerQueue {
        let id = self.next_queue.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = concurrency::mpsc_unbounded::<Outbound>();
        let dist = Arc::downgrade(self);
        let peer = peer.to_string();
        concurrency::spawn(async move {
            while let Some(out) = rx.recv().await {
                let Some(dist) = dist.upgrade() else {
                    break;
                };
                match dist.get_connection(&peer).await {
                    Ok(conn) => {
                        if let Err(err) = conn.send(&out.control, out.payload.as_ref()) {
                            log::warn!("Failed to send to '{peer}': {err}");
                            dist.undeliverable(&peer, out);
                        }
                    }
                    Err(err) => {
                        log::warn!("Failed to reach '{peer}': {err}");
                        dist.undeliverable(&peer, out);
                        dist.queues.remove_if(&peer, |_, queue| queue.id == id);
                        rx.close();
                        while let Some(out) = rx.recv().await {
                            dist.undeliverable(&peer, out);
                        }
                        break;
                    }
                }
            }
        });
        PeerQueue { id, tx }
    }

    /// A monitor request that can't reach its peer resolves immediately with a
    /// `noconnection` DOWN. Anything else is dropped
    fn undeliverable(&self, peer: &str, out: Outbound) {
        if let ControlMessage::MonitorP {
            from,
            to,
            reference,
        } = out.control
        {
            let exit = InboundFrame {
                peer: Arc::from(peer),
                control: ControlMessage::MonitorPExit {
                    from: to,
                    to: from,
                    reference,
                    reason: term::atom("noconnection"),
                },
                payload: Bytes::new(),
            };
            let _ = self.inbound.send(exit);
        } else {
            log::debug!("Dropped undeliverable message {:?} to '{peer}'", out.control);
        }
    }

    /// Stop listening, close every connection and drop the name-service
    /// registration
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.queues.clear();
        let connections: Vec<Arc<Connection>> = self
            .peers
            .iter()
            .filter_map(|entry| entry.value().connection().cloned())
            .collect();
        self.peers.clear();
        for conn in connections {
            conn.close();
        }
        // closing the socket unregisters us
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        log::info!("Distribution for '{}' shut down", self.identity.name);
    }
}
