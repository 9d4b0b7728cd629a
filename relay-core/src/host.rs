//! Host: one addressable node.
//!
//! Owns the identity, the listeners and every live connection, and dispatches inbound
//! streams to handlers registered by protocol ID. Connections are secured with
//! [`crate::secure`] and multiplexed with [`crate::mux`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::identity::{Keypair, PeerId};
use crate::multiaddr::Multiaddr;
use crate::mux::{Direction, IncomingStreamHandler, MuxConfig, MuxError, Muxer, ResetCode, Stream};
use crate::secure::{handshake_inbound, handshake_outbound, HandshakeError, SecureChannel};
use crate::transport::{BoxedIo, Listener, TransportError, TransportRegistry, ACCEPT_BACKOFF};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("listen on {addr}: {source}")]
    Listen {
        addr: Multiaddr,
        #[source]
        source: TransportError,
    },
    #[error("dial: {0}")]
    Dial(#[from] TransportError),
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("stream: {0}")]
    Mux(#[from] MuxError),
    #[error("a handler for {0} is already registered")]
    DuplicateProtocol(String),
    #[error("not connected to {0}")]
    NotConnected(PeerId),
    #[error("refusing to dial self")]
    DialSelf,
    #[error("host is closed")]
    Closed,
}

/// Facts about a connection that handlers receive with every inbound stream.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub remote_peer: PeerId,
    pub remote_addr: Multiaddr,
    pub direction: Direction,
    pub opened_at: SystemTime,
}

impl ConnectionInfo {
    /// Whether the connection itself runs over a relay circuit.
    pub fn is_relayed(&self) -> bool {
        self.remote_addr.is_relayed()
    }
}

/// A live, secured, multiplexed connection.
#[derive(Clone)]
pub struct Connection {
    info: ConnectionInfo,
    muxer: Muxer,
}

impl Connection {
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn remote_peer(&self) -> PeerId {
        self.info.remote_peer
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.info.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.info.direction
    }

    pub fn is_closed(&self) -> bool {
        self.muxer.is_closed()
    }

    pub fn stream_count(&self) -> usize {
        self.muxer.stream_count()
    }

    pub async fn open_stream(&self, protocol: &str) -> Result<Stream, MuxError> {
        self.muxer.open_stream(protocol).await
    }

    pub fn close(&self) {
        self.muxer.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Connection").field(&self.info).finish()
    }
}

/// Handles inbound streams for one protocol.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn handle(&self, stream: Stream, conn: ConnectionInfo);
}

#[async_trait]
impl<F, Fut> StreamHandler for F
where
    F: Fn(Stream, ConnectionInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, stream: Stream, conn: ConnectionInfo) {
        (self)(stream, conn).await
    }
}

/// Runs once a peer's last connection has closed.
pub type DisconnectHook = Arc<dyn Fn(&ConnectionInfo) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerOptions {
    /// Concurrent inbound streams allowed per connection for this protocol.
    pub max_inbound_streams: Option<usize>,
}

struct HandlerEntry {
    handler: Arc<dyn StreamHandler>,
    options: HandlerOptions,
}

/// Holds one unit of a per-connection inbound stream count.
struct InboundSlot(Arc<AtomicUsize>);

impl InboundSlot {
    fn acquire(counter: &Arc<AtomicUsize>, max: Option<usize>) -> Option<Self> {
        let max = max.unwrap_or(usize::MAX);
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| InboundSlot(counter.clone()))
    }
}

impl Drop for InboundSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct HostInner {
    keypair: Keypair,
    transports: TransportRegistry,
    mux_config: MuxConfig,
    handlers: RwLock<HashMap<String, HandlerEntry>>,
    disconnect_hooks: RwLock<Vec<DisconnectHook>>,
    connections: Mutex<HashMap<PeerId, Connection>>,
    listen_addrs: RwLock<Vec<(u64, Multiaddr)>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Drop for HostInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        for conn in self.conns().values() {
            conn.close();
        }
    }
}

impl HostInner {
    fn conns(&self) -> MutexGuard<'_, HashMap<PeerId, Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn live_connection(&self, peer: &PeerId) -> Option<Connection> {
        self.conns().get(peer).filter(|c| !c.is_closed()).cloned()
    }
}

/// A running node. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

/// Non-owning handle to a [`Host`].
#[derive(Clone)]
pub struct WeakHost(Weak<HostInner>);

impl WeakHost {
    pub fn upgrade(&self) -> Option<Host> {
        self.0.upgrade().map(|inner| Host { inner })
    }
}

impl Host {
    /// Bind every address in `listen_addrs` and start accepting. Any listen failure aborts
    /// construction.
    pub async fn new(
        keypair: Keypair,
        transports: TransportRegistry,
        mux_config: MuxConfig,
        listen_addrs: Vec<Multiaddr>,
    ) -> Result<Host, HostError> {
        let host = Host {
            inner: Arc::new(HostInner {
                keypair,
                transports,
                mux_config,
                handlers: RwLock::new(HashMap::new()),
                disconnect_hooks: RwLock::new(Vec::new()),
                connections: Mutex::new(HashMap::new()),
                listen_addrs: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        };
        for addr in listen_addrs {
            let listener = host
                .inner
                .transports
                .listen(&addr)
                .await
                .map_err(|source| HostError::Listen {
                    addr: addr.clone(),
                    source,
                })?;
            host.start_listener(listener);
        }
        tracing::info!(peer = %host.peer_id(), "host started");
        Ok(host)
    }

    pub fn downgrade(&self) -> WeakHost {
        WeakHost(Arc::downgrade(&self.inner))
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.keypair.peer_id()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.inner.keypair
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Currently bound listen addresses.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        let addrs = self
            .inner
            .listen_addrs
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        addrs.iter().map(|(_, a)| a.clone()).collect()
    }

    /// Listen addresses with `/p2p/<own id>` appended.
    pub fn p2p_addrs(&self) -> Vec<Multiaddr> {
        let me = self.peer_id();
        self.addrs()
            .into_iter()
            .filter_map(|a| a.with_p2p(me).ok())
            .collect()
    }

    pub fn set_stream_handler<H: StreamHandler>(
        &self,
        protocol: &str,
        handler: H,
    ) -> Result<(), HostError> {
        self.set_stream_handler_with(protocol, handler, HandlerOptions::default())
    }

    pub fn set_stream_handler_with<H: StreamHandler>(
        &self,
        protocol: &str,
        handler: H,
        options: HandlerOptions,
    ) -> Result<(), HostError> {
        if self.is_closed() {
            return Err(HostError::Closed);
        }
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(protocol) {
            return Err(HostError::DuplicateProtocol(protocol.to_string()));
        }
        handlers.insert(
            protocol.to_string(),
            HandlerEntry {
                handler: Arc::new(handler),
                options,
            },
        );
        Ok(())
    }

    /// Returns whether a handler was registered.
    pub fn remove_stream_handler(&self, protocol: &str) -> bool {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(protocol)
            .is_some()
    }

    /// Call `hook` whenever a peer loses its last connection to this host.
    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: Fn(&ConnectionInfo) + Send + Sync + 'static,
    {
        self.inner
            .disconnect_hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    /// Connect to `addr`, or reuse a live connection when the address names a known peer.
    pub async fn dial(&self, addr: &Multiaddr) -> Result<Connection, HostError> {
        if self.is_closed() {
            return Err(HostError::Closed);
        }
        let expected = addr.peer_id();
        if expected == Some(self.peer_id()) {
            return Err(HostError::DialSelf);
        }
        if let Some(conn) = expected.and_then(|p| self.inner.live_connection(&p)) {
            return Ok(conn);
        }
        let io = self.inner.transports.dial(addr).await?;
        let channel = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            handshake_outbound(io, &self.inner.keypair, expected),
        )
        .await
        .map_err(|_| HostError::HandshakeTimeout)??;
        let conn = self.add_connection(channel, Direction::Outbound, addr.without_p2p())?;
        Ok(conn)
    }

    /// Open a stream to `peer` over an existing connection.
    pub async fn new_stream(&self, peer: PeerId, protocol: &str) -> Result<Stream, HostError> {
        let conn = self
            .inner
            .live_connection(&peer)
            .ok_or(HostError::NotConnected(peer))?;
        Ok(conn.open_stream(protocol).await?)
    }

    pub fn connection(&self, peer: &PeerId) -> Option<Connection> {
        self.inner.live_connection(peer)
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .conns()
            .values()
            .filter(|c| !c.is_closed())
            .cloned()
            .collect()
    }

    /// Close the connection to `peer`. Its streams are reset; other connections are untouched.
    pub fn close_connection(&self, peer: &PeerId) -> bool {
        let removed = self.inner.conns().remove(peer);
        match removed {
            Some(conn) => {
                tracing::debug!(peer = %peer, "closing connection");
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Shut the host down: stop dispatching, stop listeners, close every connection and
    /// wait for all tasks. No handler runs after this returns.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        // waits out any dispatch currently holding the read lock
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let conns: Vec<Connection> = self.inner.conns().drain().map(|(_, c)| c).collect();
        futures::future::join_all(conns.iter().map(|c| c.muxer.shutdown(CLOSE_GRACE))).await;
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::info!(peer = %self.peer_id(), "host closed");
    }

    /// Run `task` on the host's tracker. It is dropped when the host closes, and
    /// [`Host::close`] waits for it.
    pub(crate) fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.inner.cancel.clone();
        self.inner.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = task => {}
            }
        });
    }

    fn start_listener(&self, mut listener: Box<dyn Listener>) {
        let id = self.inner.next_id();
        let local = listener.local_addr();
        self.inner
            .listen_addrs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, local.clone()));
        tracing::info!(addr = %local, "listening");

        let weak = self.downgrade();
        let cancel = self.inner.cancel.clone();
        self.inner.tracker.spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((io, remote)) => {
                        let Some(host) = weak.upgrade() else { break };
                        host.spawn_inbound(io, remote);
                    }
                    Err(TransportError::ListenerClosed) => break,
                    Err(e) => {
                        tracing::warn!(addr = %local, error = %e, "accept failed");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                }
            }
            drop(listener);
            if let Some(host) = weak.upgrade() {
                host.inner
                    .listen_addrs
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(l, _)| *l != id);
            }
            tracing::debug!(addr = %local, "listener stopped");
        });
    }

    fn spawn_inbound(&self, io: BoxedIo, remote: Multiaddr) {
        let host = self.clone();
        self.inner.tracker.spawn(async move {
            let handshake = tokio::time::timeout(
                HANDSHAKE_TIMEOUT,
                handshake_inbound(io, &host.inner.keypair),
            );
            let channel = tokio::select! {
                _ = host.inner.cancel.cancelled() => return,
                result = handshake => result,
            };
            match channel {
                Ok(Ok(channel)) => {
                    if let Err(e) = host.add_connection(channel, Direction::Inbound, remote) {
                        tracing::debug!(error = %e, "dropping inbound connection");
                    }
                }
                Ok(Err(e)) => tracing::debug!(%remote, error = %e, "inbound handshake failed"),
                Err(_) => tracing::debug!(%remote, "inbound handshake timed out"),
            }
        });
    }

    fn add_connection(
        &self,
        channel: SecureChannel,
        direction: Direction,
        remote_addr: Multiaddr,
    ) -> Result<Connection, HostError> {
        let info = ConnectionInfo {
            id: self.inner.next_id(),
            remote_peer: channel.remote_peer,
            remote_addr,
            direction,
            opened_at: SystemTime::now(),
        };
        let muxer = Muxer::new(
            channel.reader,
            channel.writer,
            direction,
            self.inner.mux_config.clone(),
            self.dispatcher(info.clone()),
        );
        let conn = Connection {
            info: info.clone(),
            muxer: muxer.clone(),
        };
        {
            let mut conns = self.inner.conns();
            if self.is_closed() {
                drop(conns);
                muxer.close();
                return Err(HostError::Closed);
            }
            conns.insert(info.remote_peer, conn.clone());
        }
        tracing::info!(
            peer = %info.remote_peer,
            addr = %info.remote_addr,
            ?direction,
            "connection established"
        );

        let weak = self.downgrade();
        let cancel = self.inner.cancel.clone();
        self.inner.tracker.spawn(async move {
            tokio::select! {
                _ = muxer.closed() => {}
                _ = cancel.cancelled() => muxer.shutdown(CLOSE_GRACE).await,
            }
            tracing::info!(peer = %info.remote_peer, "connection closed");
            if let Some(host) = weak.upgrade() {
                let replaced = {
                    let mut conns = host.inner.conns();
                    match conns.get(&info.remote_peer) {
                        Some(c) if c.info.id == info.id => {
                            conns.remove(&info.remote_peer);
                            false
                        }
                        Some(c) => !c.is_closed(),
                        None => false,
                    }
                };
                if !replaced {
                    let hooks = host
                        .inner
                        .disconnect_hooks
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    for hook in hooks {
                        hook(&info);
                    }
                }
            }
        });
        Ok(conn)
    }

    fn dispatcher(&self, info: ConnectionInfo) -> IncomingStreamHandler {
        let weak = self.downgrade();
        let counters: Mutex<HashMap<String, Arc<AtomicUsize>>> = Mutex::new(HashMap::new());
        Arc::new(move |stream: Stream| {
            let Some(host) = weak.upgrade() else {
                stream.reset_with(ResetCode::ConnectionClosed);
                return;
            };
            let handlers = host
                .inner
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if host.is_closed() {
                stream.reset_with(ResetCode::ConnectionClosed);
                return;
            }
            let Some(entry) = handlers.get(stream.protocol()) else {
                tracing::debug!(
                    peer = %info.remote_peer,
                    protocol = stream.protocol(),
                    "no handler for protocol"
                );
                stream.reset_with(ResetCode::ProtocolUnsupported);
                return;
            };
            let counter = counters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(stream.protocol().to_string())
                .or_default()
                .clone();
            let Some(slot) = InboundSlot::acquire(&counter, entry.options.max_inbound_streams)
            else {
                tracing::debug!(
                    peer = %info.remote_peer,
                    protocol = stream.protocol(),
                    "inbound stream limit reached"
                );
                stream.reset_with(ResetCode::TooManyStreams);
                return;
            };
            if stream.accept().is_err() {
                return;
            }
            let stream = stream.with_slot(slot);
            let handler = entry.handler.clone();
            let info = info.clone();
            host.inner
                .tracker
                .spawn(async move { handler.handle(stream, info).await });
        })
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("peer_id", &self.peer_id())
            .field("addrs", &self.addrs())
            .finish()
    }
}
