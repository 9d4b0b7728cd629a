//! Stream multiplexer over a secure channel.
//!
//! One reader task decodes frames and routes them to streams; one writer task drains a
//! queue of outgoing frames. A slow stream never blocks the reader: data is buffered per
//! stream, bounded by that stream's receive window.

pub mod frame;
pub mod stream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::secure::{SecureReader, SecureWriter};
pub use frame::{Frame, ResetCode, StreamId, INITIAL_WINDOW};
pub use stream::{Stream, StreamStat};
use stream::StreamShared;

/// Which side opened a connection or stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Per-stream receive window. Never below [`INITIAL_WINDOW`].
    pub receive_window: u32,
    /// Largest payload of a single data frame.
    pub max_data_frame: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            receive_window: INITIAL_WINDOW,
            max_data_frame: 16 * 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("stream reset: {0}")]
    Reset(ResetCode),
    #[error("remote does not support protocol {0}")]
    UnsupportedProtocol(String),
    #[error("stream IDs exhausted on this connection")]
    StreamIdsExhausted,
    #[error("write side already closed")]
    WriteClosed,
    #[error("peer stopped reading")]
    StoppedByPeer,
    #[error("frame encoding: {0}")]
    Encode(#[from] bincode::Error),
}

impl MuxError {
    pub(crate) fn from_reset(code: ResetCode) -> Self {
        match code {
            ResetCode::ConnectionClosed => MuxError::ConnectionClosed,
            other => MuxError::Reset(other),
        }
    }
}

/// Called from the reader task for every stream the remote opens. Must not block.
pub type IncomingStreamHandler = Arc<dyn Fn(Stream) + Send + Sync>;

pub(crate) struct ConnShared {
    streams: Mutex<HashMap<StreamId, Arc<StreamShared>>>,
    closed: AtomicBool,
    next_id: AtomicU64,
    out: mpsc::UnboundedSender<Frame>,
    config: MuxConfig,
}

impl ConnShared {
    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<StreamId, Arc<StreamShared>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, id: StreamId) -> Option<Arc<StreamShared>> {
        self.table().get(&id).cloned()
    }

    fn insert(&self, stream: Arc<StreamShared>) -> Result<(), MuxError> {
        let mut table = self.table();
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::ConnectionClosed);
        }
        table.insert(stream.id, stream);
        Ok(())
    }

    pub(crate) fn remove(&self, id: StreamId) {
        self.table().remove(&id);
    }

    fn next_local_id(&self) -> Result<StreamId, MuxError> {
        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        StreamId::try_from(id).map_err(|_| MuxError::StreamIdsExhausted)
    }

    fn new_stream(
        self: &Arc<Self>,
        id: StreamId,
        protocol: String,
        dir: Direction,
    ) -> Arc<StreamShared> {
        StreamShared::new(
            id,
            protocol,
            dir,
            self.config.receive_window.max(INITIAL_WINDOW),
            self.config.max_data_frame,
            self.out.clone(),
            Arc::downgrade(self),
        )
    }

    /// Mark the connection closed and reset every stream on it, without sending frames.
    fn reset_all(&self) {
        let drained: Vec<_> = {
            let mut table = self.table();
            self.closed.store(true, Ordering::Release);
            table.drain().map(|(_, s)| s).collect()
        };
        for stream in drained {
            stream.on_reset(ResetCode::ConnectionClosed);
        }
    }
}

/// Handle to one multiplexed connection. Cheap to clone.
#[derive(Clone)]
pub struct Muxer {
    shared: Arc<ConnShared>,
    cancel: CancellationToken,
}

impl Muxer {
    /// Start the reader and writer tasks. `direction` is the side that dialed the
    /// connection: outbound uses odd stream IDs, inbound even.
    pub fn new(
        reader: SecureReader,
        writer: SecureWriter,
        direction: Direction,
        config: MuxConfig,
        on_incoming: IncomingStreamHandler,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let first_id = match direction {
            Direction::Outbound => 1,
            Direction::Inbound => 2,
        };
        let shared = Arc::new(ConnShared {
            streams: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(first_id),
            out: tx,
            config,
        });
        let cancel = CancellationToken::new();
        tokio::spawn(write_loop(writer, rx, cancel.clone()));
        tokio::spawn(read_loop(
            reader,
            shared.clone(),
            direction,
            on_incoming,
            cancel.clone(),
        ));
        Muxer { shared, cancel }
    }

    /// Open a stream and wait for the remote to accept it.
    pub async fn open_stream(&self, protocol: &str) -> Result<Stream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::ConnectionClosed);
        }
        let id = self.shared.next_local_id()?;
        let shared = self
            .shared
            .new_stream(id, protocol.to_string(), Direction::Outbound);
        let (reply_tx, reply_rx) = oneshot::channel();
        shared.lock().open_reply = Some(reply_tx);
        self.shared.insert(shared.clone())?;
        let stream = Stream::new(shared.clone());
        self.send(Frame::Open {
            id,
            protocol: protocol.to_string(),
        })?;
        if let Some(grant) = shared.extra_credit() {
            self.send(grant)?;
        }
        match reply_rx.await {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(ResetCode::ProtocolUnsupported)) => {
                Err(MuxError::UnsupportedProtocol(protocol.to_string()))
            }
            Ok(Err(code)) => Err(MuxError::from_reset(code)),
            Err(_) => Err(MuxError::ConnectionClosed),
        }
    }

    fn send(&self, frame: Frame) -> Result<(), MuxError> {
        self.shared
            .out
            .send(frame)
            .map_err(|_| MuxError::ConnectionClosed)
    }

    pub fn stream_count(&self) -> usize {
        self.shared.table().len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    /// Tell the remote we are going away and reset every local stream. The writer
    /// finishes once the goodbye is flushed.
    pub fn close(&self) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.send(Frame::GoAway);
        self.shared.reset_all();
    }

    /// [`close`](Self::close), then wait up to `grace` for the I/O tasks to stop before
    /// abandoning the connection.
    pub async fn shutdown(&self, grace: Duration) {
        self.close();
        if tokio::time::timeout(grace, self.closed()).await.is_err() {
            tracing::debug!("muxer did not drain in time; aborting");
        }
        self.cancel.cancel();
    }

    /// Resolves once both I/O tasks are winding down.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

async fn write_loop(
    mut writer: SecureWriter,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let going_away = matches!(frame, Frame::GoAway);
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unencodable frame");
                continue;
            }
        };
        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = writer.send(&bytes) => sent,
        };
        if let Err(e) = sent {
            tracing::debug!(error = %e, "connection write failed");
            break;
        }
        if going_away {
            let _ = writer.shutdown().await;
            break;
        }
    }
    cancel.cancel();
}

async fn read_loop(
    mut reader: SecureReader,
    conn: Arc<ConnShared>,
    direction: Direction,
    on_incoming: IncomingStreamHandler,
    cancel: CancellationToken,
) {
    // the dialer opens odd IDs, the listener even ones
    let remote_parity = match direction {
        Direction::Outbound => 0,
        Direction::Inbound => 1,
    };
    let mut last_remote_id: StreamId = 0;
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = reader.recv() => msg,
        };
        let bytes = match msg {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::debug!("connection closed by remote");
                break;
            }
            Err(e) => {
                tracing::debug!(error = %e, "connection read failed");
                break;
            }
        };
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "malformed frame; closing connection");
                break;
            }
        };
        match frame {
            Frame::GoAway => {
                tracing::debug!("remote is going away");
                break;
            }
            Frame::Open { id, protocol } => {
                if id % 2 != remote_parity || id <= last_remote_id {
                    let _ = conn.out.send(Frame::Reset {
                        id,
                        code: ResetCode::ProtocolViolation,
                    });
                    continue;
                }
                last_remote_id = id;
                tracing::trace!(stream = id, %protocol, "inbound stream");
                let shared = conn.new_stream(id, protocol, Direction::Inbound);
                if conn.insert(shared.clone()).is_err() {
                    break;
                }
                on_incoming(Stream::new(shared));
            }
            Frame::Accept { id } => {
                if let Some(s) = conn.get(id) {
                    s.on_accept();
                }
            }
            Frame::Data { id, payload } => {
                if let Some(s) = conn.get(id) {
                    s.on_data(payload);
                }
            }
            Frame::WindowUpdate { id, credit } => {
                if let Some(s) = conn.get(id) {
                    s.on_window_update(credit);
                }
            }
            Frame::Fin { id } => {
                if let Some(s) = conn.get(id) {
                    s.on_fin();
                }
            }
            Frame::StopSending { id } => {
                if let Some(s) = conn.get(id) {
                    s.on_stop_sending();
                }
            }
            Frame::Reset { id, code } => {
                if let Some(s) = conn.get(id) {
                    tracing::trace!(stream = id, %code, "stream reset by remote");
                    s.on_reset(code);
                }
            }
        }
    }
    conn.reset_all();
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::secure::{handshake_inbound, handshake_outbound};
    use tokio::time::timeout;

    type Inbox = mpsc::UnboundedReceiver<Stream>;

    fn collector() -> (IncomingStreamHandler, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: IncomingStreamHandler = Arc::new(move |s: Stream| {
            let _ = tx.send(s);
        });
        (handler, rx)
    }

    async fn pair() -> (Muxer, Inbox, Muxer, Inbox) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let ka = Keypair::random().unwrap();
        let kb = Keypair::random().unwrap();
        let (ca, cb) = tokio::join!(
            handshake_outbound(Box::new(a), &ka, Some(kb.peer_id())),
            handshake_inbound(Box::new(b), &kb)
        );
        let (ca, cb) = (ca.unwrap(), cb.unwrap());
        let (ha, ra) = collector();
        let (hb, rb) = collector();
        let ma = Muxer::new(ca.reader, ca.writer, Direction::Outbound, MuxConfig::default(), ha);
        let mb = Muxer::new(cb.reader, cb.writer, Direction::Inbound, MuxConfig::default(), hb);
        (ma, ra, mb, rb)
    }

    async fn open_accepted(opener: &Muxer, inbox: &mut Inbox, protocol: &str) -> (Stream, Stream) {
        let open = opener.open_stream(protocol);
        let accept = async {
            let s = inbox.recv().await.unwrap();
            s.accept().unwrap();
            s
        };
        let (local, remote) = tokio::join!(open, accept);
        (local.unwrap(), remote)
    }

    #[tokio::test]
    async fn request_response_with_half_close() {
        let (a, _ra, _b, mut rb) = pair().await;
        let (client, server) = open_accepted(&a, &mut rb, "/echo/1").await;
        assert_eq!(server.protocol(), "/echo/1");
        assert_eq!(server.direction(), Direction::Inbound);
        assert_eq!(client.direction(), Direction::Outbound);

        client.write_all(b"hello").await.unwrap();
        client.close_write().unwrap();
        assert_eq!(server.read_to_end().await.unwrap(), b"hello");

        server.write_all(b"world").await.unwrap();
        server.close_write().unwrap();
        assert_eq!(client.read_to_end().await.unwrap(), b"world");

        assert!(client.stat().closed_at.is_some());
        assert!(server.stat().closed_at.is_some());
        assert!(client.stat().opened_at <= client.stat().closed_at.unwrap());
    }

    #[tokio::test]
    async fn unsupported_protocol_is_reported() {
        let (a, _ra, _b, mut rb) = pair().await;
        let reject = async {
            let s = rb.recv().await.unwrap();
            s.reset_with(ResetCode::ProtocolUnsupported);
        };
        let (opened, ()) = tokio::join!(a.open_stream("/nope/1"), reject);
        match opened {
            Err(MuxError::UnsupportedProtocol(p)) => assert_eq!(p, "/nope/1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_ids_follow_parity() {
        let (a, mut ra, b, mut rb) = pair().await;
        let (s1, _r1) = open_accepted(&a, &mut rb, "/p").await;
        let (s2, _r2) = open_accepted(&a, &mut rb, "/p").await;
        let (s3, _r3) = open_accepted(&b, &mut ra, "/p").await;
        assert_eq!((s1.id(), s2.id(), s3.id()), (1, 3, 2));
    }

    #[tokio::test]
    async fn exhausted_ids_fail() {
        let (a, _ra, _b, _rb) = pair().await;
        a.shared
            .next_id
            .store(u64::from(u32::MAX) + 1, Ordering::Relaxed);
        assert!(matches!(
            a.open_stream("/p").await,
            Err(MuxError::StreamIdsExhausted)
        ));
    }

    #[tokio::test]
    async fn large_transfer_respects_window() {
        let (a, _ra, _b, mut rb) = pair().await;
        let (client, server) = open_accepted(&a, &mut rb, "/bulk").await;
        let data: Vec<u8> = (0..(1024 * 1024)).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();
        let writer = async move {
            client.write_all(&data).await.unwrap();
            client.close_write().unwrap();
            client
        };
        let (_client, received) = tokio::join!(writer, server.read_to_end());
        assert_eq!(received.unwrap(), expected);
    }

    #[tokio::test]
    async fn stalled_stream_does_not_block_siblings() {
        let (a, _ra, _b, mut rb) = pair().await;
        let (stalled, _unread) = open_accepted(&a, &mut rb, "/slow").await;
        let (fast, fast_remote) = open_accepted(&a, &mut rb, "/fast").await;

        // fill the stalled stream's whole window; nobody reads it
        stalled
            .write_all(&vec![0u8; INITIAL_WINDOW as usize])
            .await
            .unwrap();

        fast.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        let n = timeout(Duration::from_secs(5), fast_remote.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn dropped_stream_resets_remote() {
        let (a, _ra, _b, mut rb) = pair().await;
        let (client, server) = open_accepted(&a, &mut rb, "/p").await;
        drop(client);
        let mut buf = [0u8; 8];
        assert!(matches!(
            server.read(&mut buf).await,
            Err(MuxError::Reset(ResetCode::Cancel))
        ));
    }

    #[tokio::test]
    async fn close_read_stops_remote_writer() {
        let (a, _ra, _b, mut rb) = pair().await;
        let (client, server) = open_accepted(&a, &mut rb, "/p").await;
        client.close_read().unwrap();
        let outcome = timeout(Duration::from_secs(5), async {
            loop {
                match server.write(b"x").await {
                    Ok(_) => tokio::task::yield_now().await,
                    Err(e) => return e,
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(outcome, MuxError::StoppedByPeer));
    }

    #[tokio::test]
    async fn closing_connection_resets_its_streams() {
        let (a, _ra, b, mut rb) = pair().await;
        let (client, server) = open_accepted(&a, &mut rb, "/p").await;
        a.close();
        assert!(a.is_closed());
        assert!(matches!(
            client.write(b"x").await,
            Err(MuxError::ConnectionClosed)
        ));
        let mut buf = [0u8; 1];
        assert!(matches!(
            server.read(&mut buf).await,
            Err(MuxError::ConnectionClosed)
        ));
        timeout(Duration::from_secs(5), b.closed()).await.unwrap();
        assert!(matches!(
            a.open_stream("/p").await,
            Err(MuxError::ConnectionClosed)
        ));
    }
}
