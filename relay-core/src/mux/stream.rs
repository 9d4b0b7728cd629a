//! A logical stream inside a multiplexed connection.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;

use tokio::sync::{mpsc, oneshot, Notify};

use super::frame::{Frame, ResetCode, StreamId, INITIAL_WINDOW};
use super::{ConnShared, Direction, MuxError};

/// Lifecycle timestamps of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStat {
    pub direction: Direction,
    pub opened_at: SystemTime,
    pub closed_at: Option<SystemTime>,
}

#[derive(Default)]
pub(crate) struct StreamState {
    recv_buf: VecDeque<Vec<u8>>,
    /// Offset into the front chunk of `recv_buf`.
    recv_offset: usize,
    /// Bytes the peer may still send before it needs more credit.
    recv_remaining: u32,
    /// Bytes consumed but not yet returned to the peer as credit.
    recv_unacked: u32,
    send_credit: u32,
    /// Remote sent FIN.
    read_closed: bool,
    /// We sent STOP_SENDING.
    read_stopped: bool,
    /// We sent FIN.
    write_closed: bool,
    /// Remote sent STOP_SENDING.
    write_stopped: bool,
    reset: Option<ResetCode>,
    closed_at: Option<SystemTime>,
    pub(crate) open_reply: Option<oneshot::Sender<Result<(), ResetCode>>>,
}

impl StreamState {
    fn read_done(&self) -> bool {
        self.read_closed || self.read_stopped
    }

    fn write_done(&self) -> bool {
        self.write_closed || self.write_stopped
    }

    fn finished(&self) -> bool {
        self.reset.is_some() || (self.read_done() && self.write_done())
    }
}

pub(crate) struct StreamShared {
    pub(crate) id: StreamId,
    protocol: String,
    direction: Direction,
    opened_at: SystemTime,
    window: u32,
    max_data_frame: usize,
    state: Mutex<StreamState>,
    readable: Notify,
    writable: Notify,
    out: mpsc::UnboundedSender<Frame>,
    conn: Weak<ConnShared>,
}

impl StreamShared {
    pub(crate) fn new(
        id: StreamId,
        protocol: String,
        direction: Direction,
        window: u32,
        max_data_frame: usize,
        out: mpsc::UnboundedSender<Frame>,
        conn: Weak<ConnShared>,
    ) -> Arc<Self> {
        let state = StreamState {
            recv_remaining: window,
            send_credit: INITIAL_WINDOW,
            ..StreamState::default()
        };
        Arc::new(StreamShared {
            id,
            protocol,
            direction,
            opened_at: SystemTime::now(),
            window,
            max_data_frame: max_data_frame.max(1),
            state: Mutex::new(state),
            readable: Notify::new(),
            writable: Notify::new(),
            out,
            conn,
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, frame: Frame) -> Result<(), MuxError> {
        self.out.send(frame).map_err(|_| MuxError::ConnectionClosed)
    }

    /// Credit beyond the initial window, granted right after open/accept.
    pub(crate) fn extra_credit(&self) -> Option<Frame> {
        (self.window > INITIAL_WINDOW).then(|| Frame::WindowUpdate {
            id: self.id,
            credit: self.window - INITIAL_WINDOW,
        })
    }

    fn wake_all(&self) {
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Record the close time once and drop the stream from its connection's table.
    fn finish_if_done(&self, state: &mut StreamState) -> bool {
        if state.finished() && state.closed_at.is_none() {
            state.closed_at = Some(SystemTime::now());
            return true;
        }
        false
    }

    fn unregister(&self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.remove(self.id);
        }
    }

    fn after_update(&self, mut state: MutexGuard<'_, StreamState>) {
        let done = self.finish_if_done(&mut state);
        drop(state);
        self.wake_all();
        if done {
            self.unregister();
        }
    }

    // ---- frames from the remote side (called by the connection reader) ----

    pub(crate) fn on_data(&self, payload: Vec<u8>) {
        let mut state = self.lock();
        if state.reset.is_some() || state.read_stopped {
            return;
        }
        if state.read_closed {
            drop(state);
            self.reset_with(ResetCode::ProtocolViolation);
            return;
        }
        let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        if len > state.recv_remaining {
            drop(state);
            tracing::debug!(stream = self.id, "peer overran receive window");
            self.reset_with(ResetCode::FlowControl);
            return;
        }
        state.recv_remaining -= len;
        if !payload.is_empty() {
            state.recv_buf.push_back(payload);
        }
        drop(state);
        self.readable.notify_waiters();
    }

    pub(crate) fn on_window_update(&self, credit: u32) {
        let mut state = self.lock();
        state.send_credit = state.send_credit.saturating_add(credit);
        drop(state);
        self.writable.notify_waiters();
    }

    pub(crate) fn on_fin(&self) {
        let mut state = self.lock();
        state.read_closed = true;
        self.after_update(state);
    }

    pub(crate) fn on_stop_sending(&self) {
        let mut state = self.lock();
        state.write_stopped = true;
        self.after_update(state);
    }

    pub(crate) fn on_accept(&self) {
        if let Some(reply) = self.lock().open_reply.take() {
            let _ = reply.send(Ok(()));
        }
    }

    /// Remote reset, or local teardown of the whole connection. Sends nothing.
    pub(crate) fn on_reset(&self, code: ResetCode) {
        let mut state = self.lock();
        if state.reset.is_some() {
            return;
        }
        state.reset = Some(code);
        state.recv_buf.clear();
        if let Some(reply) = state.open_reply.take() {
            let _ = reply.send(Err(code));
        }
        self.after_update(state);
    }

    // ---- local operations ----

    /// Abort the stream and tell the peer.
    pub(crate) fn reset_with(&self, code: ResetCode) {
        {
            let state = self.lock();
            if state.reset.is_some() || state.closed_at.is_some() {
                return;
            }
        }
        let _ = self.send(Frame::Reset { id: self.id, code });
        self.on_reset(code);
    }

    fn accept(&self) -> Result<(), MuxError> {
        self.send(Frame::Accept { id: self.id })?;
        if let Some(grant) = self.extra_credit() {
            self.send(grant)?;
        }
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, MuxError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.readable.notified();
            {
                let mut state = self.lock();
                if let Some(code) = state.reset {
                    return Err(MuxError::from_reset(code));
                }
                if !state.recv_buf.is_empty() {
                    let n = copy_out(&mut state, buf);
                    self.consumed(&mut state, n);
                    return Ok(n);
                }
                if state.read_done() {
                    return Ok(0);
                }
            }
            notified.await;
        }
    }

    /// Return consumed bytes to the peer as credit once enough has accumulated.
    fn consumed(&self, state: &mut StreamState, n: usize) {
        state.recv_unacked = state
            .recv_unacked
            .saturating_add(u32::try_from(n).unwrap_or(u32::MAX));
        if state.read_done() || state.recv_unacked < self.window / 4 {
            return;
        }
        let credit = std::mem::take(&mut state.recv_unacked);
        state.recv_remaining = state.recv_remaining.saturating_add(credit);
        let _ = self.send(Frame::WindowUpdate {
            id: self.id,
            credit,
        });
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, MuxError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.writable.notified();
            {
                let mut state = self.lock();
                if let Some(code) = state.reset {
                    return Err(MuxError::from_reset(code));
                }
                if state.write_closed {
                    return Err(MuxError::WriteClosed);
                }
                if state.write_stopped {
                    return Err(MuxError::StoppedByPeer);
                }
                if state.send_credit > 0 {
                    let n = buf
                        .len()
                        .min(self.max_data_frame)
                        .min(state.send_credit as usize);
                    state.send_credit -= n as u32;
                    // queued under the lock so frames keep the order of their writes
                    self.send(Frame::Data {
                        id: self.id,
                        payload: buf[..n].to_vec(),
                    })?;
                    return Ok(n);
                }
            }
            notified.await;
        }
    }

    fn close_write(&self) -> Result<(), MuxError> {
        let mut state = self.lock();
        if let Some(code) = state.reset {
            return Err(MuxError::from_reset(code));
        }
        if state.write_done() {
            return Ok(());
        }
        state.write_closed = true;
        let sent = self.send(Frame::Fin { id: self.id });
        self.after_update(state);
        sent
    }

    fn close_read(&self) -> Result<(), MuxError> {
        let mut state = self.lock();
        if let Some(code) = state.reset {
            return Err(MuxError::from_reset(code));
        }
        if state.read_done() {
            return Ok(());
        }
        state.read_stopped = true;
        state.recv_buf.clear();
        state.recv_offset = 0;
        let sent = self.send(Frame::StopSending { id: self.id });
        self.after_update(state);
        sent
    }
}

fn copy_out(state: &mut StreamState, buf: &mut [u8]) -> usize {
    let mut written = 0;
    while written < buf.len() {
        let Some(front) = state.recv_buf.front() else {
            break;
        };
        let available = &front[state.recv_offset..];
        let n = available.len().min(buf.len() - written);
        buf[written..written + n].copy_from_slice(&available[..n]);
        written += n;
        state.recv_offset += n;
        if state.recv_offset == front.len() {
            state.recv_buf.pop_front();
            state.recv_offset = 0;
        }
    }
    written
}

/// A bidirectional, flow-controlled stream tagged with a protocol.
///
/// All operations take `&self` so one task can read while another writes. Dropping a
/// stream whose write side is still open resets it; dropping one that has only its
/// read side open sends STOP_SENDING.
pub struct Stream {
    shared: Arc<StreamShared>,
    _slot: Option<Box<dyn Send + Sync>>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>) -> Self {
        Stream {
            shared,
            _slot: None,
        }
    }

    /// Keep `slot` alive for as long as the stream handle exists.
    pub(crate) fn with_slot(mut self, slot: impl Send + Sync + 'static) -> Self {
        self._slot = Some(Box::new(slot));
        self
    }

    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    pub fn protocol(&self) -> &str {
        &self.shared.protocol
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn stat(&self) -> StreamStat {
        StreamStat {
            direction: self.shared.direction,
            opened_at: self.shared.opened_at,
            closed_at: self.shared.lock().closed_at,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed_at.is_some()
    }

    /// Confirm an inbound stream to the opener.
    pub fn accept(&self) -> Result<(), MuxError> {
        self.shared.accept()
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` means the remote finished writing.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, MuxError> {
        self.shared.read(buf).await
    }

    pub async fn read_to_end(&self) -> Result<Vec<u8>, MuxError> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Write some prefix of `buf`, waiting for send credit if necessary.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, MuxError> {
        self.shared.write(buf).await
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> Result<(), MuxError> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Half-close: send FIN. Reading remains possible.
    pub fn close_write(&self) -> Result<(), MuxError> {
        self.shared.close_write()
    }

    /// Stop reading: tell the peer to stop sending and discard buffered input.
    pub fn close_read(&self) -> Result<(), MuxError> {
        self.shared.close_read()
    }

    pub fn close(&self) -> Result<(), MuxError> {
        self.close_write()?;
        self.close_read()
    }

    pub fn reset(&self) {
        self.shared.reset_with(ResetCode::Cancel);
    }

    pub(crate) fn reset_with(&self, code: ResetCode) {
        self.shared.reset_with(code);
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let (write_open, read_open) = {
            let state = self.shared.lock();
            if state.closed_at.is_some() {
                return;
            }
            (!state.write_done(), !state.read_done())
        };
        if write_open {
            self.shared.reset_with(ResetCode::Cancel);
        } else if read_open {
            let _ = self.shared.close_read();
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("protocol", &self.shared.protocol)
            .field("direction", &self.shared.direction)
            .finish()
    }
}
