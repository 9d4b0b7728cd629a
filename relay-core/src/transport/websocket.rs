//! WebSocket-over-TCP transport: `/<host>/tcp/<port>/ws`.
//!
//! Binary WebSocket messages carry the byte stream; [`WsIo`] adapts a
//! `WebSocketStream` to `AsyncRead`/`AsyncWrite` so the layers above stay
//! transport-agnostic. Upgrades of inbound connections run on a background task so
//! one slow client cannot stall the accept loop.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use super::{tcp, BoxedIo, Listener, Transport, TransportError, ACCEPT_BACKOFF};
use crate::multiaddr::{Multiaddr, Protocol};

const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKLOG: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        WsTransport
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<BoxedIo, TransportError> {
        let (host, port) = addr
            .tcp_host_port()
            .ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;
        let stream = tcp::connect(addr, true).await?;
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };
        let url = format!("ws://{host}:{port}/");
        let (ws, _response) = tokio_tungstenite::client_async(url, stream)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        Ok(Box::new(WsIo::new(ws)))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>, TransportError> {
        let listener = tcp::bind(addr).await?;
        let local = Multiaddr::from_tcp(listener.local_addr()?)
            .with(Protocol::Ws)
            .map_err(|_| TransportError::UnsupportedAddress(addr.clone()))?;
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let task = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        if tx.send(Err(TransportError::Io(e))).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let upgraded =
                        tokio::time::timeout(UPGRADE_TIMEOUT, tokio_tungstenite::accept_async(stream))
                            .await;
                    match upgraded {
                        Ok(Ok(ws)) => {
                            let remote = Multiaddr::from_tcp(remote);
                            let remote = remote.clone().with(Protocol::Ws).unwrap_or(remote);
                            let io: BoxedIo = Box::new(WsIo::new(ws));
                            let _ = tx.send(Ok((io, remote))).await;
                        }
                        Ok(Err(e)) => tracing::debug!(%remote, error = %e, "websocket upgrade failed"),
                        Err(_) => tracing::debug!(%remote, "websocket upgrade timed out"),
                    }
                });
            }
        });
        Ok(Box::new(WsAcceptor { rx, local, task }))
    }
}

type Accepted = Result<(BoxedIo, Multiaddr), TransportError>;

struct WsAcceptor {
    rx: mpsc::Receiver<Accepted>,
    local: Multiaddr,
    task: JoinHandle<()>,
}

impl Drop for WsAcceptor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl Listener for WsAcceptor {
    fn local_addr(&self) -> Multiaddr {
        self.local.clone()
    }

    async fn accept(&mut self) -> Result<(BoxedIo, Multiaddr), TransportError> {
        self.rx.recv().await.unwrap_or(Err(TransportError::ListenerClosed))
    }
}

/// Byte-stream view of a WebSocket connection.
pub struct WsIo<S> {
    inner: WebSocketStream<S>,
    pending: Bytes,
    eof: bool,
}

impl<S> WsIo<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            eof: false,
        }
    }
}

fn to_io(e: WsError) -> io::Error {
    match e {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, e)
        }
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl<S> AsyncRead for WsIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.inner.poll_next_unpin(cx)) {
                Some(Ok(Message::Binary(data))) => this.pending = data,
                Some(Ok(Message::Close(_))) | None => this.eof = true,
                // ping/pong are answered by tungstenite; text frames are not part of the stream
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed)) => this.eof = true,
                Some(Err(e)) => return Poll::Ready(Err(to_io(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.inner.poll_ready_unpin(cx)).map_err(to_io)?;
        this.inner
            .start_send_unpin(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(to_io)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().inner.poll_flush_unpin(cx).map_err(to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(self.get_mut().inner.poll_close_unpin(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(to_io(e))),
        }
    }
}
