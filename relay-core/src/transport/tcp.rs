//! Plain TCP transport: `/<host>/tcp/<port>`.

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use super::{BoxedIo, Listener, Transport, TransportError};
use crate::multiaddr::Multiaddr;

#[derive(Debug, Clone)]
pub struct TcpTransport {
    nodelay: bool,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Connect a TCP socket to the host/port prefix of `addr`.
pub(crate) async fn connect(addr: &Multiaddr, nodelay: bool) -> Result<TcpStream, TransportError> {
    let (host, port) = addr
        .tcp_host_port()
        .ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;
    let stream = TcpStream::connect((host.as_str(), port)).await?;
    stream.set_nodelay(nodelay)?;
    Ok(stream)
}

/// Bind a TCP listener on the IP/port prefix of `addr`. Names are not resolved for binding.
pub(crate) async fn bind(addr: &Multiaddr) -> Result<TcpListener, TransportError> {
    let socket = addr
        .tcp_socket_addr()
        .ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;
    Ok(TcpListener::bind(socket).await?)
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<BoxedIo, TransportError> {
        Ok(Box::new(connect(addr, self.nodelay).await?))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>, TransportError> {
        let listener = bind(addr).await?;
        let local = Multiaddr::from_tcp(listener.local_addr()?);
        Ok(Box::new(TcpAcceptor {
            listener,
            local,
            nodelay: self.nodelay,
        }))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
    local: Multiaddr,
    nodelay: bool,
}

#[async_trait]
impl Listener for TcpAcceptor {
    fn local_addr(&self) -> Multiaddr {
        self.local.clone()
    }

    async fn accept(&mut self) -> Result<(BoxedIo, Multiaddr), TransportError> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(self.nodelay)?;
        Ok((Box::new(stream), Multiaddr::from_tcp(remote)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiaddr::Protocol;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn listen_on_ephemeral_port_reports_bound_port() {
        let t = TcpTransport::new();
        let listener = t.listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap()).await.unwrap();
        let local = listener.local_addr();
        let port = local
            .iter()
            .find_map(|p| match p {
                Protocol::Tcp(port) => Some(*port),
                _ => None,
            })
            .unwrap();
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn dial_and_accept() {
        let t = TcpTransport::new();
        let mut listener = t.listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap()).await.unwrap();
        let target = listener.local_addr();
        let (dialed, accepted) = tokio::join!(t.dial(&target), listener.accept());
        let mut client = dialed.unwrap();
        let (mut server, remote) = accepted.unwrap();
        assert!(remote.tcp_socket_addr().is_some());
        client.write_all(b"over tcp").await.unwrap();
        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over tcp");
    }

    #[tokio::test]
    async fn cannot_bind_dns_name() {
        let t = TcpTransport::new();
        let err = t
            .listen(&"/dns4/localhost/tcp/0".parse().unwrap())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::UnsupportedAddress(_)));
    }
}
