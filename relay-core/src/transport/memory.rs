//! In-process transport: `/memory/<port>`.
//!
//! Listeners register on a [`MemoryHub`] that the caller creates and shares between
//! hosts; there is no process-wide registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::{BoxedIo, Listener, Transport, TransportError};
use crate::multiaddr::{Multiaddr, Protocol};

const PIPE_CAPACITY: usize = 64 * 1024;
const ACCEPT_BACKLOG: usize = 64;

type Incoming = (DuplexStream, u64);

#[derive(Default)]
struct HubInner {
    listeners: HashMap<u64, mpsc::Sender<Incoming>>,
    next_port: u64,
}

impl HubInner {
    fn allocate_port(&mut self) -> u64 {
        loop {
            self.next_port = self.next_port.wrapping_add(1).max(1);
            if !self.listeners.contains_key(&self.next_port) {
                return self.next_port;
            }
        }
    }
}

/// Shared rendezvous point for memory listeners and dialers.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HubInner) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
}

impl MemoryTransport {
    pub fn new(hub: MemoryHub) -> Self {
        Self { hub }
    }
}

fn memory_port(addr: &Multiaddr) -> Result<u64, TransportError> {
    match addr.iter().collect::<Vec<_>>().as_slice() {
        [Protocol::Memory(port)] => Ok(*port),
        _ => Err(TransportError::UnsupportedAddress(addr.clone())),
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<BoxedIo, TransportError> {
        let port = memory_port(addr)?;
        let (sender, from) = self.hub.with(|hub| {
            let sender = hub.listeners.get(&port).cloned();
            (sender, hub.allocate_port())
        });
        let sender = sender.ok_or_else(|| TransportError::ConnectionRefused(addr.clone()))?;
        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        sender
            .send((theirs, from))
            .await
            .map_err(|_| TransportError::ConnectionRefused(addr.clone()))?;
        Ok(Box::new(ours))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>, TransportError> {
        let requested = memory_port(addr)?;
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let port = self.hub.with(|hub| {
            let port = if requested == 0 {
                hub.allocate_port()
            } else if hub.listeners.contains_key(&requested) {
                return Err(TransportError::AddressInUse(addr.clone()));
            } else {
                requested
            };
            hub.listeners.insert(port, tx);
            Ok(port)
        })?;
        Ok(Box::new(MemoryListener {
            port,
            rx,
            hub: self.hub.clone(),
        }))
    }
}

struct MemoryListener {
    port: u64,
    rx: mpsc::Receiver<Incoming>,
    hub: MemoryHub,
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let port = self.port;
        self.hub.with(|hub| hub.listeners.remove(&port));
    }
}

#[async_trait]
impl Listener for MemoryListener {
    fn local_addr(&self) -> Multiaddr {
        Multiaddr::memory(self.port)
    }

    async fn accept(&mut self) -> Result<(BoxedIo, Multiaddr), TransportError> {
        let (io, from) = self.rx.recv().await.ok_or(TransportError::ListenerClosed)?;
        Ok((Box::new(io), Multiaddr::memory(from)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_without_listener_is_refused() {
        let t = MemoryTransport::new(MemoryHub::new());
        let err = t.dial(&Multiaddr::memory(42)).await.err().unwrap();
        assert!(matches!(err, TransportError::ConnectionRefused(_)));
    }

    #[tokio::test]
    async fn port_conflict_and_release() {
        let hub = MemoryHub::new();
        let t = MemoryTransport::new(hub.clone());
        let first = t.listen(&Multiaddr::memory(5)).await.unwrap();
        assert!(matches!(
            t.listen(&Multiaddr::memory(5)).await.err().unwrap(),
            TransportError::AddressInUse(_)
        ));
        drop(first);
        assert!(t.listen(&Multiaddr::memory(5)).await.is_ok());
    }

    #[tokio::test]
    async fn separate_hubs_are_isolated() {
        let a = MemoryTransport::new(MemoryHub::new());
        let b = MemoryTransport::new(MemoryHub::new());
        let listener = a.listen(&Multiaddr::memory(0)).await.unwrap();
        assert!(b.dial(&listener.local_addr()).await.is_err());
    }

    #[tokio::test]
    async fn ephemeral_ports_are_distinct() {
        let t = MemoryTransport::new(MemoryHub::new());
        let a = t.listen(&Multiaddr::memory(0)).await.unwrap();
        let b = t.listen(&Multiaddr::memory(0)).await.unwrap();
        assert_ne!(a.local_addr(), b.local_addr());
    }
}
