//! Authenticated, encrypted channel over a raw transport connection.
//!
//! Handshake: the dialer sends its hello first, the listener answers. A hello carries the
//! protocol version, the sender's identity key, a fresh X25519 key and an identity
//! signature over that X25519 key. Each side derives one ChaCha20-Poly1305 key per
//! direction from the X25519 shared secret. Nonces are per-direction counters and are
//! never reused.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{ReadHalf, WriteHalf};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::identity::{Keypair, PeerId, PublicKey};
use crate::protocol::PROTOCOL_VERSION;
use crate::transport::BoxedIo;
use crate::wire::{self, MAX_FRAME_LEN};

const HANDSHAKE_DOMAIN: &[u8] = b"relay-handshake-v1:";
const MAX_HELLO_LEN: u32 = 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    version: u8,
    identity: PublicKey,
    ephemeral: [u8; 32],
    signature: Vec<u8>,
}

impl Hello {
    fn new(keypair: &Keypair, ephemeral: &X25519PublicKey) -> Self {
        Hello {
            version: PROTOCOL_VERSION,
            identity: keypair.public_key().clone(),
            ephemeral: ephemeral.to_bytes(),
            signature: keypair.sign(&signed_payload(ephemeral.as_bytes())).to_vec(),
        }
    }
}

fn signed_payload(ephemeral: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HANDSHAKE_DOMAIN.len() + 32);
    out.extend_from_slice(HANDSHAKE_DOMAIN);
    out.extend_from_slice(ephemeral);
    out
}

/// Which end of the handshake we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

/// One direction of an established channel: its own key and message counter.
struct DirectionCipher {
    aead: ChaCha20Poly1305,
    counter: u64,
}

impl DirectionCipher {
    /// Key for the `label` direction, bound to this handshake's shared secret.
    fn new(shared_secret: &[u8; 32], label: &[u8]) -> Self {
        let key: [u8; 32] = Sha256::new()
            .chain_update(b"relay-session-v1")
            .chain_update(label)
            .chain_update(shared_secret)
            .finalize()
            .into();
        Self {
            aead: ChaCha20Poly1305::new(&Key::from(key)),
            counter: 0,
        }
    }

    /// Nonce for the current message; fails once the counter would wrap.
    fn next_nonce(&mut self) -> std::io::Result<Nonce> {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self.counter.checked_add(1).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "nonce space exhausted")
        })?;
        Ok(Nonce::from(nonce))
    }

    fn seal(&mut self, plain: &[u8]) -> std::io::Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        self.aead
            .encrypt(&nonce, plain)
            .map_err(|_| invalid_data("encryption failed"))
    }

    /// Messages must arrive in order: the counter is the only nonce source.
    fn open(&mut self, sealed: &[u8]) -> std::io::Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        self.aead
            .decrypt(&nonce, sealed)
            .map_err(|_| invalid_data("message failed authentication"))
    }
}

fn invalid_data(msg: &'static str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed during handshake")]
    Closed,
    #[error("malformed hello: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("invalid identity signature")]
    BadSignature,
    #[error("expected peer {expected}, remote is {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },
    #[error("refusing connection to self")]
    SelfConnection,
}

/// Receiving half of an established channel.
pub struct SecureReader {
    io: ReadHalf<BoxedIo>,
    cipher: DirectionCipher,
}

impl SecureReader {
    /// Next decrypted message. `Ok(None)` on clean EOF.
    pub async fn recv(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        match wire::read_raw_frame(&mut self.io, MAX_FRAME_LEN).await? {
            Some(sealed) => self.cipher.open(&sealed).map(Some),
            None => Ok(None),
        }
    }
}

/// Sending half of an established channel.
pub struct SecureWriter {
    io: WriteHalf<BoxedIo>,
    cipher: DirectionCipher,
}

impl SecureWriter {
    pub async fn send(&mut self, plain: &[u8]) -> std::io::Result<()> {
        let sealed = self.cipher.seal(plain)?;
        wire::write_raw_frame(&mut self.io, &sealed).await
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.io.shutdown().await
    }
}

/// Result of a successful handshake.
pub struct SecureChannel {
    pub reader: SecureReader,
    pub writer: SecureWriter,
    pub remote_key: PublicKey,
    pub remote_peer: PeerId,
}

/// Dialer side. Fails if `expected` is set and the remote proves a different identity.
pub async fn handshake_outbound(
    io: BoxedIo,
    keypair: &Keypair,
    expected: Option<PeerId>,
) -> Result<SecureChannel, HandshakeError> {
    let channel = handshake(io, keypair, Role::Initiator).await?;
    if let Some(expected) = expected {
        if expected != channel.remote_peer {
            return Err(HandshakeError::PeerIdMismatch {
                expected,
                actual: channel.remote_peer,
            });
        }
    }
    Ok(channel)
}

/// Listener side.
pub async fn handshake_inbound(
    io: BoxedIo,
    keypair: &Keypair,
) -> Result<SecureChannel, HandshakeError> {
    handshake(io, keypair, Role::Responder).await
}

async fn handshake(
    io: BoxedIo,
    keypair: &Keypair,
    role: Role,
) -> Result<SecureChannel, HandshakeError> {
    let (mut r, mut w) = tokio::io::split(io);
    let secret = StaticSecret::random_from_rng(OsRng);
    let ephemeral = X25519PublicKey::from(&secret);
    let ours = bincode::serialize(&Hello::new(keypair, &ephemeral))?;

    let theirs = match role {
        Role::Initiator => {
            wire::write_raw_frame(&mut w, &ours).await?;
            read_hello(&mut r).await?
        }
        Role::Responder => {
            let theirs = read_hello(&mut r).await?;
            wire::write_raw_frame(&mut w, &ours).await?;
            theirs
        }
    };

    if theirs.version != PROTOCOL_VERSION {
        return Err(HandshakeError::Version(theirs.version));
    }
    if !theirs
        .identity
        .verify(&signed_payload(&theirs.ephemeral), &theirs.signature)
    {
        return Err(HandshakeError::BadSignature);
    }
    let remote_peer = theirs.identity.peer_id();
    if remote_peer == keypair.peer_id() {
        return Err(HandshakeError::SelfConnection);
    }

    let shared = secret
        .diffie_hellman(&X25519PublicKey::from(theirs.ephemeral))
        .to_bytes();
    let (send_label, recv_label): (&[u8], &[u8]) = match role {
        Role::Initiator => (b"initiator->responder", b"responder->initiator"),
        Role::Responder => (b"responder->initiator", b"initiator->responder"),
    };

    Ok(SecureChannel {
        reader: SecureReader {
            io: r,
            cipher: DirectionCipher::new(&shared, recv_label),
        },
        writer: SecureWriter {
            io: w,
            cipher: DirectionCipher::new(&shared, send_label),
        },
        remote_key: theirs.identity,
        remote_peer,
    })
}

async fn read_hello(r: &mut ReadHalf<BoxedIo>) -> Result<Hello, HandshakeError> {
    let body = wire::read_raw_frame(r, MAX_HELLO_LEN)
        .await?
        .ok_or(HandshakeError::Closed)?;
    Ok(bincode::deserialize(&body)?)
}
