//! Peer identity: keypairs, peer ID derivation, signatures.

use std::fmt;
use std::str::FromStr;

use data_encoding::BASE32_NOPAD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Only key size currently supported for Ed25519 identities.
pub const ED25519_KEY_BITS: u32 = 256;

/// Length of a detached signature.
pub const SIGNATURE_LEN: usize = 64;

/// Asymmetric key algorithm backing a peer identity.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    Ed25519,
}

impl KeyType {
    fn tag(self) -> u8 {
        match self {
            KeyType::Ed25519 => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(KeyType::Ed25519),
            _ => None,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Ed25519 => f.write_str("ed25519"),
        }
    }
}

impl FromStr for KeyType {
    type Err = KeyGenerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ed25519" => Ok(KeyType::Ed25519),
            other => Err(KeyGenerationError::UnsupportedKeyType(other.to_string())),
        }
    }
}

/// Public half of an identity key, tagged with its algorithm.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    key_type: KeyType,
    #[serde(with = "bytes_32")]
    bytes: [u8; 32],
}

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Canonical encoding: one tag byte followed by the raw key bytes.
    /// This is what the peer ID hashes.
    pub fn encode(&self) -> [u8; 33] {
        let mut out = [0u8; 33];
        out[0] = self.key_type.tag();
        out[1..].copy_from_slice(&self.bytes);
        out
    }

    /// Inverse of [`PublicKey::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, KeyDecodeError> {
        if bytes.len() != 33 {
            return Err(KeyDecodeError::Length(bytes.len()));
        }
        let key_type = KeyType::from_tag(bytes[0]).ok_or(KeyDecodeError::UnknownTag(bytes[0]))?;
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&bytes[1..]);
        VerifyingKey::from_bytes(&raw).map_err(|_| KeyDecodeError::InvalidPoint)?;
        Ok(Self {
            key_type,
            bytes: raw,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(self)
    }

    /// Verify a detached signature over `msg`. Malformed keys or signatures verify as false.
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let Ok(sig) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
            return false;
        };
        key.verify(msg, &Signature::from_bytes(&sig)).is_ok()
    }
}

/// Peer ID: SHA-256 of the encoded public key. Stable for the lifetime of the key.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "bytes_32")] [u8; 32]);

impl PeerId {
    pub fn from_public_key(public: &PublicKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public.encode());
        PeerId(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(10);
        s
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE32_NOPAD.encode(&self.0).to_ascii_lowercase())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = PeerIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = BASE32_NOPAD
            .decode(s.to_ascii_uppercase().as_bytes())
            .map_err(|e| PeerIdParseError::Encoding(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|v: Vec<u8>| PeerIdParseError::Length(v.len()))?;
        Ok(PeerId(bytes))
    }
}

/// Identity keypair. The secret half never leaves this struct.
pub struct Keypair {
    secret: SigningKey,
    public: PublicKey,
    peer_id: PeerId,
}

impl Keypair {
    /// Generate a keypair from `rng`. Deterministic for a deterministic `rng`.
    pub fn generate<R: RngCore + CryptoRng>(
        key_type: KeyType,
        bits: u32,
        rng: &mut R,
    ) -> Result<Self, KeyGenerationError> {
        match key_type {
            KeyType::Ed25519 if bits == ED25519_KEY_BITS => {}
            KeyType::Ed25519 => {
                return Err(KeyGenerationError::UnsupportedKeySize { key_type, bits });
            }
        }
        let mut seed = [0u8; 32];
        rng.try_fill_bytes(&mut seed)
            .map_err(|e| KeyGenerationError::Entropy(e.to_string()))?;
        let secret = SigningKey::from_bytes(&seed);
        let public = PublicKey {
            key_type,
            bytes: secret.verifying_key().to_bytes(),
        };
        let peer_id = PeerId::from_public_key(&public);
        Ok(Self {
            secret,
            public,
            peer_id,
        })
    }

    /// Fresh Ed25519 keypair from the OS random source.
    pub fn random() -> Result<Self, KeyGenerationError> {
        Self::generate(KeyType::Ed25519, ED25519_KEY_BITS, &mut OsRng)
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.secret.sign(msg).to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyGenerationError {
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),
    #[error("unsupported key size {bits} for {key_type}")]
    UnsupportedKeySize { key_type: KeyType, bits: u32 },
    #[error("random source failed: {0}")]
    Entropy(String),
}

#[derive(Debug, thiserror::Error)]
pub enum KeyDecodeError {
    #[error("expected 33 bytes, got {0}")]
    Length(usize),
    #[error("unknown key type tag {0}")]
    UnknownTag(u8),
    #[error("invalid public key")]
    InvalidPoint,
}

#[derive(Debug, thiserror::Error)]
pub enum PeerIdParseError {
    #[error("invalid peer id encoding: {0}")]
    Encoding(String),
    #[error("peer id must be 32 bytes, got {0}")]
    Length(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct FailingRng;

    impl RngCore for FailingRng {
        fn next_u32(&mut self) -> u32 {
            0
        }
        fn next_u64(&mut self) -> u64 {
            0
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0)
        }
        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand::Error> {
            Err(rand::Error::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no entropy",
            )))
        }
    }

    impl CryptoRng for FailingRng {}

    #[test]
    fn keypair_peer_id_derivation() {
        let kp = Keypair::random().unwrap();
        assert_eq!(PeerId::from_public_key(kp.public_key()), kp.peer_id());
        assert_eq!(kp.public_key().peer_id(), kp.peer_id());
    }

    #[test]
    fn generation_is_deterministic_for_seeded_rng() {
        let a = Keypair::generate(KeyType::Ed25519, 256, &mut StdRng::seed_from_u64(7)).unwrap();
        let b = Keypair::generate(KeyType::Ed25519, 256, &mut StdRng::seed_from_u64(7)).unwrap();
        let c = Keypair::generate(KeyType::Ed25519, 256, &mut StdRng::seed_from_u64(8)).unwrap();
        assert_eq!(a.peer_id(), b.peer_id());
        assert_ne!(a.peer_id(), c.peer_id());
    }

    #[test]
    fn unsupported_size_rejected() {
        let err = Keypair::generate(KeyType::Ed25519, 2048, &mut OsRng).unwrap_err();
        assert!(matches!(
            err,
            KeyGenerationError::UnsupportedKeySize { bits: 2048, .. }
        ));
    }

    #[test]
    fn unsupported_type_rejected() {
        assert!(matches!(
            "rsa".parse::<KeyType>(),
            Err(KeyGenerationError::UnsupportedKeyType(_))
        ));
        assert_eq!("Ed25519".parse::<KeyType>().unwrap(), KeyType::Ed25519);
    }

    #[test]
    fn entropy_failure_reported() {
        let err = Keypair::generate(KeyType::Ed25519, 256, &mut FailingRng).unwrap_err();
        assert!(matches!(err, KeyGenerationError::Entropy(_)));
    }

    #[test]
    fn sign_and_verify() {
        let kp = Keypair::random().unwrap();
        let sig = kp.sign(b"hello relay");
        assert!(kp.public_key().verify(b"hello relay", &sig));
        assert!(!kp.public_key().verify(b"tampered", &sig));
        assert!(!kp.public_key().verify(b"hello relay", &sig[..10]));
    }

    #[test]
    fn peer_id_text_roundtrip() {
        let id = Keypair::random().unwrap().peer_id();
        let text = id.to_string();
        assert_eq!(text, text.to_ascii_lowercase());
        assert_eq!(text.parse::<PeerId>().unwrap(), id);
        assert!("not-base32!".parse::<PeerId>().is_err());
    }

    #[test]
    fn public_key_encoding_roundtrip() {
        let kp = Keypair::random().unwrap();
        let enc = kp.public_key().encode();
        assert_eq!(&PublicKey::decode(&enc).unwrap(), kp.public_key());
        assert!(matches!(
            PublicKey::decode(&enc[..5]),
            Err(KeyDecodeError::Length(5))
        ));
    }

    #[test]
    fn debug_redacts_secret() {
        let kp = Keypair::random().unwrap();
        let dbg = format!("{kp:?}");
        assert!(dbg.contains("<redacted>"));
    }
}
