//! Multiplexer frames. Each frame is one bincode message on the secure channel.

use serde::{Deserialize, Serialize};

pub type StreamId = u32;

/// Credit every stream starts with in each direction, before any `WindowUpdate`.
pub const INITIAL_WINDOW: u32 = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Open a stream speaking `protocol`.
    Open { id: StreamId, protocol: String },
    /// The receiver has a handler for the opened stream.
    Accept { id: StreamId },
    Data { id: StreamId, payload: Vec<u8> },
    /// Grant the sender `credit` more bytes.
    WindowUpdate { id: StreamId, credit: u32 },
    /// Sender will write no more.
    Fin { id: StreamId },
    /// Sender will read no more; the receiver should stop writing.
    StopSending { id: StreamId },
    /// Abort the stream in both directions.
    Reset { id: StreamId, code: ResetCode },
    /// Sender is closing the connection.
    GoAway,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResetCode {
    Cancel,
    ProtocolUnsupported,
    TooManyStreams,
    FlowControl,
    ConnectionClosed,
    ProtocolViolation,
}

impl std::fmt::Display for ResetCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResetCode::Cancel => "cancelled",
            ResetCode::ProtocolUnsupported => "protocol unsupported",
            ResetCode::TooManyStreams => "too many streams",
            ResetCode::FlowControl => "flow control violation",
            ResetCode::ConnectionClosed => "connection closed",
            ResetCode::ProtocolViolation => "protocol violation",
        };
        f.write_str(s)
    }
}

impl Frame {
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Frame::Open { id, .. }
            | Frame::Accept { id }
            | Frame::Data { id, .. }
            | Frame::WindowUpdate { id, .. }
            | Frame::Fin { id }
            | Frame::StopSending { id }
            | Frame::Reset { id, .. } => Some(*id),
            Frame::GoAway => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
