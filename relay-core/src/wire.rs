//! Message framing shared by the secure channel, the muxer and the relay protocols:
//! a 4-byte little-endian body length, then the bincode body.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Serialize `msg` behind a length header. The header is back-filled once the body
/// size is known.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = vec![0u8; LEN_SIZE];
    bincode::serialize_into(&mut out, msg)?;
    let body = u32::try_from(out.len() - LEN_SIZE)
        .ok()
        .filter(|&n| n <= MAX_FRAME_LEN)
        .ok_or(FrameEncodeError::TooLarge)?;
    out[..LEN_SIZE].copy_from_slice(&body.to_le_bytes());
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode the frame at the front of `bytes`, returning the message and how many bytes it
/// took. [`FrameDecodeError::NeedMore`] means the buffer holds only part of a frame.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    let (header, rest) = bytes
        .split_first_chunk::<LEN_SIZE>()
        .ok_or(FrameDecodeError::NeedMore)?;
    let len = u32::from_le_bytes(*header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let body = rest
        .get(..len as usize)
        .ok_or(FrameDecodeError::NeedMore)?;
    Ok((bincode::deserialize(body)?, LEN_SIZE + body.len()))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Read one raw length-prefixed frame body. `Ok(None)` on clean EOF before the length prefix.
pub async fn read_raw_frame<R>(reader: &mut R, max_len: u32) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > max_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit of {max_len}"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one raw length-prefixed frame body and flush.
pub async fn write_raw_frame<W>(writer: &mut W, body: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "frame too large",
        ));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Read and decode one bincode message. `Ok(None)` on clean EOF.
pub async fn read_frame<T, R>(reader: &mut R) -> std::io::Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin + ?Sized,
{
    let Some(body) = read_raw_frame(reader, MAX_FRAME_LEN).await? else {
        return Ok(None);
    };
    bincode::deserialize(&body)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Encode and write one bincode message.
pub async fn write_frame<T, W>(writer: &mut W, msg: &T) -> std::io::Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin + ?Sized,
{
    let body = bincode::serialize(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    write_raw_frame(writer, &body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HopMessage, StatusCode};

    fn sample_status() -> HopMessage {
        HopMessage::Status {
            code: StatusCode::ResourceLimitExceeded,
            reservation: None,
            limit: None,
        }
    }

    #[test]
    fn roundtrip_status() {
        let msg = sample_status();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n): (HopMessage, usize) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_status()).unwrap();
        assert!(matches!(
            decode_frame::<HopMessage>(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame::<HopMessage>(&frame[..super::LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_length_rejected() {
        let mut bytes = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_frame::<HopMessage>(&bytes),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn multiple_messages() {
        let a = HopMessage::Reserve;
        let b = sample_status();
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1): (HopMessage, usize) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2): (HopMessage, usize) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(m1, HopMessage::Reserve);
        assert_eq!(m2, b);
    }

    #[tokio::test]
    async fn async_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &HopMessage::Reserve).await.unwrap();
        write_frame(&mut a, &sample_status()).await.unwrap();
        drop(a);
        let first: Option<HopMessage> = read_frame(&mut b).await.unwrap();
        let second: Option<HopMessage> = read_frame(&mut b).await.unwrap();
        let eof: Option<HopMessage> = read_frame(&mut b).await.unwrap();
        assert_eq!(first, Some(HopMessage::Reserve));
        assert_eq!(second, Some(sample_status()));
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn async_read_rejects_over_limit() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_raw_frame(&mut a, &[7u8; 64]).await.unwrap();
        let err = read_raw_frame(&mut b, 16).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
