//! Framed codec for bus traffic.
//!
//! Every message is a 4-byte little-endian length prefix followed by a
//! bincode payload (fixed-width little-endian integers, length-prefixed
//! strings and maps). The codec is pure: it moves bytes between serde values
//! and a receive buffer, and never touches a descriptor.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Upper bound on a single frame. A length prefix above this is treated as
/// stream corruption, not as a request to allocate.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Serialize `value` into a complete frame (prefix + payload).
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = encode_payload(value)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(Error::failed(format!(
            "frame payload of {} bytes exceeds limit",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    frame.put_u32_le(payload.len() as u32);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Try to decode one complete frame from the front of `buf`.
///
/// Returns `Ok(None)` and leaves the buffer untouched while the frame is
/// still partial. A corrupt length prefix is an `Io` error: the stream can
/// no longer be trusted and the caller must drop the connection.
pub fn decode_frame<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>> {
    if buf.len() < LENGTH_PREFIX_BYTES {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit"),
        )));
    }
    if buf.len() < LENGTH_PREFIX_BYTES + len {
        return Ok(None);
    }
    buf.advance(LENGTH_PREFIX_BYTES);
    let payload = buf.split_to(len);
    let value = bincode::deserialize(&payload).map_err(|e| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame payload did not decode: {e}"),
        ))
    })?;
    Ok(Some(value))
}

/// Bincode-encode a bare payload (no frame prefix). Used for argument and
/// return-value blocks nested inside an envelope.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::failed(format!("encode failed: {e}")))
}

/// Decode a bare payload produced by [`encode_payload`].
///
/// Failures map to `InvalidArgs`: the frame itself was sound, the caller
/// just sent something the callee does not understand.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::invalid_args(e.to_string()))
}
