//! Codecs for queue payloads and live-connection frames.
//!
//! Queue payloads are MessagePack-encoded; live frames are JSON text.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::frames::{ClientFrame, ServerFrame};

/// Maximum encoded payload size (256 KiB), the largest message a topic or
/// queue accepts.
pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024;

/// Errors raised while encoding or decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("Payload size {0} exceeds maximum {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a queue payload.
///
/// # Errors
///
/// Returns an error if the value is too large or encoding fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(value)?;

    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Decode a queue payload.
///
/// # Errors
///
/// Returns an error if the data is too large or is not a valid encoding of `T`.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(data.len()));
    }
    Ok(rmp_serde::from_slice(data)?)
}

/// Encode a frame for the live connection.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_frame(frame: &ServerFrame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a client frame, enforcing a size limit.
///
/// # Errors
///
/// Returns an error if the text is larger than `max_size` or not a known frame.
pub fn decode_frame(text: &str, max_size: usize) -> Result<ClientFrame, ProtocolError> {
    if text.len() > max_size {
        return Err(ProtocolError::PayloadTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}
