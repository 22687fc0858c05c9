//! Length-delimited JSON frames

use bytes::Bytes;
use kite_core::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::LengthDelimitedCodec;

/// Largest accepted frame
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Four-byte big-endian length prefix, bounded by [`MAX_FRAME_LENGTH`]
#[must_use]
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(frame)?)
}
