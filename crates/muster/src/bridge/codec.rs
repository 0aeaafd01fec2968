//! Framed codec for coordinator-worker communication.
//!
//! Uses LinesCodec for framing + serde_json for serialization: each
//! message is one JSON object terminated by a newline. Works over any
//! AsyncRead/AsyncWrite and tolerates partial reads and several frames
//! arriving in one read.
//!
//! A frame that is not valid JSON for the expected message type is
//! logged and skipped inside `decode` - FramedRead treats any decoder
//! error as terminal, and a bad frame must never cost the connection.
//! Only a failure of the underlying stream surfaces as an error.

use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Upper bound on a single frame. Frames carry artifact reports and raw
/// run logs, so this is generous; anything larger is discarded up to
/// the next delimiter rather than buffered without bound.
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame exceeds maximum length")]
    Oversized,
}

impl From<LinesCodecError> for FrameError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => Self::Oversized,
            LinesCodecError::Io(e) => Self::Io(e),
        }
    }
}

/// Codec that frames messages with a newline delimiter and serializes
/// with JSON.
///
/// Wraps LinesCodec and adds serde_json serialization. serde_json never
/// emits a raw newline inside a document, so the delimiter is
/// unambiguous.
pub struct JsonLinesCodec<T> {
    inner: LinesCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_FRAME_LEN),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = T;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src) {
                Ok(Some(line)) => match serde_json::from_str(&line) {
                    Ok(item) => return Ok(Some(item)),
                    Err(err) => {
                        tracing::warn!(error = %err, "skipping malformed frame");
                    }
                },
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    tracing::warn!(limit = MAX_FRAME_LEN, "skipping oversized frame");
                }
                Err(LinesCodecError::Io(err)) => return Err(FrameError::Io(err)),
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)?;
        tracing::trace!(frame_size_bytes = json.len(), "encoding frame");
        self.inner.encode(json, dst).map_err(FrameError::from)
    }
}
