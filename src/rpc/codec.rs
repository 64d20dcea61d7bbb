//! Line framing for the wire.
//!
//! Each [`Frame`](super::frame::Frame) travels as one line of JSON. Sealed
//! payloads are base64 text, so a frame never contains a raw `\n`. The
//! engine's reader and writer tasks both wrap their socket half in
//! [`FrameCodec`]; a line over [`MAX_FRAME_BYTES`] is a framing error and
//! the reader drops the connection.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Longest line the reader will buffer (1 MiB).
pub const MAX_FRAME_BYTES: usize = 1_048_576;

/// `\n`-delimited UTF-8 codec with a [`MAX_FRAME_BYTES`] cap on reads.
///
/// Writes are not capped; the limit only bounds what a peer can make us
/// hold in memory.
#[derive(Debug)]
pub struct FrameCodec(LinesCodec);

impl FrameCodec {
    /// Codec capped at [`MAX_FRAME_BYTES`].
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_FRAME_BYTES))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

/// Overlong lines are the peer's fault; everything else is the socket's.
fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::MalformedFrame(format!("line too long: exceeded {MAX_FRAME_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
