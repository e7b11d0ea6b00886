//! Multiplexed stdout/stderr wire format of the attach channel
//!
//! Every frame starts with an 8-byte header: byte 0 is the stream kind
//! (1 = stdout, 2 = stderr), bytes 1-3 are reserved and bytes 4-7 carry the
//! payload length as a big-endian `u32`. Bytes that cannot be parsed as frames
//! are passed through unmodified as [`StreamKind::Raw`].

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tokio_util::codec::Decoder;

/// Length of a frame header in bytes
pub const HEADER_LEN: usize = 8;

/// Origin of a chunk of output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// Unframed bytes passed through verbatim
    Raw,
}

impl StreamKind {
    /// Map a header kind byte to a stream, `None` for kinds that are skipped
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(StreamKind::Stdout),
            2 => Some(StreamKind::Stderr),
            _ => None,
        }
    }

    fn wire_byte(self) -> Option<u8> {
        match self {
            StreamKind::Stdout => Some(1),
            StreamKind::Stderr => Some(2),
            StreamKind::Raw => None,
        }
    }
}

/// One decoded piece of program output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub kind: StreamKind,
    pub payload: Bytes,
}

impl OutputChunk {
    pub fn new(kind: StreamKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn raw(payload: impl Into<Bytes>) -> Self {
        Self::new(StreamKind::Raw, payload)
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Encode one frame. Raw chunks are returned without a header.
pub fn encode_frame(kind: StreamKind, payload: &[u8]) -> Bytes {
    let Some(kind_byte) = kind.wire_byte() else {
        return Bytes::copy_from_slice(payload);
    };
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&[kind_byte, 0, 0, 0]);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf.freeze()
}

fn payload_len(header: &[u8]) -> usize {
    u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize
}

/// Decode a complete buffer left to right.
///
/// Parsing stops at the first incomplete header or at a header whose declared
/// length runs past the end of the buffer; everything from there on is
/// appended verbatim as a raw trailer. This never fails.
pub fn decode(raw: &[u8]) -> Vec<OutputChunk> {
    let mut chunks = Vec::new();
    let mut cursor = 0;

    while raw.len() - cursor >= HEADER_LEN {
        let header = &raw[cursor..cursor + HEADER_LEN];
        let body_start = cursor + HEADER_LEN;
        let len = payload_len(header);
        if len > raw.len() - body_start {
            break;
        }

        if let Some(kind) = StreamKind::from_wire(header[0]) {
            chunks.push(OutputChunk::new(
                kind,
                Bytes::copy_from_slice(&raw[body_start..body_start + len]),
            ));
        }
        cursor = body_start + len;
    }

    if cursor < raw.len() {
        chunks.push(OutputChunk::raw(Bytes::copy_from_slice(&raw[cursor..])));
    }
    chunks
}

/// Decode a buffer and concatenate every payload into text
pub fn decode_text(raw: &[u8]) -> String {
    decode(raw).iter().map(|chunk| chunk.text()).collect()
}

/// Output split by origin; raw trailers count as stdout
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Demuxed {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

pub fn demux(chunks: &[OutputChunk]) -> Demuxed {
    let mut out = Demuxed::default();
    for chunk in chunks {
        match chunk.kind {
            StreamKind::Stderr => out.stderr.extend_from_slice(&chunk.payload),
            StreamKind::Stdout | StreamKind::Raw => out.stdout.extend_from_slice(&chunk.payload),
        }
    }
    out
}

/// Streaming decoder for attach channels whose reads do not line up with frames.
///
/// Waits for complete frames while the buffered bytes look like a frame. A
/// header with non-zero reserved bytes or an oversized length switches the
/// decoder to raw passthrough for the rest of the stream (TTY output has no
/// framing). Leftover bytes at end of stream are flushed through [`decode`].
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame_len: usize,
    raw_mode: bool,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            raw_mode: false,
        }
    }

    /// Whether the stream has been classified as unframed
    pub fn is_raw(&self) -> bool {
        self.raw_mode
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024)
    }
}

impl Decoder for FrameDecoder {
    type Item = OutputChunk;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.is_empty() {
                return Ok(None);
            }
            if self.raw_mode {
                return Ok(Some(OutputChunk::raw(src.split().freeze())));
            }

            let reserved_end = src.len().min(4);
            if src[1.min(reserved_end)..reserved_end].iter().any(|b| *b != 0) {
                self.raw_mode = true;
                continue;
            }
            if src.len() < HEADER_LEN {
                return Ok(None);
            }

            let kind_byte = src[0];
            let len = payload_len(&src[..HEADER_LEN]);
            if len > self.max_frame_len {
                self.raw_mode = true;
                continue;
            }
            if src.len() < HEADER_LEN + len {
                src.reserve(HEADER_LEN + len - src.len());
                return Ok(None);
            }

            src.advance(HEADER_LEN);
            let payload = src.split_to(len).freeze();
            if let Some(kind) = StreamKind::from_wire(kind_byte) {
                return Ok(Some(OutputChunk::new(kind, payload)));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(chunk) = self.decode(src)? {
            return Ok(Some(chunk));
        }
        if src.is_empty() {
            Ok(None)
        } else {
            Ok(Some(OutputChunk::raw(src.split().freeze())))
        }
    }
}
