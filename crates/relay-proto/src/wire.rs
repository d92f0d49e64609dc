// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Length-prefixed framing with two wire encodings.
//!
//! Wire format per frame:
//! ```text
//! [1 byte format: 0 = JSON, 1 = MessagePack][4 bytes BE length][payload]
//! ```
//!
//! A legacy variant without the format byte (JSON only) is accepted on
//! connections that opt in via [`FrameDecoder::set_legacy`] before the first
//! byte is consumed.
//!
//! [`FrameDecoder`] is a streaming parser: feed it arbitrary byte chunks and
//! it returns every fully-formed envelope in arrival order. Consumed bytes
//! are compacted out of the buffer once the read offset wraps past one
//! maximum frame, keeping the buffer bounded by `2 * max_frame + header`.

use serde::Serialize;

use crate::envelope::{Envelope, PROTOCOL_VERSION};
use crate::error::ProtoError;

/// Bytes of framing overhead per frame: format discriminator + length.
pub const FRAME_HEADER_BYTES: usize = 5;
/// Framing overhead of the legacy JSON-only variant.
pub const LEGACY_HEADER_BYTES: usize = 4;
/// Default maximum payload size (1 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

// ── Wire formats ──────────────────────────────────────────────────────────────

/// Per-frame payload encoding, discriminated by the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Json,
    Msgpack,
}

impl WireFormat {
    pub fn as_byte(self) -> u8 {
        match self {
            WireFormat::Json => 0,
            WireFormat::Msgpack => 1,
        }
    }

    pub fn from_byte(b: u8) -> Result<Self, ProtoError> {
        match b {
            0 => Ok(WireFormat::Json),
            1 => Ok(WireFormat::Msgpack),
            other => Err(ProtoError::UnknownFormat(other)),
        }
    }
}

// ── Payload codecs ────────────────────────────────────────────────────────────

fn encode_payload<T: Serialize>(value: &T, format: WireFormat) -> Result<Vec<u8>, ProtoError> {
    match format {
        WireFormat::Json => {
            serde_json::to_vec(value).map_err(|e| ProtoError::Codec(e.to_string()))
        }
        WireFormat::Msgpack => {
            let value =
                rmpv::ext::to_value(value).map_err(|e| ProtoError::Codec(e.to_string()))?;
            let mut buf = Vec::new();
            rmpv::encode::write_value(&mut buf, &value)
                .map_err(|e| ProtoError::Codec(e.to_string()))?;
            Ok(buf)
        }
    }
}

fn decode_payload(bytes: &[u8], format: WireFormat) -> Result<Envelope, ProtoError> {
    let env: Envelope = match format {
        WireFormat::Json => {
            serde_json::from_slice(bytes).map_err(|e| ProtoError::Codec(e.to_string()))?
        }
        WireFormat::Msgpack => {
            let mut cursor = std::io::Cursor::new(bytes);
            let value = rmpv::decode::read_value(&mut cursor)
                .map_err(|e| ProtoError::Codec(e.to_string()))?;
            rmpv::ext::from_value(value).map_err(|e| ProtoError::Codec(e.to_string()))?
        }
    };
    if env.v != PROTOCOL_VERSION {
        return Err(ProtoError::VersionMismatch {
            got: env.v,
            expected: PROTOCOL_VERSION,
        });
    }
    Ok(env)
}

// ── Frame encoders ────────────────────────────────────────────────────────────

/// Encode one envelope as a framed message in the given format.
pub fn encode_frame(env: &Envelope, format: WireFormat) -> Result<Vec<u8>, ProtoError> {
    encode_frame_with_limit(env, format, DEFAULT_MAX_FRAME_BYTES)
}

/// As [`encode_frame`], enforcing a caller-supplied payload limit.
pub fn encode_frame_with_limit(
    env: &Envelope,
    format: WireFormat,
    max_frame: usize,
) -> Result<Vec<u8>, ProtoError> {
    let payload = encode_payload(env, format)?;
    if payload.len() > max_frame {
        return Err(ProtoError::FrameTooLarge {
            len: payload.len(),
            max: max_frame,
        });
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
    frame.push(format.as_byte());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Encode one envelope in the legacy 4-byte-header JSON-only framing.
pub fn encode_frame_legacy(env: &Envelope) -> Result<Vec<u8>, ProtoError> {
    let payload = encode_payload(env, WireFormat::Json)?;
    if payload.len() > DEFAULT_MAX_FRAME_BYTES {
        return Err(ProtoError::FrameTooLarge {
            len: payload.len(),
            max: DEFAULT_MAX_FRAME_BYTES,
        });
    }
    let mut frame = Vec::with_capacity(LEGACY_HEADER_BYTES + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

// ── Streaming decoder ─────────────────────────────────────────────────────────

/// Ring-buffered streaming frame parser for one connection.
///
/// Holds at most `2 * max_frame + header` bytes of pending input; consumed
/// bytes are compacted out once the read offset passes one maximum frame so
/// the buffer never grows past that bound on a well-behaved stream.
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Read offset of the first unconsumed byte in `buf`.
    start: usize,
    max_frame: usize,
    legacy: bool,
    consumed_any: bool,
    /// Format of the most recently decoded frame; the daemon answers a peer
    /// in the format it last spoke.
    last_format: WireFormat,
}

impl FrameDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: Vec::with_capacity(2 * max_frame + FRAME_HEADER_BYTES),
            start: 0,
            max_frame,
            legacy: false,
            consumed_any: false,
            last_format: WireFormat::Json,
        }
    }

    /// Switch to the legacy 4-byte-header JSON-only framing. Only allowed
    /// before any byte has been consumed.
    pub fn set_legacy(&mut self, legacy: bool) -> Result<(), ProtoError> {
        if self.consumed_any || !self.buf.is_empty() {
            return Err(ProtoError::ModeChange);
        }
        self.legacy = legacy;
        Ok(())
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    pub fn last_format(&self) -> WireFormat {
        if self.legacy {
            WireFormat::Json
        } else {
            self.last_format
        }
    }

    /// Bytes currently buffered and not yet parsed into an envelope.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.start
    }

    fn header_len(&self) -> usize {
        if self.legacy {
            LEGACY_HEADER_BYTES
        } else {
            FRAME_HEADER_BYTES
        }
    }

    /// Append `bytes` and return every fully-formed envelope, in order.
    ///
    /// Any error leaves the decoder unusable: the stream is no longer aligned
    /// on a frame boundary and the connection must be closed.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Envelope>, ProtoError> {
        self.compact_if_needed(bytes.len());
        self.buf.extend_from_slice(bytes);
        self.consumed_any = self.consumed_any || !bytes.is_empty();

        let mut out = Vec::new();
        loop {
            let header = self.header_len();
            let avail = self.buf.len() - self.start;
            if avail < header {
                break;
            }
            let head = &self.buf[self.start..self.start + header];
            let (format, len) = if self.legacy {
                let len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
                (WireFormat::Json, len)
            } else {
                let format = WireFormat::from_byte(head[0])?;
                let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
                (format, len)
            };
            if len > self.max_frame {
                return Err(ProtoError::FrameTooLarge {
                    len,
                    max: self.max_frame,
                });
            }
            if avail < header + len {
                break;
            }
            let payload = &self.buf[self.start + header..self.start + header + len];
            let env = decode_payload(payload, format)?;
            self.last_format = format;
            self.start += header + len;
            out.push(env);
        }

        self.compact_if_needed(0);
        Ok(out)
    }

    /// Drop consumed bytes when the read offset has wrapped past one maximum
    /// frame, or when appending would otherwise grow past the buffer bound.
    fn compact_if_needed(&mut self, incoming: usize) {
        if self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
            return;
        }
        let bound = 2 * self.max_frame + FRAME_HEADER_BYTES;
        if self.start > self.max_frame || self.buf.len() + incoming > bound {
            self.buf.drain(..self.start);
            self.start = 0;
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
