// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Errors raised while encoding, decoding or framing envelopes.
///
/// Every variant except [`ProtoError::Payload`] is fatal to the connection
/// that produced it: the stream can no longer be trusted to be aligned on a
/// frame boundary.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unknown wire format discriminator 0x{0:02x}")]
    UnknownFormat(u8),

    #[error("protocol version mismatch: got {got}, expected {expected}")]
    VersionMismatch { got: u16, expected: u16 },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("payload error: {0}")]
    Payload(String),

    #[error("framing mode can only change before any bytes are consumed")]
    ModeChange,
}
