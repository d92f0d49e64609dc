// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire protocol for the agent-relay daemon.
//!
//! Every message on a relay socket is an [`Envelope`]: a small versioned
//! header (kind, id, timestamp, addressing) plus a kind-specific payload.
//! Envelopes are framed with a one-byte format discriminator and a
//! big-endian `u32` length:
//!
//! ```text
//! +--------+----------------+------------------+
//! | format | length         | payload          |
//! | 1 byte | 4 bytes (BE)   | JSON/MessagePack |
//! +--------+----------------+------------------+
//! ```
//!
//! A legacy 4-byte-header JSON-only framing is accepted on connections that
//! opt in before the first frame is consumed (see [`wire::FrameDecoder`]).

pub mod envelope;
pub mod error;
pub mod wire;

pub use envelope::{
    AckPayload, BusyPayload, ChannelMembersPayload, ChannelTypingPayload, DeliveryInfo,
    EntityType, Envelope, ErrorCode, ErrorPayload, HelloPayload, Kind, LogLevel, LogPayload,
    MessageKind, NackPayload, PayloadMeta, PingPayload, PongPayload, ReleasePayload,
    ReleaseResultPayload, SendPayload, ServerInfo, ShadowBindPayload, ShadowTrigger,
    ShadowUnbindPayload, SpawnPayload, SpawnResultPayload, SubscribePayload, SyncMeta,
    WelcomePayload, BROADCAST, PROTOCOL_VERSION,
};
pub use error::ProtoError;
pub use wire::{
    encode_frame, encode_frame_legacy, encode_frame_with_limit, FrameDecoder, WireFormat,
    DEFAULT_MAX_FRAME_BYTES, FRAME_HEADER_BYTES, LEGACY_HEADER_BYTES,
};
