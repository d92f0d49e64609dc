// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Typed message envelopes and per-kind payload schemas.
//!
//! The envelope header is deliberately generic: `payload` is carried as a
//! [`serde_json::Value`] so the daemon can route without fully decoding it,
//! and the typed structs in this module give both sides a schema per kind.
//! Use [`Envelope::with_payload`] / [`Envelope::payload_as`] to cross between
//! the two representations.
//!
//! Addressing lives in the header: `to` is an agent name, a channel name
//! prefixed with `#`, or `*` for broadcast; `topic` addresses pub/sub
//! subscribers independently of `to`.

use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::{ContextV7, Timestamp, Uuid};

use crate::error::ProtoError;

/// Version tag carried by every envelope; mismatches close the connection.
pub const PROTOCOL_VERSION: u16 = 1;

/// Broadcast address for `Envelope::to`.
pub const BROADCAST: &str = "*";

// ── Envelope kinds ────────────────────────────────────────────────────────────

/// Every message kind on the wire. Handlers are exhaustive over this set;
/// a kind string outside it fails envelope decode and closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Kind {
    // Handshake
    Hello,
    Welcome,
    // Messaging
    Send,
    Deliver,
    // Acknowledgment
    Ack,
    Nack,
    // Control / health
    Ping,
    Pong,
    Busy,
    Error,
    Bye,
    Log,
    // Channels
    ChannelJoin,
    ChannelLeave,
    ChannelMessage,
    ChannelInfo,
    ChannelMembers,
    ChannelTyping,
    // Pub/sub
    Subscribe,
    Unsubscribe,
    // Shadowing
    ShadowBind,
    ShadowUnbind,
    // Spawn lifecycle
    Spawn,
    SpawnResult,
    Release,
    ReleaseResult,
    // Session resume (reserved)
    Resume,
    SyncSnapshot,
    SyncDelta,
}

impl Kind {
    /// Kinds only the daemon may originate. Receiving one from a client is a
    /// soft BAD_REQUEST.
    pub fn is_daemon_only(self) -> bool {
        matches!(
            self,
            Kind::Welcome
                | Kind::Deliver
                | Kind::Busy
                | Kind::ChannelMembers
                | Kind::SpawnResult
                | Kind::ReleaseResult
        )
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Daemon-attached delivery metadata. Never set by clients; the daemon
/// overwrites anything a client puts here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    /// Strictly increasing per outbound connection.
    pub seq: u64,
    /// Session id of the receiving connection.
    pub session_id: String,
    /// Original `to` before broadcast/channel expansion (`"*"` or `"#chan"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_to: Option<String>,
}

/// Sender-supplied metadata that rides along with the payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_ack: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<String>,
    /// Id of the envelope this one replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncMeta>,
}

/// Blocking-send metadata: ties a SEND to the ACK that answers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMeta {
    /// Sender-chosen opaque id echoed back in the matching ACK.
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub blocking: bool,
}

/// The unit of the wire protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u16,
    pub kind: Kind,
    /// Unique, monotonic, lexicographically sortable by creation time.
    pub id: String,
    /// Creation timestamp, milliseconds since the epoch.
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<PayloadMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryInfo>,
}

impl Envelope {
    /// New envelope with a fresh id and timestamp and an empty payload.
    pub fn new(kind: Kind) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            kind,
            id: next_id(),
            ts: now_ms(),
            from: None,
            to: None,
            topic: None,
            payload: Value::Null,
            meta: None,
            delivery: None,
        }
    }

    /// New envelope carrying `payload` encoded into the generic form.
    pub fn with_payload<T: Serialize>(kind: Kind, payload: &T) -> Result<Self, ProtoError> {
        let mut env = Self::new(kind);
        env.payload =
            serde_json::to_value(payload).map_err(|e| ProtoError::Payload(e.to_string()))?;
        Ok(env)
    }

    /// Decode the generic payload into the typed schema for this kind.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtoError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ProtoError::Payload(format!("{:?} payload: {e}", self.kind))
        })
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn from_agent(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn on_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_meta(mut self, meta: PayloadMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Sync metadata, if the sender marked this envelope blocking.
    pub fn sync_meta(&self) -> Option<&SyncMeta> {
        self.meta.as_ref().and_then(|m| m.sync.as_ref())
    }

    /// True when `to` is the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        self.to.as_deref() == Some(BROADCAST)
    }
}

/// Monotonic, time-sortable envelope id (UUIDv7).
///
/// A shared [`ContextV7`] keeps ids generated within the same millisecond
/// strictly ordered.
pub fn next_id() -> String {
    static CTX: OnceLock<Mutex<ContextV7>> = OnceLock::new();
    let ctx = CTX.get_or_init(|| Mutex::new(ContextV7::new()));
    let guard = ctx.lock().unwrap();
    Uuid::new_v7(Timestamp::now(&*guard)).to_string()
}

/// Current time in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Error codes ───────────────────────────────────────────────────────────────

/// Abstract error taxonomy carried by ERROR and NACK payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    NotFound,
    Internal,
    ResumeTooOld,
    /// Soft routing failure: the recipient's write queue is saturated.
    Busy,
}

// ── Handshake payloads ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    #[default]
    Agent,
    User,
}

/// First (and only) frame a client may send while in HANDSHAKE.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Unique non-empty agent name for this connection.
    pub agent: String,
    #[serde(default)]
    pub entity: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub display: HashMap<String, String>,
}

/// Server limits advertised in WELCOME.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub max_frame_bytes: usize,
    pub heartbeat_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub session_id: String,
    pub server: ServerInfo,
}

// ── Messaging payloads ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Message,
    Action,
    State,
    Thinking,
}

/// Payload of SEND, DELIVER and CHANNEL_MESSAGE.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendPayload {
    #[serde(default)]
    pub kind: MessageKind,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

// ── Acknowledgment payloads ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AckPayload {
    /// Id of the envelope being acknowledged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<String>,
    /// Delivery sequence number being acknowledged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Ties this ACK to a blocking SEND.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Set when this ACK carries an application-level reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Value>,
    /// All deliveries with seq <= this value have been received.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulative_seq: Option<u64>,
    /// Selectively acknowledged sequence numbers above the cumulative point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sack: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NackPayload {
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Id of the envelope that could not be delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<String>,
}

// ── Control payloads ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub fatal: bool,
}

/// Flow-control notification. `resume: false` marks the high-watermark edge,
/// `resume: true` the low-watermark edge of the same excursion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusyPayload {
    pub retry_after_ms: u64,
    pub queue_depth: usize,
    #[serde(default)]
    pub resume: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPayload {
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongPayload {
    pub nonce: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Client-emitted log line surfaced on the daemon log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPayload {
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
}

// ── Channel payloads ──────────────────────────────────────────────────────────

/// Reply to CHANNEL_INFO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMembersPayload {
    pub channel: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelTypingPayload {
    #[serde(default)]
    pub typing: bool,
}

// ── Pub/sub payloads ──────────────────────────────────────────────────────────

/// SUBSCRIBE / UNSUBSCRIBE may carry the topic here instead of the header
/// `topic` field; the header wins when both are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

// ── Shadow payloads ───────────────────────────────────────────────────────────

/// Events a shadow can limit itself to. An empty trigger set means
/// ALL_MESSAGES.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShadowTrigger {
    SessionEnd,
    CodeWritten,
    ReviewRequest,
    ExplicitAsk,
    AllMessages,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowBindPayload {
    /// Agent whose traffic the shadow observes.
    pub primary: String,
    #[serde(default)]
    pub triggers: Vec<ShadowTrigger>,
    #[serde(default = "default_true")]
    pub receive_incoming: bool,
    #[serde(default = "default_true")]
    pub receive_outgoing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowUnbindPayload {
    pub primary: String,
}

fn default_true() -> bool {
    true
}

// ── Spawn payloads ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnPayload {
    /// Name the spawned worker will register under.
    pub name: String,
    /// Launcher-recognized CLI identifier.
    pub cli: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawner_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Spawn the worker as a shadow of this agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow_of: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shadow_speak_on: Vec<ShadowTrigger>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnResultPayload {
    /// Id of the SPAWN envelope this answers.
    pub reply_to: String,
    pub success: bool,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_decision: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleasePayload {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResultPayload {
    pub reply_to: String,
    pub success: bool,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&Kind::ChannelJoin).unwrap(),
            "\"CHANNEL_JOIN\""
        );
        assert_eq!(
            serde_json::to_string(&Kind::SpawnResult).unwrap(),
            "\"SPAWN_RESULT\""
        );
        let k: Kind = serde_json::from_str("\"SHADOW_BIND\"").unwrap();
        assert_eq!(k, Kind::ShadowBind);
    }

    #[test]
    fn unknown_kind_fails_decode() {
        let json = r#"{"v":1,"kind":"TELEPORT","id":"x","ts":0}"#;
        assert!(serde_json::from_str::<Envelope>(json).is_err());
    }

    #[test]
    fn error_code_wire_names() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::NotFound).unwrap(),
            "\"NOT_FOUND\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::ResumeTooOld).unwrap(),
            "\"RESUME_TOO_OLD\""
        );
    }

    #[test]
    fn envelope_ids_sort_by_creation_time() {
        let a = Envelope::new(Kind::Send);
        let b = Envelope::new(Kind::Send);
        assert!(a.id < b.id, "uuid v7 ids must be time-ordered");
    }

    #[test]
    fn payload_round_trip() {
        let env = Envelope::with_payload(
            Kind::Send,
            &SendPayload {
                kind: MessageKind::Action,
                body: "deploy".into(),
                data: Some(serde_json::json!({"branch": "main"})),
                thread_id: None,
            },
        )
        .unwrap()
        .to("Worker");

        let p: SendPayload = env.payload_as().unwrap();
        assert_eq!(p.kind, MessageKind::Action);
        assert_eq!(p.body, "deploy");
        assert_eq!(p.data.unwrap()["branch"], "main");
    }

    #[test]
    fn hello_defaults() {
        let p: HelloPayload = serde_json::from_str(r#"{"agent":"Lead"}"#).unwrap();
        assert_eq!(p.entity, EntityType::Agent);
        assert!(p.cli.is_none());
        assert!(p.display.is_empty());
    }

    #[test]
    fn shadow_bind_defaults_to_both_directions() {
        let p: ShadowBindPayload =
            serde_json::from_str(r#"{"primary":"Lead"}"#).unwrap();
        assert!(p.receive_incoming);
        assert!(p.receive_outgoing);
        assert!(p.triggers.is_empty());
    }

    #[test]
    fn optional_header_fields_are_omitted() {
        let env = Envelope::new(Kind::Ping);
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("\"from\""));
        assert!(!json.contains("\"delivery\""));
        assert!(!json.contains("\"payload\""));
    }

    #[test]
    fn daemon_only_kinds() {
        assert!(Kind::Deliver.is_daemon_only());
        assert!(Kind::Welcome.is_daemon_only());
        assert!(!Kind::Send.is_daemon_only());
        assert!(!Kind::Ack.is_daemon_only());
    }
}
