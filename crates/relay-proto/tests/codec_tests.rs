//! Wire round-trip tests for the envelope schemas.
//!
//! Each test encodes an envelope through a full frame (header + payload) in
//! both wire formats and decodes it back through the streaming parser,
//! asserting the fields that matter to routing survive intact.

use relay_proto::{
    encode_frame, AckPayload, DeliveryInfo, Envelope, ErrorCode, FrameDecoder, HelloPayload,
    Kind, MessageKind, NackPayload, PayloadMeta, SendPayload, ShadowBindPayload, ShadowTrigger,
    SpawnPayload, SyncMeta, WelcomePayload, WireFormat, DEFAULT_MAX_FRAME_BYTES,
};

fn roundtrip(env: &Envelope, format: WireFormat) -> Envelope {
    let frame = encode_frame(env, format).expect("encode");
    let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_BYTES);
    let mut out = dec.push(&frame).expect("decode");
    assert_eq!(out.len(), 1);
    out.pop().unwrap()
}

fn both_formats(env: &Envelope) -> [Envelope; 2] {
    [
        roundtrip(env, WireFormat::Json),
        roundtrip(env, WireFormat::Msgpack),
    ]
}

// ── Handshake ─────────────────────────────────────────────────────────────────

#[test]
fn hello_roundtrip() {
    let env = Envelope::with_payload(
        Kind::Hello,
        &HelloPayload {
            agent: "Lead".into(),
            cli: Some("claude".into()),
            task: Some("coordinate the refactor".into()),
            ..Default::default()
        },
    )
    .unwrap();

    for back in both_formats(&env) {
        assert_eq!(back.kind, Kind::Hello);
        let p: HelloPayload = back.payload_as().unwrap();
        assert_eq!(p.agent, "Lead");
        assert_eq!(p.cli.as_deref(), Some("claude"));
    }
}

#[test]
fn welcome_roundtrip() {
    let env = Envelope::with_payload(
        Kind::Welcome,
        &WelcomePayload {
            session_id: "sess-1".into(),
            server: relay_proto::ServerInfo {
                max_frame_bytes: 1_048_576,
                heartbeat_ms: 5000,
            },
        },
    )
    .unwrap();

    for back in both_formats(&env) {
        let p: WelcomePayload = back.payload_as().unwrap();
        assert_eq!(p.session_id, "sess-1");
        assert_eq!(p.server.max_frame_bytes, 1_048_576);
        assert_eq!(p.server.heartbeat_ms, 5000);
    }
}

// ── Messaging ─────────────────────────────────────────────────────────────────

#[test]
fn send_with_sync_meta_roundtrip() {
    let env = Envelope::with_payload(
        Kind::Send,
        &SendPayload {
            kind: MessageKind::Message,
            body: "ping".into(),
            ..Default::default()
        },
    )
    .unwrap()
    .from_agent("Lead")
    .to("Worker")
    .with_meta(PayloadMeta {
        requires_ack: Some(true),
        sync: Some(SyncMeta {
            correlation_id: "c1".into(),
            timeout_ms: Some(1000),
            blocking: true,
        }),
        ..Default::default()
    });

    for back in both_formats(&env) {
        assert_eq!(back.to.as_deref(), Some("Worker"));
        let sync = back.sync_meta().expect("sync meta");
        assert_eq!(sync.correlation_id, "c1");
        assert_eq!(sync.timeout_ms, Some(1000));
        assert!(sync.blocking);
    }
}

#[test]
fn deliver_with_delivery_info_roundtrip() {
    let mut env = Envelope::with_payload(
        Kind::Deliver,
        &SendPayload {
            body: "hi".into(),
            ..Default::default()
        },
    )
    .unwrap()
    .from_agent("Lead");
    env.delivery = Some(DeliveryInfo {
        seq: 42,
        session_id: "sess-b".into(),
        original_to: Some("*".into()),
    });

    for back in both_formats(&env) {
        let d = back.delivery.expect("delivery info");
        assert_eq!(d.seq, 42);
        assert_eq!(d.session_id, "sess-b");
        assert_eq!(d.original_to.as_deref(), Some("*"));
    }
}

// ── Acknowledgments ───────────────────────────────────────────────────────────

#[test]
fn ack_with_response_roundtrip() {
    let env = Envelope::with_payload(
        Kind::Ack,
        &AckPayload {
            ack_id: Some("m2".into()),
            correlation_id: Some("c1".into()),
            response: Some(true),
            response_data: Some(serde_json::json!("pong")),
            cumulative_seq: Some(7),
            sack: Some(vec![9, 11]),
            ..Default::default()
        },
    )
    .unwrap();

    for back in both_formats(&env) {
        let p: AckPayload = back.payload_as().unwrap();
        assert_eq!(p.correlation_id.as_deref(), Some("c1"));
        assert_eq!(p.response, Some(true));
        assert_eq!(p.response_data, Some(serde_json::json!("pong")));
        assert_eq!(p.cumulative_seq, Some(7));
        assert_eq!(p.sack, Some(vec![9, 11]));
    }
}

#[test]
fn nack_roundtrip() {
    let env = Envelope::with_payload(
        Kind::Nack,
        &NackPayload {
            code: ErrorCode::NotFound,
            reason: Some("no such agent".into()),
            ack_id: Some("m9".into()),
        },
    )
    .unwrap();

    for back in both_formats(&env) {
        let p: NackPayload = back.payload_as().unwrap();
        assert_eq!(p.code, ErrorCode::NotFound);
        assert_eq!(p.ack_id.as_deref(), Some("m9"));
    }
}

// ── Shadow / spawn ────────────────────────────────────────────────────────────

#[test]
fn shadow_bind_roundtrip() {
    let env = Envelope::with_payload(
        Kind::ShadowBind,
        &ShadowBindPayload {
            primary: "Lead".into(),
            triggers: vec![ShadowTrigger::CodeWritten, ShadowTrigger::ReviewRequest],
            receive_incoming: true,
            receive_outgoing: false,
        },
    )
    .unwrap();

    for back in both_formats(&env) {
        let p: ShadowBindPayload = back.payload_as().unwrap();
        assert_eq!(p.primary, "Lead");
        assert_eq!(p.triggers.len(), 2);
        assert!(!p.receive_outgoing);
    }
}

#[test]
fn spawn_roundtrip() {
    let env = Envelope::with_payload(
        Kind::Spawn,
        &SpawnPayload {
            name: "Reviewer".into(),
            cli: "claude".into(),
            task: "review the diff".into(),
            cwd: Some("/work/repo".into()),
            team: Some("core".into()),
            spawner_name: None,
            model: None,
            shadow_of: Some("Lead".into()),
            shadow_speak_on: vec![ShadowTrigger::ReviewRequest],
        },
    )
    .unwrap();

    for back in both_formats(&env) {
        let p: SpawnPayload = back.payload_as().unwrap();
        assert_eq!(p.name, "Reviewer");
        assert_eq!(p.shadow_of.as_deref(), Some("Lead"));
        assert_eq!(p.shadow_speak_on, vec![ShadowTrigger::ReviewRequest]);
    }
}

// ── Streaming behaviour across kinds ──────────────────────────────────────────

#[test]
fn interleaved_kinds_decode_in_order() {
    let kinds = [
        Kind::Ping,
        Kind::ChannelJoin,
        Kind::Subscribe,
        Kind::ChannelMessage,
        Kind::Bye,
    ];
    let mut stream = Vec::new();
    let mut ids = Vec::new();
    for (i, kind) in kinds.iter().enumerate() {
        let env = Envelope::new(*kind).to(format!("#chan-{i}"));
        ids.push(env.id.clone());
        let format = if i % 2 == 0 {
            WireFormat::Json
        } else {
            WireFormat::Msgpack
        };
        stream.extend(encode_frame(&env, format).unwrap());
    }

    let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_BYTES);
    // Feed in uneven chunks to exercise reassembly.
    let mut out = Vec::new();
    for chunk in stream.chunks(23) {
        out.extend(dec.push(chunk).unwrap());
    }
    assert_eq!(out.len(), kinds.len());
    for (env, (kind, id)) in out.iter().zip(kinds.iter().zip(ids.iter())) {
        assert_eq!(env.kind, *kind);
        assert_eq!(&env.id, id);
    }
}
