// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! One [`Connection`] per client socket.
//!
//! A connection owns two cooperating tasks: the reader (driven by the server,
//! which also dispatches decoded envelopes) and the writer (spawned here,
//! draining the bounded write queue). The `Connection` struct itself is the
//! shared handle both tasks and the router see.
//!
//! # State machine
//!
//! ```text
//! HANDSHAKE ──HELLO ok──► ACTIVE ──close/error──► CLOSING ──drained──► CLOSED
//!     │                                              ▲
//!     └──────── bad frame / deadline ────────────────┘
//! ```
//!
//! # Flow control
//!
//! The write queue is bounded by three watermarks. Crossing `high` emits one
//! BUSY toward the peer; draining back to `low` emits the matching resume
//! notification (BUSY with `resume: true`). Crossing `cap` is fatal to the
//! connection. Control frames (WELCOME, PONG, ERROR, NACK, BUSY, forwarded
//! ACKs) bypass the depth accounting so flow control can never wedge the
//! control plane; both classes share one writer task, so relative order on
//! the socket is preserved.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use relay_proto::{
    encode_frame_legacy, encode_frame_with_limit, envelope::now_ms, AckPayload, BusyPayload,
    Envelope, ErrorCode, ErrorPayload, HelloPayload, Kind, WireFormat,
};

use crate::config::RelayConfig;

pub type ConnId = u64;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Handshake,
    Active,
    Closing,
    Closed,
}

/// Where a connection came from; carried for the authorization hook.
#[derive(Debug, Clone)]
pub enum ConnPeer {
    /// Unix-domain socket with kernel-verified credentials.
    Unix {
        uid: u32,
        gid: u32,
        pid: Option<i32>,
    },
    /// TLS network peer; `cn` is the validated client-certificate common name.
    Tls { cn: Option<String> },
    /// Daemon-internal origin (outbox ingress).
    Internal,
}

/// Per-connection knobs, distilled from [`RelayConfig`].
#[derive(Debug, Clone)]
pub struct ConnTuning {
    pub max_frame_bytes: usize,
    pub queue_low: usize,
    pub queue_high: usize,
    pub queue_cap: usize,
    pub busy_retry_ms: u64,
    pub heartbeat_ms: u64,
    pub heartbeat_timeout_multiplier: u32,
    pub handshake_timeout_ms: u64,
    pub drain_grace_ms: u64,
}

impl ConnTuning {
    pub fn from_config(cfg: &RelayConfig) -> Self {
        Self {
            max_frame_bytes: cfg.limits.max_frame_bytes,
            queue_low: cfg.limits.write_queue.low,
            queue_high: cfg.limits.write_queue.high,
            queue_cap: cfg.limits.write_queue.cap,
            busy_retry_ms: cfg.limits.write_queue.busy_retry_ms,
            heartbeat_ms: cfg.heartbeat.interval_ms,
            heartbeat_timeout_multiplier: cfg.heartbeat.timeout_multiplier,
            handshake_timeout_ms: cfg.socket.handshake_timeout_ms,
            drain_grace_ms: cfg.shutdown.grace_ms,
        }
    }
}

impl Default for ConnTuning {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

/// Identity established by a validated HELLO.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub name: String,
    pub entity: relay_proto::EntityType,
    pub cli: Option<String>,
    pub model: Option<String>,
    pub task: Option<String>,
    pub cwd: Option<String>,
    pub display: std::collections::HashMap<String, String>,
}

impl From<HelloPayload> for AgentInfo {
    fn from(p: HelloPayload) -> Self {
        Self {
            name: p.agent,
            entity: p.entity,
            cli: p.cli,
            model: p.model,
            task: p.task,
            cwd: p.cwd,
            display: p.display,
        }
    }
}

/// Latest acknowledgment state reported by the peer; the input a future
/// session resume needs to compute unacknowledged deliveries.
#[derive(Debug, Clone, Default)]
pub struct AckState {
    pub cumulative_seq: u64,
    pub sack: BTreeSet<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("connection closed")]
    Closed,
    #[error("write queue overflow at depth {depth}")]
    Overflow { depth: usize },
}

pub(crate) enum WriteCmd {
    /// Depth-counted payload traffic (DELIVER and fan-out copies).
    Frame(Envelope),
    /// Control traffic, exempt from watermark accounting.
    Control(Envelope),
}

/// Wire mode the writer encodes with; mirrors the last inbound frame.
const MODE_JSON: u8 = 0;
const MODE_MSGPACK: u8 = 1;
const MODE_LEGACY: u8 = 2;

pub struct Connection {
    id: ConnId,
    session_id: String,
    tuning: ConnTuning,
    peer: ConnPeer,
    state: Mutex<ConnState>,
    agent: RwLock<Option<AgentInfo>>,
    seq: AtomicU64,
    tx: mpsc::UnboundedSender<WriteCmd>,
    depth: AtomicUsize,
    busy: AtomicBool,
    wire_mode: AtomicU8,
    last_activity_ms: AtomicI64,
    ack_state: Mutex<AckState>,
    cancel: CancellationToken,
}

impl Connection {
    /// Create the shared handle plus the receiver its writer task drains.
    pub(crate) fn new(
        id: ConnId,
        tuning: ConnTuning,
        peer: ConnPeer,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<WriteCmd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id,
            session_id: uuid::Uuid::new_v4().to_string(),
            tuning,
            peer,
            state: Mutex::new(ConnState::Handshake),
            agent: RwLock::new(None),
            seq: AtomicU64::new(0),
            tx,
            depth: AtomicUsize::new(0),
            busy: AtomicBool::new(false),
            wire_mode: AtomicU8::new(MODE_JSON),
            last_activity_ms: AtomicI64::new(now_ms()),
            ack_state: Mutex::new(AckState::default()),
            cancel,
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn tuning(&self) -> &ConnTuning {
        &self.tuning
    }

    pub fn peer(&self) -> &ConnPeer {
        &self.peer
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, state: ConnState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnState::Active && !self.cancel.is_cancelled()
    }

    pub fn agent_name(&self) -> Option<String> {
        self.agent
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|a| a.name.clone())
    }

    pub fn agent(&self) -> Option<AgentInfo> {
        self.agent
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_agent(&self, info: AgentInfo) {
        *self.agent.write().unwrap_or_else(|e| e.into_inner()) = Some(info);
    }

    /// Next outbound delivery sequence number; strictly increasing per
    /// connection, starting at 1.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn idle_ms(&self) -> i64 {
        now_ms() - self.last_activity_ms.load(Ordering::Relaxed)
    }

    /// Record the wire format of the most recent inbound frame; outbound
    /// frames mirror it.
    pub fn note_inbound_format(&self, format: WireFormat) {
        if self.wire_mode.load(Ordering::Relaxed) == MODE_LEGACY {
            return;
        }
        let mode = match format {
            WireFormat::Json => MODE_JSON,
            WireFormat::Msgpack => MODE_MSGPACK,
        };
        self.wire_mode.store(mode, Ordering::Relaxed);
    }

    pub fn set_legacy(&self) {
        self.wire_mode.store(MODE_LEGACY, Ordering::Relaxed);
    }

    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Record cumulative/selective acknowledgment fields from an inbound
    /// ACK or NACK.
    pub fn record_ack(&self, ack: &AckPayload) {
        let mut st = self.ack_state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(c) = ack.cumulative_seq {
            if c > st.cumulative_seq {
                st.cumulative_seq = c;
            }
            let cutoff = st.cumulative_seq;
            st.sack.retain(|s| *s > cutoff);
        }
        if let Some(sack) = &ack.sack {
            let cutoff = st.cumulative_seq;
            st.sack.extend(sack.iter().copied().filter(|s| *s > cutoff));
        }
    }

    pub fn ack_state(&self) -> AckState {
        self.ack_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Enqueue depth-counted payload traffic toward the peer.
    ///
    /// Emits BUSY on the high-watermark transition. Overflowing the hard cap
    /// returns an error and closes this connection.
    pub fn enqueue(&self, env: Envelope) -> Result<(), EnqueueError> {
        if self.cancel.is_cancelled() || self.state() == ConnState::Closed {
            return Err(EnqueueError::Closed);
        }
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if depth > self.tuning.queue_cap {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            warn!(
                conn = self.id,
                agent = self.agent_name().as_deref().unwrap_or("-"),
                depth,
                "write queue overflow, closing connection"
            );
            self.fail(ErrorCode::Internal, "write queue overflow");
            return Err(EnqueueError::Overflow { depth });
        }
        if self.tx.send(WriteCmd::Frame(env)).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(EnqueueError::Closed);
        }
        if depth >= self.tuning.queue_high && !self.busy.swap(true, Ordering::AcqRel) {
            debug!(conn = self.id, depth, "write queue above high watermark");
            self.send_control(
                Envelope::with_payload(
                    Kind::Busy,
                    &BusyPayload {
                        retry_after_ms: self.tuning.busy_retry_ms,
                        queue_depth: depth,
                        resume: false,
                    },
                )
                .unwrap_or_else(|_| Envelope::new(Kind::Busy)),
            );
        }
        Ok(())
    }

    /// Enqueue control traffic, exempt from watermark accounting. Errors are
    /// swallowed: a closed peer no longer cares.
    pub fn send_control(&self, env: Envelope) {
        if self.tx.send(WriteCmd::Control(env)).is_err() {
            trace!(conn = self.id, "control frame dropped, writer gone");
        }
    }

    /// Send a final ERROR frame and tear the connection down.
    pub fn fail(&self, code: ErrorCode, message: &str) {
        self.send_control(
            Envelope::with_payload(
                Kind::Error,
                &ErrorPayload {
                    code,
                    message: message.to_string(),
                    fatal: true,
                },
            )
            .unwrap_or_else(|_| Envelope::new(Kind::Error)),
        );
        self.begin_close();
    }

    /// Transition toward CLOSED; the writer drains what it can within the
    /// grace period.
    pub fn begin_close(&self) {
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *st == ConnState::Closed {
                return;
            }
            if *st != ConnState::Closing {
                *st = ConnState::Closing;
            }
        }
        self.cancel.cancel();
    }

    fn encode(&self, env: &Envelope) -> Result<Vec<u8>, relay_proto::ProtoError> {
        match self.wire_mode.load(Ordering::Relaxed) {
            MODE_LEGACY => encode_frame_legacy(env),
            MODE_MSGPACK => {
                encode_frame_with_limit(env, WireFormat::Msgpack, self.tuning.max_frame_bytes)
            }
            _ => encode_frame_with_limit(env, WireFormat::Json, self.tuning.max_frame_bytes),
        }
    }
}

// ── Writer task ───────────────────────────────────────────────────────────────

/// Drain the write queue onto the socket until the connection closes, then
/// flush what remains within the drain grace and mark the connection CLOSED.
pub(crate) async fn run_writer<W>(
    conn: Arc<Connection>,
    mut rx: mpsc::UnboundedReceiver<WriteCmd>,
    mut writer: W,
) where
    W: AsyncWrite + Unpin + Send,
{
    let cancel = conn.cancel_token().clone();
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => {
                    if write_cmd(&conn, &mut writer, cmd).await.is_err() {
                        conn.begin_close();
                        break;
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                drain(&conn, &mut rx, &mut writer).await;
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    conn.set_state(ConnState::Closed);
    trace!(conn = conn.id(), "writer stopped");
}

async fn write_cmd<W>(
    conn: &Arc<Connection>,
    writer: &mut W,
    cmd: WriteCmd,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let (env, counted) = match cmd {
        WriteCmd::Frame(env) => (env, true),
        WriteCmd::Control(env) => (env, false),
    };
    let bytes = match conn.encode(&env) {
        Ok(b) => b,
        Err(e) => {
            // An envelope we built but cannot encode is a daemon bug; skip
            // the frame rather than poisoning the stream.
            warn!(conn = conn.id(), error = %e, kind = ?env.kind, "dropping unencodable frame");
            if counted {
                note_drained(conn, 1);
            }
            return Ok(());
        }
    };
    writer.write_all(&bytes).await?;
    if counted {
        note_drained(conn, 1);
    }
    Ok(())
}

/// Decrement queue depth and emit the resume notification on the
/// low-watermark transition.
fn note_drained(conn: &Arc<Connection>, n: usize) {
    let depth = conn.depth.fetch_sub(n, Ordering::AcqRel).saturating_sub(n);
    if depth <= conn.tuning.queue_low && conn.busy.swap(false, Ordering::AcqRel) {
        debug!(conn = conn.id(), depth, "write queue back below low watermark");
        conn.send_control(
            Envelope::with_payload(
                Kind::Busy,
                &BusyPayload {
                    retry_after_ms: 0,
                    queue_depth: depth,
                    resume: true,
                },
            )
            .unwrap_or_else(|_| Envelope::new(Kind::Busy)),
        );
    }
}

/// Best-effort flush of already-queued frames within the drain grace.
async fn drain<W>(
    conn: &Arc<Connection>,
    rx: &mut mpsc::UnboundedReceiver<WriteCmd>,
    writer: &mut W,
) where
    W: AsyncWrite + Unpin + Send,
{
    let deadline = Instant::now() + Duration::from_millis(conn.tuning().drain_grace_ms);
    loop {
        let cmd = match rx.try_recv() {
            Ok(cmd) => cmd,
            Err(_) => break,
        };
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let fut = write_cmd(conn, writer, cmd);
        match tokio::time::timeout_at(deadline, fut).await {
            Ok(Ok(())) => {}
            _ => break,
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn small_tuning() -> ConnTuning {
        ConnTuning {
            queue_low: 2,
            queue_high: 4,
            queue_cap: 6,
            ..ConnTuning::default()
        }
    }

    fn test_conn(tuning: ConnTuning) -> (Arc<Connection>, mpsc::UnboundedReceiver<WriteCmd>) {
        Connection::new(1, tuning, ConnPeer::Internal, CancellationToken::new())
    }

    fn deliver() -> Envelope {
        Envelope::new(Kind::Deliver)
    }

    #[test]
    fn seq_is_strictly_increasing_from_one() {
        let (conn, _rx) = test_conn(ConnTuning::default());
        assert_eq!(conn.next_seq(), 1);
        assert_eq!(conn.next_seq(), 2);
        assert_eq!(conn.next_seq(), 3);
    }

    #[test]
    fn busy_emitted_once_per_excursion() {
        let (conn, mut rx) = test_conn(small_tuning());
        conn.set_state(ConnState::Active);

        for _ in 0..5 {
            conn.enqueue(deliver()).unwrap();
        }
        // 5 queued frames + exactly one BUSY control at the high watermark.
        let mut frames = 0;
        let mut busy = 0;
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                WriteCmd::Frame(_) => frames += 1,
                WriteCmd::Control(env) => {
                    assert_eq!(env.kind, Kind::Busy);
                    let p: relay_proto::BusyPayload = env.payload_as().unwrap();
                    assert!(!p.resume);
                    busy += 1;
                }
            }
        }
        assert_eq!(frames, 5);
        assert_eq!(busy, 1);
    }

    #[test]
    fn hard_cap_overflow_is_fatal() {
        let (conn, _rx) = test_conn(small_tuning());
        conn.set_state(ConnState::Active);

        for _ in 0..6 {
            conn.enqueue(deliver()).unwrap();
        }
        let err = conn.enqueue(deliver()).unwrap_err();
        assert!(matches!(err, EnqueueError::Overflow { depth: 7 }));
        assert!(conn.cancel_token().is_cancelled());
    }

    #[test]
    fn enqueue_after_close_reports_closed() {
        let (conn, _rx) = test_conn(ConnTuning::default());
        conn.set_state(ConnState::Active);
        conn.begin_close();
        assert!(matches!(conn.enqueue(deliver()), Err(EnqueueError::Closed)));
    }

    #[test]
    fn record_ack_tracks_cumulative_and_sack() {
        let (conn, _rx) = test_conn(ConnTuning::default());
        conn.record_ack(&AckPayload {
            cumulative_seq: Some(3),
            sack: Some(vec![5, 7]),
            ..Default::default()
        });
        conn.record_ack(&AckPayload {
            cumulative_seq: Some(5),
            ..Default::default()
        });
        let st = conn.ack_state();
        assert_eq!(st.cumulative_seq, 5);
        // seq 5 was absorbed by the cumulative point; 7 is still selective.
        assert_eq!(st.sack.iter().copied().collect::<Vec<_>>(), vec![7]);
    }

    #[tokio::test]
    async fn writer_emits_resume_after_drain() {
        let (conn, rx) = test_conn(small_tuning());
        conn.set_state(ConnState::Active);

        // Fill past the high watermark before the writer starts draining so
        // the busy edge is guaranteed to happen.
        for _ in 0..5 {
            conn.enqueue(deliver()).unwrap();
        }

        let (sink, mut rd) = tokio::io::duplex(64 * 1024);
        let writer = tokio::spawn(run_writer(conn.clone(), rx, sink));

        // Read until we have seen one BUSY and one resume frame.
        use tokio::io::AsyncReadExt;
        let mut dec = relay_proto::FrameDecoder::new(conn.tuning().max_frame_bytes);
        let mut saw_busy = false;
        let mut saw_resume = false;
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = [0u8; 4096];
        while !(saw_busy && saw_resume) {
            let n = tokio::time::timeout_at(deadline, rd.read(&mut buf))
                .await
                .expect("timed out waiting for resume")
                .unwrap();
            for env in dec.push(&buf[..n]).unwrap() {
                if env.kind == Kind::Busy {
                    let p: relay_proto::BusyPayload = env.payload_as().unwrap();
                    if p.resume {
                        saw_resume = true;
                        assert!(saw_busy, "resume must follow the busy edge");
                    } else {
                        saw_busy = true;
                    }
                }
            }
        }

        conn.begin_close();
        writer.await.unwrap();
        assert_eq!(conn.state(), ConnState::Closed);
    }
}
