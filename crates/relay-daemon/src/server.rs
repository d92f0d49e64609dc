// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Daemon assembly and the per-connection serve loop.
//!
//! # Startup sequence
//!
//! [`RelayServer::run`] performs these steps in order:
//!
//! 1. Refuse to start when a live daemon owns the socket (PID file probe,
//!    then a connect probe; a stale socket file is removed).
//! 2. Write the PID file next to the socket.
//! 3. Bind the Unix listener.
//! 4. Start the optional TCP+TLS listener.
//! 5. Start the optional outbox ingress watcher.
//! 6. Accept connections until SIGTERM/SIGINT or a programmatic shutdown.
//! 7. Drain: cancel every connection, wait up to the shutdown grace, then
//!    remove the socket and PID files.
//!
//! # Per-connection flow
//!
//! ```text
//! accept ──► peer creds ──► HANDSHAKE (one HELLO, 5 s deadline)
//!                               │ register (displace/reject) + WELCOME
//!                               ▼
//!                            ACTIVE ──► dispatch per kind ──► router /
//!                               │        correlator / spawn manager
//!                   heartbeat PING + idle check
//!                               ▼
//!                 CLOSING (writer drains) ──► CLOSED, membership purged
//! ```
//!
//! Dispatch errors are contained at this boundary: the offending connection
//! is closed, nothing else is affected, and the daemon never terminates due
//! to client misbehavior.

use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::{TcpListener, UnixListener, UnixStream},
};
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};

use relay_proto::{
    AckPayload, Envelope, ErrorCode, ErrorPayload, FrameDecoder, HelloPayload, Kind, LogLevel,
    LogPayload, PingPayload, PongPayload, ServerInfo, ShadowUnbindPayload, WelcomePayload,
};

use crate::auth::PeerPolicy;
use crate::config::{RelayConfig, TlsConfig};
use crate::connection::{
    run_writer, AgentInfo, ConnPeer, ConnState, ConnTuning, Connection,
};
use crate::correlator::SyncCorrelator;
use crate::error::RelayError;
use crate::outbox::run_outbox;
use crate::registry::{AgentRegistry, RegisterOutcome};
use crate::router::{RouteOutcome, Router};
use crate::spawn::{SpawnManager, WorkerLauncher};
use crate::tls;

/// Long-lived daemon state shared by every listener and connection task.
pub struct RelayCore {
    pub config: RelayConfig,
    pub tuning: ConnTuning,
    pub registry: Arc<AgentRegistry>,
    pub router: Arc<Router>,
    pub correlator: Arc<SyncCorrelator>,
    pub spawn: Arc<SpawnManager>,
    pub policy: PeerPolicy,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
    next_conn_id: AtomicU64,
    /// Sink connections backing file-ingress senders; replies are logged.
    sinks: DashMap<String, Arc<Connection>>,
}

impl RelayCore {
    fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Dispatch an envelope synthesized outside a socket (outbox ingress),
    /// attributed to a sink connection named `from`.
    pub async fn inject(self: &Arc<Self>, from: &str, env: Envelope) {
        let sink = self.sink_conn(from);
        if let Err(e) = dispatch(self, &sink, env).await {
            warn!(from, error = %e, "injected envelope failed");
        }
    }

    fn sink_conn(self: &Arc<Self>, from: &str) -> Arc<Connection> {
        if let Some(existing) = self.sinks.get(from) {
            if existing.is_active() {
                return existing.clone();
            }
        }
        let (conn, mut rx) = Connection::new(
            self.next_conn_id(),
            self.tuning.clone(),
            ConnPeer::Internal,
            self.cancel.child_token(),
        );
        conn.set_agent(AgentInfo::from(HelloPayload {
            agent: from.to_string(),
            ..Default::default()
        }));
        conn.set_state(ConnState::Active);
        let name = from.to_string();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                let env = match cmd {
                    crate::connection::WriteCmd::Frame(env)
                    | crate::connection::WriteCmd::Control(env) => env,
                };
                debug!(to = %name, kind = ?env.kind, "reply to file-ingress sender");
            }
        });
        self.sinks.insert(from.to_string(), conn.clone());
        conn
    }
}

/// Shutdown trigger handed out before [`RelayServer::run`] consumes the
/// server.
#[derive(Clone)]
pub struct ServerHandle {
    cancel: CancellationToken,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

pub struct RelayServer {
    core: Arc<RelayCore>,
    socket_path: PathBuf,
    pid_path: PathBuf,
}

impl RelayServer {
    pub fn new(config: RelayConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let socket_path = config.socket_path();
        let pid_path = config.pid_path();
        let tuning = ConnTuning::from_config(&config);
        let registry = Arc::new(AgentRegistry::new(config.registry.duplicate_policy));
        let router = Arc::new(Router::new(registry.clone()));
        let correlator = Arc::new(SyncCorrelator::new(config.sync.default_timeout_ms));
        let spawn = Arc::new(SpawnManager::new(
            launcher,
            registry.clone(),
            router.clone(),
            socket_path.clone(),
        ));
        let policy = config
            .peers_file()
            .map(|p| PeerPolicy::load_or_default(&p))
            .unwrap_or_default();

        let core = Arc::new(RelayCore {
            config,
            tuning,
            registry,
            router,
            correlator,
            spawn,
            policy,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            next_conn_id: AtomicU64::new(0),
            sinks: DashMap::new(),
        });
        Self {
            core,
            socket_path,
            pid_path,
        }
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            cancel: self.core.cancel.clone(),
        }
    }

    pub fn core(&self) -> Arc<RelayCore> {
        self.core.clone()
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Bind and serve until SIGTERM/SIGINT or [`ServerHandle::shutdown`].
    pub async fn run(self) -> Result<(), RelayError> {
        let core = self.core;

        // ── Single-instance check and stale-socket takeover ───────────────────
        if let Some(pid) = read_pidfile(&self.pid_path) {
            if process_alive(pid) {
                return Err(RelayError::AlreadyRunning { pid });
            }
            let _ = std::fs::remove_file(&self.pid_path);
        }
        if self.socket_path.exists() {
            match UnixStream::connect(&self.socket_path).await {
                Ok(_) => {
                    return Err(RelayError::AlreadyRunning {
                        pid: read_pidfile(&self.pid_path).unwrap_or(0),
                    })
                }
                Err(_) => {
                    debug!(socket = %self.socket_path.display(), "removing stale socket");
                    std::fs::remove_file(&self.socket_path)?;
                }
            }
        }
        if let Some(dir) = self.socket_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.pid_path, format!("{}\n", std::process::id()))?;

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(
            socket = %self.socket_path.display(),
            pid = std::process::id(),
            "relay daemon listening"
        );

        // ── Optional subsystems ───────────────────────────────────────────────
        if let Some(tls_cfg) = core.config.tls.clone() {
            let core2 = core.clone();
            core.tracker.spawn(async move {
                if let Err(e) = run_tls_listener(core2, tls_cfg).await {
                    error!(error = %e, "TLS listener failed");
                }
            });
        }
        if let Some(outbox_cfg) = core.config.outbox.clone() {
            let core2 = core.clone();
            let cancel = core.cancel.clone();
            core.tracker.spawn(async move {
                if let Err(e) = run_outbox(outbox_cfg.dir, core2, cancel).await {
                    error!(error = %e, "outbox ingress failed");
                }
            });
        }

        // Presence events are logged centrally.
        {
            let mut events = core.registry.subscribe();
            let cancel = core.cancel.clone();
            core.tracker.spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        ev = events.recv() => match ev {
                            Ok(ev) => trace!(event = ?ev, "presence"),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        },
                    }
                }
            });
        }

        // ── Accept loop ───────────────────────────────────────────────────────
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        loop {
            tokio::select! {
                _ = core.cancel.cancelled() => break,
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let peer = unix_peer(&stream);
                        let core2 = core.clone();
                        core.tracker.spawn(async move {
                            serve_connection(core2, stream, peer).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }

        // ── Orderly shutdown ──────────────────────────────────────────────────
        drop(listener);
        core.cancel.cancel();
        core.tracker.close();
        let grace = Duration::from_millis(core.config.shutdown.grace_ms + 1000);
        if tokio::time::timeout(grace, core.tracker.wait()).await.is_err() {
            warn!("shutdown grace elapsed with tasks still running");
        }
        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(&self.pid_path);
        info!("relay daemon stopped");
        Ok(())
    }
}

fn read_pidfile(path: &PathBuf) -> Option<i32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
}

fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // Signal 0 probes existence without delivering anything.
    unsafe { libc::kill(pid, 0) == 0 }
}

fn unix_peer(stream: &UnixStream) -> ConnPeer {
    match stream.peer_cred() {
        Ok(cred) => ConnPeer::Unix {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid(),
        },
        Err(e) => {
            warn!(error = %e, "peer credentials unavailable");
            ConnPeer::Unix {
                uid: u32::MAX,
                gid: u32::MAX,
                pid: None,
            }
        }
    }
}

// ── TLS listener ──────────────────────────────────────────────────────────────

async fn run_tls_listener(core: Arc<RelayCore>, cfg: TlsConfig) -> Result<(), RelayError> {
    let tls_config = tls::build_server_config(&cfg)?;
    let acceptor = TlsAcceptor::from(tls_config);
    let listener = TcpListener::bind(&cfg.bind).await?;
    info!(bind = %cfg.bind, "TLS listener up");

    loop {
        tokio::select! {
            _ = core.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, addr)) => {
                    let acceptor = acceptor.clone();
                    let cfg = cfg.clone();
                    let core2 = core.clone();
                    core.tracker.spawn(async move {
                        let stream = match acceptor.accept(tcp).await {
                            Ok(s) => s,
                            Err(e) => {
                                debug!(peer = %addr, error = %e, "TLS handshake failed");
                                return;
                            }
                        };
                        match tls::check_allowed_cn(&cfg, &stream) {
                            Ok(cn) => {
                                serve_connection(core2, stream, ConnPeer::Tls { cn }).await;
                            }
                            Err(e) => {
                                warn!(peer = %addr, error = %e, "TLS client rejected");
                            }
                        }
                    });
                }
                Err(e) => warn!(error = %e, "TLS accept failed"),
            },
        }
    }
    Ok(())
}

// ── Per-connection serve loop ─────────────────────────────────────────────────

async fn serve_connection<S>(core: Arc<RelayCore>, stream: S, peer: ConnPeer)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (conn, writer_rx) = Connection::new(
        core.next_conn_id(),
        core.tuning.clone(),
        peer,
        core.cancel.child_token(),
    );
    core.tracker
        .spawn(run_writer(conn.clone(), writer_rx, writer));
    debug!(conn = conn.id(), "connection accepted");

    let mut decoder = FrameDecoder::new(core.tuning.max_frame_bytes);
    // Legacy mode must be set before the first frame is consumed.
    if core.config.socket.legacy_framing && matches!(conn.peer(), ConnPeer::Unix { .. }) {
        let _ = decoder.set_legacy(true);
        conn.set_legacy();
    }
    let mut queue = VecDeque::new();

    if !handshake(&core, &conn, &mut reader, &mut decoder, &mut queue).await {
        conn.begin_close();
        cleanup(&core, &conn).await;
        return;
    }

    serve_active(&core, &conn, &mut reader, &mut decoder, &mut queue).await;

    conn.begin_close();
    cleanup(&core, &conn).await;
}

/// Run the HANDSHAKE state: exactly one frame, which must be a valid HELLO,
/// within the handshake deadline. Returns true when the connection reached
/// ACTIVE.
async fn handshake<R>(
    core: &Arc<RelayCore>,
    conn: &Arc<Connection>,
    reader: &mut R,
    decoder: &mut FrameDecoder,
    queue: &mut VecDeque<Envelope>,
) -> bool
where
    R: AsyncRead + Unpin + Send,
{
    let deadline = Duration::from_millis(core.tuning.handshake_timeout_ms);
    let first = tokio::select! {
        _ = conn.cancel_token().cancelled() => return false,
        res = tokio::time::timeout(deadline, next_envelope(reader, decoder, queue, conn)) => res,
    };

    let env = match first {
        Err(_) => {
            debug!(conn = conn.id(), "handshake deadline elapsed");
            return false;
        }
        Ok(Err(e)) => {
            debug!(conn = conn.id(), error = %e, "handshake protocol error");
            conn.fail(ErrorCode::BadRequest, &e.to_string());
            return false;
        }
        Ok(Ok(None)) => return false,
        Ok(Ok(Some(env))) => env,
    };

    if env.kind != Kind::Hello {
        conn.fail(ErrorCode::BadRequest, "expected HELLO");
        return false;
    }
    let hello: HelloPayload = match env.payload_as() {
        Ok(p) => p,
        Err(e) => {
            conn.fail(ErrorCode::BadRequest, &e.to_string());
            return false;
        }
    };
    if hello.agent.trim().is_empty() {
        conn.fail(ErrorCode::BadRequest, "agent name must be non-empty");
        return false;
    }

    if let ConnPeer::Unix { uid, gid, .. } = *conn.peer() {
        if let Err(e) = core.policy.check(uid, gid, &hello.agent) {
            warn!(conn = conn.id(), agent = %hello.agent, error = %e, "HELLO rejected by peer policy");
            conn.fail(ErrorCode::Unauthorized, &e.to_string());
            return false;
        }
    }

    let name = hello.agent.clone();
    conn.set_agent(AgentInfo::from(hello));

    match core.registry.register(&name, conn.clone()) {
        RegisterOutcome::Inserted => {}
        RegisterOutcome::Displaced(old) => {
            old.fail(ErrorCode::Internal, "superseded by new registration");
        }
        RegisterOutcome::Rejected => {
            conn.fail(ErrorCode::Unauthorized, "agent name already in use");
            return false;
        }
    }

    match Envelope::with_payload(
        Kind::Welcome,
        &WelcomePayload {
            session_id: conn.session_id().to_string(),
            server: ServerInfo {
                max_frame_bytes: core.tuning.max_frame_bytes,
                heartbeat_ms: core.tuning.heartbeat_ms,
            },
        },
    ) {
        Ok(mut welcome) => {
            welcome.to = Some(name.clone());
            conn.send_control(welcome);
        }
        Err(e) => {
            error!(error = %e, "failed to encode WELCOME");
            return false;
        }
    }

    conn.set_state(ConnState::Active);
    conn.touch();
    info!(conn = conn.id(), agent = %name, session = conn.session_id(), "agent active");
    true
}

/// The ACTIVE state: dispatch inbound envelopes, emit heartbeats, police the
/// idle deadline.
async fn serve_active<R>(
    core: &Arc<RelayCore>,
    conn: &Arc<Connection>,
    reader: &mut R,
    decoder: &mut FrameDecoder,
    queue: &mut VecDeque<Envelope>,
) where
    R: AsyncRead + Unpin + Send,
{
    let hb = Duration::from_millis(conn.tuning().heartbeat_ms);
    let idle_limit =
        conn.tuning().heartbeat_ms as i64 * conn.tuning().heartbeat_timeout_multiplier as i64;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + hb, hb);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = conn.cancel_token().cancelled() => break,
            _ = ticker.tick() => {
                if conn.idle_ms() > idle_limit {
                    warn!(
                        conn = conn.id(),
                        agent = conn.agent_name().as_deref().unwrap_or("-"),
                        idle_ms = conn.idle_ms(),
                        "heartbeat timeout"
                    );
                    conn.fail(ErrorCode::Internal, "heartbeat timeout");
                    break;
                }
                let nonce = hex::encode(rand::random::<u64>().to_be_bytes());
                match Envelope::with_payload(Kind::Ping, &PingPayload { nonce }) {
                    Ok(ping) => conn.send_control(ping),
                    Err(e) => warn!(error = %e, "failed to encode PING"),
                }
            }
            next = next_envelope(reader, decoder, queue, conn) => match next {
                Ok(Some(env)) => {
                    conn.touch();
                    if let Err(e) = dispatch(core, conn, env).await {
                        // Containment boundary: the offending connection is
                        // closed, everything else is unaffected.
                        error!(conn = conn.id(), error = %e, "dispatch failed");
                        conn.fail(ErrorCode::Internal, "internal error");
                        break;
                    }
                }
                Ok(None) => {
                    debug!(conn = conn.id(), "peer closed");
                    break;
                }
                Err(e) => {
                    debug!(conn = conn.id(), error = %e, "protocol error");
                    conn.fail(ErrorCode::BadRequest, &e.to_string());
                    break;
                }
            },
        }
    }
}

/// Pop the next decoded envelope, reading more bytes as needed. Returns
/// `None` on a clean EOF. Cancel-safe: the only await point is the socket
/// read, and decoded envelopes are queued before the next await.
async fn next_envelope<R>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    queue: &mut VecDeque<Envelope>,
    conn: &Arc<Connection>,
) -> Result<Option<Envelope>, RelayError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = [0u8; 8192];
    loop {
        if let Some(env) = queue.pop_front() {
            conn.note_inbound_format(decoder.last_format());
            return Ok(Some(env));
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        queue.extend(decoder.push(&buf[..n])?);
    }
}

async fn cleanup(core: &Arc<RelayCore>, conn: &Arc<Connection>) {
    core.registry.deregister(conn);
    core.router.purge(conn);
    core.correlator.purge_connection(conn.id());
    let spawn = core.spawn.clone();
    let conn_id = conn.id();
    core.tracker.spawn(async move {
        spawn.on_parent_disconnect(conn_id).await;
    });
    debug!(conn = conn.id(), "connection cleaned up");
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Route one envelope from an ACTIVE connection to the subsystem that owns
/// its kind. Exhaustive over [`Kind`].
pub(crate) async fn dispatch(
    core: &Arc<RelayCore>,
    conn: &Arc<Connection>,
    env: Envelope,
) -> Result<(), RelayError> {
    trace!(conn = conn.id(), kind = ?env.kind, id = %env.id, "dispatch");
    match env.kind {
        Kind::Send => {
            let sync = env.sync_meta().filter(|s| s.blocking).cloned();
            if let Some(s) = &sync {
                core.correlator
                    .register(conn, s.correlation_id.clone(), s.timeout_ms);
            }
            let outcome = core.router.route_send(conn, &env);
            if let Some(s) = &sync {
                if outcome != RouteOutcome::Delivered {
                    // The NACK the sender just received is the outcome; no
                    // timer should fire for a send that never went out.
                    core.correlator.cancel(&s.correlation_id);
                }
            }
            core.router.publish_topic(conn, &env);
        }

        Kind::Ack | Kind::Nack => {
            if let Ok(ack) = env.payload_as::<AckPayload>() {
                core.router.record_ack(conn, &ack);
                core.correlator.on_ack(conn.agent_name(), &ack);
            }
        }

        Kind::Ping => {
            let nonce = env
                .payload_as::<PingPayload>()
                .map(|p| p.nonce)
                .unwrap_or_default();
            match Envelope::with_payload(Kind::Pong, &PongPayload { nonce }) {
                Ok(pong) => conn.send_control(pong),
                Err(e) => warn!(error = %e, "failed to encode PONG"),
            }
        }
        Kind::Pong => {
            // Activity timestamp was already refreshed by the caller.
        }

        Kind::Bye => {
            debug!(conn = conn.id(), "BYE");
            conn.begin_close();
        }

        Kind::Log => {
            if let Ok(log) = env.payload_as::<LogPayload>() {
                let agent = conn.agent_name().unwrap_or_default();
                match log.level {
                    LogLevel::Debug => debug!(agent = %agent, "{}", log.message),
                    LogLevel::Info => info!(agent = %agent, "{}", log.message),
                    LogLevel::Warn => warn!(agent = %agent, "{}", log.message),
                    LogLevel::Error => error!(agent = %agent, "{}", log.message),
                }
            }
        }

        Kind::Error => {
            let p = env.payload_as::<ErrorPayload>().ok();
            warn!(
                conn = conn.id(),
                code = ?p.as_ref().map(|p| p.code),
                message = p.as_ref().map(|p| p.message.as_str()).unwrap_or(""),
                "client reported error"
            );
        }

        Kind::ChannelJoin => core.router.channel_join(conn, &env),
        Kind::ChannelLeave => core.router.channel_leave(conn, &env),
        Kind::ChannelMessage => {
            core.router.channel_message(conn, &env);
            // Channels and topics are disjoint dispatch paths; an envelope
            // carrying both fans out on each independently.
            core.router.publish_topic(conn, &env);
        }
        Kind::ChannelInfo => core.router.channel_info(conn, &env),
        Kind::ChannelTyping => core.router.channel_typing(conn, &env),

        Kind::Subscribe => core.router.subscribe(conn, &env),
        Kind::Unsubscribe => core.router.unsubscribe(conn, &env),

        Kind::ShadowBind => match env.payload_as() {
            Ok(payload) => core.router.shadow_bind(conn, payload),
            Err(e) => send_error(conn, ErrorCode::BadRequest, &e.to_string()),
        },
        Kind::ShadowUnbind => match env.payload_as::<ShadowUnbindPayload>() {
            Ok(p) => core.router.shadow_unbind(conn, &p.primary),
            Err(e) => send_error(conn, ErrorCode::BadRequest, &e.to_string()),
        },

        Kind::Spawn => {
            let spawn = core.spawn.clone();
            let conn = conn.clone();
            core.tracker.spawn(async move {
                spawn.handle_spawn(conn, env).await;
            });
        }
        Kind::Release => {
            let spawn = core.spawn.clone();
            let conn = conn.clone();
            core.tracker.spawn(async move {
                spawn.handle_release(conn, env).await;
            });
        }

        Kind::Resume | Kind::SyncSnapshot | Kind::SyncDelta => {
            send_error(
                conn,
                ErrorCode::ResumeTooOld,
                "session resume is not available",
            );
        }

        Kind::Hello => {
            send_error(conn, ErrorCode::BadRequest, "already registered");
        }

        Kind::Welcome
        | Kind::Deliver
        | Kind::Busy
        | Kind::ChannelMembers
        | Kind::SpawnResult
        | Kind::ReleaseResult => {
            send_error(conn, ErrorCode::BadRequest, "daemon-originated kind");
        }
    }
    Ok(())
}

fn send_error(conn: &Arc<Connection>, code: ErrorCode, message: &str) {
    match Envelope::with_payload(
        Kind::Error,
        &ErrorPayload {
            code,
            message: message.to_string(),
            fatal: false,
        },
    ) {
        Ok(env) => conn.send_control(env),
        Err(e) => warn!(error = %e, "failed to encode ERROR"),
    }
}
