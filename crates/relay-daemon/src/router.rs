// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Message routing: direct, broadcast, channel, pub/sub topic and shadow
//! fan-out.
//!
//! The router owns the membership tables and nothing else. Connections are
//! held weakly; the authoritative name → connection relation lives in the
//! [`AgentRegistry`] and every direct route resolves through it, so a closed
//! connection is skipped naturally. Mutators run under short `std::sync`
//! critical sections; enqueueing onto a recipient's write queue is a
//! non-blocking push, so fan-out may hold the membership lock for the length
//! of the member list without suspending.
//!
//! Fan-out never delivers back to the sender, and a delivery generated as a
//! shadow copy never produces further shadow copies: shadow fan-out is only
//! invoked from the primary delivery paths.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, Weak},
};

use tracing::{debug, trace, warn};

use relay_proto::{
    AckPayload, ChannelMembersPayload, DeliveryInfo, Envelope, ErrorCode, ErrorPayload, Kind,
    NackPayload, ShadowBindPayload, ShadowTrigger, SubscribePayload, BROADCAST,
};

use crate::connection::{ConnId, Connection, EnqueueError};
use crate::registry::AgentRegistry;

/// What happened to a routed SEND, as seen by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    NotFound,
    Busy,
    /// The envelope named no direct target (topic-only traffic).
    NoTarget,
}

struct ShadowBinding {
    conn: Weak<Connection>,
    conn_id: ConnId,
    triggers: HashSet<ShadowTrigger>,
    receive_incoming: bool,
    receive_outgoing: bool,
}

#[derive(Clone, Copy)]
enum ShadowDirection {
    /// The primary is the recipient of the observed delivery.
    Incoming,
    /// The primary is the sender.
    Outgoing,
}

type MemberMap = HashMap<String, HashMap<ConnId, Weak<Connection>>>;

pub struct Router {
    registry: Arc<AgentRegistry>,
    channels: Mutex<MemberMap>,
    topics: Mutex<MemberMap>,
    shadows: Mutex<HashMap<String, Vec<ShadowBinding>>>,
}

impl Router {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            channels: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
            shadows: Mutex::new(HashMap::new()),
        }
    }

    // ── Direct and broadcast sends ────────────────────────────────────────────

    /// Route a SEND from an ACTIVE connection. Failure replies (NACK) are
    /// sent here; the caller only needs the outcome to settle any blocking
    /// correlation state.
    pub fn route_send(&self, sender: &Arc<Connection>, env: &Envelope) -> RouteOutcome {
        let Some(from) = sender.agent_name() else {
            return RouteOutcome::NoTarget;
        };
        match env.to.as_deref() {
            None | Some("") => RouteOutcome::NoTarget,
            Some(BROADCAST) => self.broadcast(sender, &from, env),
            Some(ch) if ch.starts_with('#') => {
                // A SEND addressed at a channel takes the channel fan-out
                // path; recipients still see a DELIVER.
                self.fan_channel(sender, &from, ch, env, Kind::Deliver, true);
                RouteOutcome::Delivered
            }
            Some(name) => self.direct(sender, &from, name, env),
        }
    }

    fn direct(
        &self,
        sender: &Arc<Connection>,
        from: &str,
        name: &str,
        env: &Envelope,
    ) -> RouteOutcome {
        let recipient = match self.registry.lookup(name) {
            Some(c) if c.is_active() => c,
            _ => {
                self.nack(sender, env, ErrorCode::NotFound, "no such agent");
                return RouteOutcome::NotFound;
            }
        };

        let deliver = build_copy(env, Kind::Deliver, from, &recipient, None);
        match recipient.enqueue(deliver) {
            Ok(()) => {
                if let Some(rname) = recipient.agent_name() {
                    self.fan_shadows(
                        &rname,
                        from,
                        env,
                        ShadowDirection::Incoming,
                        &[sender.id(), recipient.id()],
                    );
                }
                self.fan_shadows(
                    from,
                    from,
                    env,
                    ShadowDirection::Outgoing,
                    &[sender.id(), recipient.id()],
                );
                RouteOutcome::Delivered
            }
            Err(EnqueueError::Closed) => {
                // Deregistered between lookup and enqueue.
                self.nack(sender, env, ErrorCode::NotFound, "agent disconnected");
                RouteOutcome::NotFound
            }
            Err(EnqueueError::Overflow { .. }) => {
                self.nack(sender, env, ErrorCode::Busy, "busy");
                RouteOutcome::Busy
            }
        }
    }

    fn broadcast(&self, sender: &Arc<Connection>, from: &str, env: &Envelope) -> RouteOutcome {
        let peers = self.registry.list_active();
        let mut total = 0usize;
        let mut failed = 0usize;
        for (name, conn) in peers {
            if conn.id() == sender.id() || !conn.is_active() {
                continue;
            }
            total += 1;
            let deliver = build_copy(env, Kind::Deliver, from, &conn, Some(BROADCAST.into()));
            match conn.enqueue(deliver) {
                Ok(()) => {
                    self.fan_shadows(
                        &name,
                        from,
                        env,
                        ShadowDirection::Incoming,
                        &[sender.id(), conn.id()],
                    );
                }
                Err(e) => {
                    failed += 1;
                    debug!(recipient = %name, error = %e, "broadcast enqueue failed");
                }
            }
        }
        self.fan_shadows(from, from, env, ShadowDirection::Outgoing, &[sender.id()]);
        if total > 0 && failed == total {
            self.nack(sender, env, ErrorCode::Busy, "busy");
            return RouteOutcome::Busy;
        }
        trace!(from, total, failed, "broadcast fan-out");
        RouteOutcome::Delivered
    }

    // ── Channels ──────────────────────────────────────────────────────────────

    pub fn channel_join(&self, conn: &Arc<Connection>, env: &Envelope) {
        let Some(channel) = self.valid_channel(conn, env) else {
            return;
        };
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let members = channels.entry(channel.clone()).or_default();
        // Idempotent: re-joining is a no-op.
        members.insert(conn.id(), Arc::downgrade(conn));
        debug!(channel = %channel, agent = conn.agent_name().as_deref().unwrap_or("-"), "channel join");
    }

    pub fn channel_leave(&self, conn: &Arc<Connection>, env: &Envelope) {
        let Some(channel) = self.valid_channel(conn, env) else {
            return;
        };
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(members) = channels.get_mut(&channel) {
            members.remove(&conn.id());
            if members.is_empty() {
                channels.remove(&channel);
            }
        }
    }

    pub fn channel_message(&self, sender: &Arc<Connection>, env: &Envelope) {
        let Some(channel) = self.valid_channel(sender, env) else {
            return;
        };
        let Some(from) = sender.agent_name() else {
            return;
        };
        self.fan_channel(sender, &from, &channel, env, env.kind, true);
    }

    pub fn channel_typing(&self, sender: &Arc<Connection>, env: &Envelope) {
        let Some(channel) = self.valid_channel(sender, env) else {
            return;
        };
        let Some(from) = sender.agent_name() else {
            return;
        };
        // Typing indicators fan out like messages but do not involve shadows.
        self.fan_channel(sender, &from, &channel, env, env.kind, false);
    }

    /// Reply to CHANNEL_INFO with the current member list.
    pub fn channel_info(&self, conn: &Arc<Connection>, env: &Envelope) {
        let Some(channel) = self.valid_channel(conn, env) else {
            return;
        };
        let members = {
            let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            channels
                .get(&channel)
                .map(|m| {
                    m.values()
                        .filter_map(|w| w.upgrade())
                        .filter_map(|c| c.agent_name())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };
        match Envelope::with_payload(
            Kind::ChannelMembers,
            &ChannelMembersPayload { channel, members },
        ) {
            Ok(mut reply) => {
                reply.to = conn.agent_name();
                conn.send_control(reply);
            }
            Err(e) => warn!(error = %e, "failed to encode channel members reply"),
        }
    }

    /// Fan a channel envelope to every member except the sender. The member
    /// lock is held across the enqueue loop: pushes never block, and the
    /// critical section is what gives each recipient the router's processing
    /// order.
    fn fan_channel(
        &self,
        sender: &Arc<Connection>,
        from: &str,
        channel: &str,
        env: &Envelope,
        kind: Kind,
        shadows: bool,
    ) {
        let mut delivered_to = Vec::new();
        {
            let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            let Some(members) = channels.get(channel) else {
                trace!(channel, "channel message to empty channel");
                return;
            };
            for member in members.values() {
                let Some(conn) = member.upgrade() else {
                    continue;
                };
                if conn.id() == sender.id() || !conn.is_active() {
                    continue;
                }
                let copy = build_copy(env, kind, from, &conn, Some(channel.to_string()));
                match conn.enqueue(copy) {
                    Ok(()) => {
                        if let Some(name) = conn.agent_name() {
                            delivered_to.push((name, conn.id()));
                        }
                    }
                    Err(e) => {
                        debug!(channel, conn = conn.id(), error = %e, "channel enqueue failed");
                    }
                }
            }
        }
        if shadows {
            for (name, conn_id) in &delivered_to {
                self.fan_shadows(
                    name,
                    from,
                    env,
                    ShadowDirection::Incoming,
                    &[sender.id(), *conn_id],
                );
            }
            self.fan_shadows(from, from, env, ShadowDirection::Outgoing, &[sender.id()]);
        }
    }

    /// Validate the channel address on `env.to`; replies BAD_REQUEST and
    /// returns None otherwise.
    fn valid_channel(&self, conn: &Arc<Connection>, env: &Envelope) -> Option<String> {
        match env.to.as_deref() {
            Some(ch) if ch.starts_with('#') && ch.len() > 1 => Some(ch.to_string()),
            other => {
                self.error_reply(
                    conn,
                    ErrorCode::BadRequest,
                    &format!("invalid channel name {:?}", other.unwrap_or("")),
                );
                None
            }
        }
    }

    // ── Pub/sub topics ────────────────────────────────────────────────────────

    fn topic_of(env: &Envelope) -> Option<String> {
        if let Some(t) = env.topic.as_deref() {
            if !t.is_empty() {
                return Some(t.to_string());
            }
        }
        env.payload_as::<SubscribePayload>()
            .ok()
            .and_then(|p| p.topic)
            .filter(|t| !t.is_empty())
    }

    pub fn subscribe(&self, conn: &Arc<Connection>, env: &Envelope) {
        let Some(topic) = Self::topic_of(env) else {
            self.error_reply(conn, ErrorCode::BadRequest, "missing topic");
            return;
        };
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.clone())
            .or_default()
            .insert(conn.id(), Arc::downgrade(conn));
        debug!(topic = %topic, agent = conn.agent_name().as_deref().unwrap_or("-"), "subscribed");
    }

    pub fn unsubscribe(&self, conn: &Arc<Connection>, env: &Envelope) {
        let Some(topic) = Self::topic_of(env) else {
            self.error_reply(conn, ErrorCode::BadRequest, "missing topic");
            return;
        };
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = topics.get_mut(&topic) {
            subs.remove(&conn.id());
            if subs.is_empty() {
                topics.remove(&topic);
            }
        }
    }

    /// Fan any envelope carrying a non-empty `topic` to its subscribers,
    /// excluding the sender. Independent of (and additional to) whatever the
    /// `to` field routed.
    pub fn publish_topic(&self, sender: &Arc<Connection>, env: &Envelope) -> usize {
        let Some(topic) = env.topic.as_deref().filter(|t| !t.is_empty()) else {
            return 0;
        };
        let Some(from) = sender.agent_name() else {
            return 0;
        };
        let kind = if env.kind == Kind::Send {
            Kind::Deliver
        } else {
            env.kind
        };
        let mut count = 0usize;
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = topics.get(topic) {
            for sub in subs.values() {
                let Some(conn) = sub.upgrade() else { continue };
                if conn.id() == sender.id() || !conn.is_active() {
                    continue;
                }
                let copy = build_copy(env, kind, &from, &conn, None);
                if let Err(e) = conn.enqueue(copy) {
                    debug!(topic, conn = conn.id(), error = %e, "topic enqueue failed");
                } else {
                    count += 1;
                }
            }
        }
        count
    }

    // ── Shadows ───────────────────────────────────────────────────────────────

    pub fn shadow_bind(&self, conn: &Arc<Connection>, payload: ShadowBindPayload) {
        let mut shadows = self.shadows.lock().unwrap_or_else(|e| e.into_inner());
        let bindings = shadows.entry(payload.primary.clone()).or_default();
        bindings.retain(|b| b.conn_id != conn.id());
        bindings.push(ShadowBinding {
            conn: Arc::downgrade(conn),
            conn_id: conn.id(),
            triggers: payload.triggers.into_iter().collect(),
            receive_incoming: payload.receive_incoming,
            receive_outgoing: payload.receive_outgoing,
        });
        debug!(
            primary = %payload.primary,
            shadow = conn.agent_name().as_deref().unwrap_or("-"),
            "shadow bound"
        );
    }

    pub fn shadow_unbind(&self, conn: &Arc<Connection>, primary: &str) {
        let mut shadows = self.shadows.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bindings) = shadows.get_mut(primary) {
            bindings.retain(|b| b.conn_id != conn.id());
            if bindings.is_empty() {
                shadows.remove(primary);
            }
        }
    }

    /// Copy a primary's delivery to each matching shadow. Only called from
    /// the primary delivery paths above, never for a copy it produced itself,
    /// which is what makes shadow fan-out non-recursive.
    fn fan_shadows(
        &self,
        primary: &str,
        from: &str,
        env: &Envelope,
        direction: ShadowDirection,
        skip: &[ConnId],
    ) {
        let targets: Vec<Arc<Connection>> = {
            let shadows = self.shadows.lock().unwrap_or_else(|e| e.into_inner());
            let Some(bindings) = shadows.get(primary) else {
                return;
            };
            bindings
                .iter()
                .filter(|b| match direction {
                    ShadowDirection::Incoming => b.receive_incoming,
                    ShadowDirection::Outgoing => b.receive_outgoing,
                })
                .filter(|b| trigger_matches(&b.triggers, env))
                .filter(|b| !skip.contains(&b.conn_id))
                .filter_map(|b| b.conn.upgrade())
                .filter(|c| c.is_active())
                .collect()
        };
        for shadow in targets {
            let copy = build_copy(env, Kind::Deliver, from, &shadow, env.to.clone());
            if let Err(e) = shadow.enqueue(copy) {
                debug!(primary, shadow = shadow.id(), error = %e, "shadow enqueue failed");
            }
        }
    }

    /// Drop every shadow binding observing `primary`.
    pub fn purge_shadows_of(&self, primary: &str) {
        let mut shadows = self.shadows.lock().unwrap_or_else(|e| e.into_inner());
        shadows.remove(primary);
    }

    // ── Acknowledgments ───────────────────────────────────────────────────────

    /// Record cumulative/selective acknowledgment state on the acknowledging
    /// connection. Correlation matching happens in the sync correlator.
    pub fn record_ack(&self, conn: &Arc<Connection>, ack: &AckPayload) {
        conn.record_ack(ack);
    }

    // ── Membership cleanup ────────────────────────────────────────────────────

    /// Remove every membership entry referring to a terminated connection.
    pub fn purge(&self, conn: &Connection) {
        let id = conn.id();
        {
            let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            channels.retain(|_, members| {
                members.remove(&id);
                !members.is_empty()
            });
        }
        {
            let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            topics.retain(|_, subs| {
                subs.remove(&id);
                !subs.is_empty()
            });
        }
        {
            let mut shadows = self.shadows.lock().unwrap_or_else(|e| e.into_inner());
            shadows.retain(|_, bindings| {
                bindings.retain(|b| b.conn_id != id);
                !bindings.is_empty()
            });
        }
    }

    /// Current member names of a channel (diagnostics and tests).
    pub fn channel_members(&self, channel: &str) -> Vec<String> {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .get(channel)
            .map(|m| {
                m.values()
                    .filter_map(|w| w.upgrade())
                    .filter_map(|c| c.agent_name())
                    .collect()
            })
            .unwrap_or_default()
    }

    // ── Replies ───────────────────────────────────────────────────────────────

    fn nack(&self, sender: &Arc<Connection>, env: &Envelope, code: ErrorCode, reason: &str) {
        match Envelope::with_payload(
            Kind::Nack,
            &NackPayload {
                code,
                reason: Some(reason.to_string()),
                ack_id: Some(env.id.clone()),
            },
        ) {
            Ok(mut nack) => {
                nack.to = sender.agent_name();
                sender.send_control(nack);
            }
            Err(e) => warn!(error = %e, "failed to encode NACK"),
        }
    }

    fn error_reply(&self, conn: &Arc<Connection>, code: ErrorCode, message: &str) {
        match Envelope::with_payload(
            Kind::Error,
            &ErrorPayload {
                code,
                message: message.to_string(),
                fatal: false,
            },
        ) {
            Ok(reply) => conn.send_control(reply),
            Err(e) => warn!(error = %e, "failed to encode ERROR reply"),
        }
    }
}

/// Build the per-recipient copy of an envelope: same id, timestamp and
/// payload, daemon-resolved `from`, fresh delivery info for the recipient.
fn build_copy(
    env: &Envelope,
    kind: Kind,
    from: &str,
    recipient: &Connection,
    original_to: Option<String>,
) -> Envelope {
    let mut out = env.clone();
    out.kind = kind;
    out.from = Some(from.to_string());
    out.delivery = Some(DeliveryInfo {
        seq: recipient.next_seq(),
        session_id: recipient.session_id().to_string(),
        original_to,
    });
    out
}

fn trigger_matches(triggers: &HashSet<ShadowTrigger>, env: &Envelope) -> bool {
    if triggers.is_empty() || triggers.contains(&ShadowTrigger::AllMessages) {
        return true;
    }
    let hint = env
        .payload
        .get("data")
        .and_then(|d| d.get("trigger"))
        .and_then(|t| t.as_str());
    let Some(hint) = hint else {
        return false;
    };
    let wanted = match hint {
        "session_end" => ShadowTrigger::SessionEnd,
        "code_written" => ShadowTrigger::CodeWritten,
        "review_request" => ShadowTrigger::ReviewRequest,
        "explicit_ask" => ShadowTrigger::ExplicitAsk,
        _ => return false,
    };
    triggers.contains(&wanted)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DuplicatePolicy;
    use crate::connection::{AgentInfo, ConnPeer, ConnState, ConnTuning, WriteCmd};
    use relay_proto::{HelloPayload, MessageKind, SendPayload};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        registry: Arc<AgentRegistry>,
        router: Router,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(AgentRegistry::new(DuplicatePolicy::Displace));
            let router = Router::new(registry.clone());
            Self { registry, router }
        }

        fn agent(
            &self,
            id: u64,
            name: &str,
        ) -> (Arc<Connection>, mpsc::UnboundedReceiver<WriteCmd>) {
            let (conn, rx) = Connection::new(
                id,
                ConnTuning::default(),
                ConnPeer::Internal,
                CancellationToken::new(),
            );
            conn.set_agent(AgentInfo::from(HelloPayload {
                agent: name.to_string(),
                ..Default::default()
            }));
            conn.set_state(ConnState::Active);
            self.registry.register(name, conn.clone());
            (conn, rx)
        }
    }

    fn send_env(to: &str, body: &str) -> Envelope {
        Envelope::with_payload(
            Kind::Send,
            &SendPayload {
                kind: MessageKind::Message,
                body: body.into(),
                ..Default::default()
            },
        )
        .unwrap()
        .to(to)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WriteCmd>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(match cmd {
                WriteCmd::Frame(env) | WriteCmd::Control(env) => env,
            });
        }
        out
    }

    #[test]
    fn direct_send_delivers_with_seq_and_resolved_from() {
        let fx = Fixture::new();
        let (lead, _lead_rx) = fx.agent(1, "Lead");
        let (_worker, mut worker_rx) = fx.agent(2, "Worker");

        // The wire `from` is a lie; the router must overwrite it.
        let env = send_env("Worker", "go").from_agent("Impostor");
        assert_eq!(fx.router.route_send(&lead, &env), RouteOutcome::Delivered);

        let got = drain(&mut worker_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, Kind::Deliver);
        assert_eq!(got[0].id, env.id);
        assert_eq!(got[0].from.as_deref(), Some("Lead"));
        let d = got[0].delivery.as_ref().unwrap();
        assert_eq!(d.seq, 1);
        assert!(d.original_to.is_none());
    }

    #[test]
    fn unknown_recipient_nacks_not_found() {
        let fx = Fixture::new();
        let (lead, mut lead_rx) = fx.agent(1, "Lead");

        let env = send_env("Ghost", "hello?");
        assert_eq!(fx.router.route_send(&lead, &env), RouteOutcome::NotFound);

        let got = drain(&mut lead_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, Kind::Nack);
        let p: NackPayload = got[0].payload_as().unwrap();
        assert_eq!(p.code, ErrorCode::NotFound);
        assert_eq!(p.ack_id.as_deref(), Some(env.id.as_str()));
    }

    #[test]
    fn self_send_is_permitted() {
        let fx = Fixture::new();
        let (lead, mut lead_rx) = fx.agent(1, "Lead");

        let env = send_env("Lead", "note to self");
        assert_eq!(fx.router.route_send(&lead, &env), RouteOutcome::Delivered);
        let got = drain(&mut lead_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, Kind::Deliver);
    }

    #[test]
    fn broadcast_excludes_sender_and_marks_original_to() {
        let fx = Fixture::new();
        let (a, mut a_rx) = fx.agent(1, "A");
        let (_b, mut b_rx) = fx.agent(2, "B");
        let (_c, mut c_rx) = fx.agent(3, "C");

        let env = send_env(BROADCAST, "hi");
        assert_eq!(fx.router.route_send(&a, &env), RouteOutcome::Delivered);

        assert!(drain(&mut a_rx).is_empty(), "sender must not hear itself");
        for rx in [&mut b_rx, &mut c_rx] {
            let got = drain(rx);
            assert_eq!(got.len(), 1);
            assert_eq!(
                got[0].delivery.as_ref().unwrap().original_to.as_deref(),
                Some("*")
            );
        }
    }

    #[test]
    fn channel_join_requires_hash_prefix() {
        let fx = Fixture::new();
        let (a, mut a_rx) = fx.agent(1, "A");

        let env = Envelope::new(Kind::ChannelJoin).to("eng");
        fx.router.channel_join(&a, &env);

        let got = drain(&mut a_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, Kind::Error);
        let p: ErrorPayload = got[0].payload_as().unwrap();
        assert_eq!(p.code, ErrorCode::BadRequest);
        assert!(fx.router.channel_members("#eng").is_empty());
    }

    #[test]
    fn channel_fanout_excludes_sender() {
        let fx = Fixture::new();
        let (a, mut a_rx) = fx.agent(1, "A");
        let (b, mut b_rx) = fx.agent(2, "B");

        let join = Envelope::new(Kind::ChannelJoin).to("#eng");
        fx.router.channel_join(&a, &join);
        fx.router.channel_join(&b, &join);
        // Joining twice is idempotent.
        fx.router.channel_join(&b, &join);
        assert_eq!(fx.router.channel_members("#eng").len(), 2);

        let msg = Envelope::with_payload(
            Kind::ChannelMessage,
            &SendPayload {
                body: "ship it".into(),
                ..Default::default()
            },
        )
        .unwrap()
        .to("#eng");
        fx.router.channel_message(&a, &msg);

        assert!(drain(&mut a_rx).is_empty());
        let got = drain(&mut b_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, Kind::ChannelMessage);
        assert_eq!(got[0].from.as_deref(), Some("A"));
        assert_eq!(
            got[0].delivery.as_ref().unwrap().original_to.as_deref(),
            Some("#eng")
        );
    }

    #[test]
    fn send_to_channel_address_takes_the_channel_path() {
        let fx = Fixture::new();
        let (a, _a_rx) = fx.agent(1, "A");
        let (b, mut b_rx) = fx.agent(2, "B");

        let join = Envelope::new(Kind::ChannelJoin).to("#eng");
        fx.router.channel_join(&b, &join);

        let env = send_env("#eng", "via send");
        assert_eq!(fx.router.route_send(&a, &env), RouteOutcome::Delivered);
        let got = drain(&mut b_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, Kind::Deliver);
        assert_eq!(
            got[0].delivery.as_ref().unwrap().original_to.as_deref(),
            Some("#eng")
        );
    }

    #[test]
    fn channel_info_lists_members() {
        let fx = Fixture::new();
        let (a, mut a_rx) = fx.agent(1, "A");
        let (b, _b_rx) = fx.agent(2, "B");

        let join = Envelope::new(Kind::ChannelJoin).to("#eng");
        fx.router.channel_join(&a, &join);
        fx.router.channel_join(&b, &join);

        fx.router
            .channel_info(&a, &Envelope::new(Kind::ChannelInfo).to("#eng"));
        let got = drain(&mut a_rx);
        assert_eq!(got.len(), 1);
        let p: ChannelMembersPayload = got[0].payload_as().unwrap();
        assert_eq!(p.channel, "#eng");
        let mut members = p.members;
        members.sort();
        assert_eq!(members, vec!["A", "B"]);
    }

    #[test]
    fn topic_publish_reaches_subscribers_not_sender() {
        let fx = Fixture::new();
        let (a, mut a_rx) = fx.agent(1, "A");
        let (b, mut b_rx) = fx.agent(2, "B");

        let sub = Envelope::new(Kind::Subscribe).on_topic("builds");
        fx.router.subscribe(&a, &sub);
        fx.router.subscribe(&b, &sub);

        let env = send_env("", "build green").on_topic("builds");
        let n = fx.router.publish_topic(&a, &env);
        assert_eq!(n, 1);
        assert!(drain(&mut a_rx).is_empty());
        let got = drain(&mut b_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, Kind::Deliver);
        assert_eq!(got[0].topic.as_deref(), Some("builds"));
    }

    #[test]
    fn unsubscribe_stops_fanout() {
        let fx = Fixture::new();
        let (a, _a_rx) = fx.agent(1, "A");
        let (b, mut b_rx) = fx.agent(2, "B");

        let sub = Envelope::new(Kind::Subscribe).on_topic("builds");
        fx.router.subscribe(&b, &sub);
        fx.router
            .unsubscribe(&b, &Envelope::new(Kind::Unsubscribe).on_topic("builds"));

        let env = send_env("", "gone").on_topic("builds");
        assert_eq!(fx.router.publish_topic(&a, &env), 0);
        assert!(drain(&mut b_rx).is_empty());
    }

    #[test]
    fn shadow_receives_incoming_copy() {
        let fx = Fixture::new();
        let (lead, _lead_rx) = fx.agent(1, "Lead");
        let (_worker, mut worker_rx) = fx.agent(2, "Worker");
        let (observer, mut observer_rx) = fx.agent(3, "Observer");

        fx.router.shadow_bind(
            &observer,
            ShadowBindPayload {
                primary: "Worker".into(),
                triggers: vec![],
                receive_incoming: true,
                receive_outgoing: true,
            },
        );

        let env = send_env("Worker", "task");
        fx.router.route_send(&lead, &env);

        assert_eq!(drain(&mut worker_rx).len(), 1);
        let got = drain(&mut observer_rx);
        assert_eq!(got.len(), 1, "shadow copy expected");
        assert_eq!(got[0].kind, Kind::Deliver);
        assert_eq!(got[0].from.as_deref(), Some("Lead"));
        // The copy keeps the original addressing so the shadow can tell who
        // the delivery was for.
        assert_eq!(got[0].to.as_deref(), Some("Worker"));
    }

    #[test]
    fn shadow_outgoing_flag_gates_sender_side_copies() {
        let fx = Fixture::new();
        let (lead, _lead_rx) = fx.agent(1, "Lead");
        let (_worker, _worker_rx) = fx.agent(2, "Worker");
        let (observer, mut observer_rx) = fx.agent(3, "Observer");

        fx.router.shadow_bind(
            &observer,
            ShadowBindPayload {
                primary: "Lead".into(),
                triggers: vec![],
                receive_incoming: true,
                receive_outgoing: false,
            },
        );

        fx.router.route_send(&lead, &send_env("Worker", "x"));
        assert!(
            drain(&mut observer_rx).is_empty(),
            "outgoing copies are disabled for this binding"
        );
    }

    #[test]
    fn shadow_trigger_filter_matches_data_hint() {
        let fx = Fixture::new();
        let (lead, _lead_rx) = fx.agent(1, "Lead");
        let (_worker, _worker_rx) = fx.agent(2, "Worker");
        let (observer, mut observer_rx) = fx.agent(3, "Observer");

        fx.router.shadow_bind(
            &observer,
            ShadowBindPayload {
                primary: "Worker".into(),
                triggers: vec![ShadowTrigger::CodeWritten],
                receive_incoming: true,
                receive_outgoing: true,
            },
        );

        // No hint: filtered out.
        fx.router.route_send(&lead, &send_env("Worker", "plain"));
        assert!(drain(&mut observer_rx).is_empty());

        // Matching hint: copied.
        let env = Envelope::with_payload(
            Kind::Send,
            &SendPayload {
                body: "wrote the parser".into(),
                data: Some(serde_json::json!({"trigger": "code_written"})),
                ..Default::default()
            },
        )
        .unwrap()
        .to("Worker");
        fx.router.route_send(&lead, &env);
        assert_eq!(drain(&mut observer_rx).len(), 1);
    }

    #[test]
    fn purge_removes_all_membership() {
        let fx = Fixture::new();
        let (a, _a_rx) = fx.agent(1, "A");
        let (b, mut b_rx) = fx.agent(2, "B");

        fx.router
            .channel_join(&b, &Envelope::new(Kind::ChannelJoin).to("#eng"));
        fx.router
            .subscribe(&b, &Envelope::new(Kind::Subscribe).on_topic("builds"));
        fx.router.shadow_bind(
            &b,
            ShadowBindPayload {
                primary: "A".into(),
                triggers: vec![],
                receive_incoming: true,
                receive_outgoing: true,
            },
        );

        fx.router.purge(&b);

        assert!(fx.router.channel_members("#eng").is_empty());
        let env = send_env("", "x").on_topic("builds");
        assert_eq!(fx.router.publish_topic(&a, &env), 0);
        fx.router.route_send(&a, &send_env("A", "self"));
        // Only the self-delivery, no shadow copy to B.
        assert!(drain(&mut b_rx).is_empty());
    }
}
