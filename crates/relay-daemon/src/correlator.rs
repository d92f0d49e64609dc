// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Request/reply matching for blocking sends.
//!
//! A SEND whose meta carries `sync.blocking = true` registers a pending entry
//! keyed by its correlation id. The first ACK bearing that id wins: the
//! correlator forwards a tailored ACK to the original sender and the entry is
//! gone. If the per-entry timer fires first, the sender gets
//! `ERROR{INTERNAL, "ACK timeout"}` instead. Exactly one of the two happens
//! while the sender stays connected; a sender disconnect cancels its entries
//! silently.
//!
//! The correlator only matches replies. Per-hop delivery reliability is the
//! write queue's business; the ACK here is end-to-end, produced by the
//! replying agent.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use relay_proto::{AckPayload, Envelope, ErrorCode, ErrorPayload, Kind};

use crate::connection::{ConnId, Connection};

struct Pending {
    sender: Weak<Connection>,
    sender_conn_id: ConnId,
    timer: JoinHandle<()>,
    started_ms: i64,
}

pub struct SyncCorrelator {
    pending: Arc<Mutex<HashMap<String, Pending>>>,
    default_timeout_ms: u64,
}

impl SyncCorrelator {
    pub fn new(default_timeout_ms: u64) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            default_timeout_ms,
        }
    }

    /// Track a blocking SEND. The timer fires unless a matching ACK (or an
    /// explicit cancel) removes the entry first.
    pub fn register(
        &self,
        sender: &Arc<Connection>,
        correlation_id: String,
        timeout_ms: Option<u64>,
    ) {
        let timeout = timeout_ms.unwrap_or(self.default_timeout_ms);
        let pending = Arc::clone(&self.pending);
        let cid = correlation_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout)).await;
            let entry = {
                let mut map = pending.lock().unwrap_or_else(|e| e.into_inner());
                map.remove(&cid)
            };
            let Some(entry) = entry else {
                return;
            };
            let Some(sender) = entry.sender.upgrade() else {
                return;
            };
            debug!(correlation_id = %cid, timeout_ms = timeout, "blocking send timed out");
            match Envelope::with_payload(
                Kind::Error,
                &ErrorPayload {
                    code: ErrorCode::Internal,
                    message: "ACK timeout".to_string(),
                    fatal: false,
                },
            ) {
                Ok(mut err) => {
                    err.to = sender.agent_name();
                    sender.send_control(err);
                }
                Err(e) => warn!(error = %e, "failed to encode timeout ERROR"),
            }
        });

        let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = map.insert(
            correlation_id.clone(),
            Pending {
                sender: Arc::downgrade(sender),
                sender_conn_id: sender.id(),
                timer,
                started_ms: relay_proto::envelope::now_ms(),
            },
        ) {
            // A reused correlation id supersedes its predecessor.
            warn!(correlation_id = %correlation_id, "correlation id reused while pending");
            old.timer.abort();
        }
    }

    /// Drop a pending entry whose SEND never made it out (the NACK the
    /// sender already received is the outcome).
    pub fn cancel(&self, correlation_id: &str) {
        let removed = {
            let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            map.remove(correlation_id)
        };
        if let Some(entry) = removed {
            entry.timer.abort();
        }
    }

    /// Feed an inbound ACK. Returns true when it settled a pending entry, in
    /// which case a tailored ACK was forwarded to the original sender.
    /// Unknown or duplicate correlation ids are ignored.
    pub fn on_ack(&self, replier: Option<String>, ack: &AckPayload) -> bool {
        let Some(cid) = ack.correlation_id.as_deref() else {
            return false;
        };
        let entry = {
            let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            map.remove(cid)
        };
        let Some(entry) = entry else {
            trace!(correlation_id = cid, "ACK for unknown correlation id ignored");
            return false;
        };
        entry.timer.abort();
        let Some(sender) = entry.sender.upgrade() else {
            return false;
        };

        let elapsed_ms = relay_proto::envelope::now_ms() - entry.started_ms;
        debug!(correlation_id = cid, elapsed_ms, "blocking send acknowledged");

        match Envelope::with_payload(
            Kind::Ack,
            &AckPayload {
                ack_id: ack.ack_id.clone(),
                correlation_id: Some(cid.to_string()),
                response: Some(ack.response.unwrap_or(true)),
                response_data: ack.response_data.clone(),
                ..Default::default()
            },
        ) {
            Ok(mut fwd) => {
                fwd.from = replier;
                fwd.to = sender.agent_name();
                sender.send_control(fwd);
            }
            Err(e) => warn!(error = %e, "failed to encode forwarded ACK"),
        }
        true
    }

    /// A sender disconnected: cancel all of its pending entries without
    /// notification.
    pub fn purge_connection(&self, conn_id: ConnId) {
        let removed: Vec<Pending> = {
            let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = map
                .iter()
                .filter(|(_, p)| p.sender_conn_id == conn_id)
                .map(|(k, _)| k.clone())
                .collect();
            ids.into_iter().filter_map(|id| map.remove(&id)).collect()
        };
        for entry in &removed {
            entry.timer.abort();
        }
        if !removed.is_empty() {
            debug!(conn = conn_id, count = removed.len(), "purged pending blocking sends");
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{AgentInfo, ConnPeer, ConnState, ConnTuning, WriteCmd};
    use relay_proto::HelloPayload;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn agent(id: u64, name: &str) -> (Arc<Connection>, mpsc::UnboundedReceiver<WriteCmd>) {
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
        (conn, rx)
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

    #[tokio::test(start_paused = true)]
    async fn timeout_sends_error_exactly_once() {
        let correlator = SyncCorrelator::new(30_000);
        let (sender, mut rx) = agent(1, "Lead");

        correlator.register(&sender, "c1".into(), Some(1000));
        assert_eq!(correlator.pending_len(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        // Let the timer task run to completion.
        tokio::task::yield_now().await;

        let got = drain(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, Kind::Error);
        let p: ErrorPayload = got[0].payload_as().unwrap();
        assert_eq!(p.code, ErrorCode::Internal);
        assert_eq!(p.message, "ACK timeout");
        assert!(!p.fatal);
        assert_eq!(correlator.pending_len(), 0);

        // A late ACK after the timeout is ignored.
        assert!(!correlator.on_ack(
            Some("Worker".into()),
            &AckPayload {
                correlation_id: Some("c1".into()),
                ..Default::default()
            }
        ));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ack_forwards_response_and_cancels_timer() {
        let correlator = SyncCorrelator::new(30_000);
        let (sender, mut rx) = agent(1, "Lead");

        correlator.register(&sender, "c1".into(), Some(1000));
        let matched = correlator.on_ack(
            Some("Worker".into()),
            &AckPayload {
                ack_id: Some("m2".into()),
                correlation_id: Some("c1".into()),
                response: Some(true),
                response_data: Some(serde_json::json!("pong")),
                ..Default::default()
            },
        );
        assert!(matched);

        let got = drain(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, Kind::Ack);
        assert_eq!(got[0].from.as_deref(), Some("Worker"));
        let p: AckPayload = got[0].payload_as().unwrap();
        assert_eq!(p.correlation_id.as_deref(), Some("c1"));
        assert_eq!(p.response, Some(true));
        assert_eq!(p.response_data, Some(serde_json::json!("pong")));

        // Past the deadline: no ERROR may follow the ACK.
        tokio::time::sleep(Duration::from_millis(2000)).await;
        tokio::task::yield_now().await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_ack_is_ignored() {
        let correlator = SyncCorrelator::new(30_000);
        let (sender, mut rx) = agent(1, "Lead");

        correlator.register(&sender, "c1".into(), None);
        let ack = AckPayload {
            correlation_id: Some("c1".into()),
            ..Default::default()
        };
        assert!(correlator.on_ack(Some("Worker".into()), &ack));
        assert!(!correlator.on_ack(Some("Worker".into()), &ack));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sender_disconnect_purges_silently() {
        let correlator = SyncCorrelator::new(30_000);
        let (sender, mut rx) = agent(7, "Lead");

        correlator.register(&sender, "c1".into(), Some(500));
        correlator.register(&sender, "c2".into(), Some(500));
        assert_eq!(correlator.pending_len(), 2);

        correlator.purge_connection(7);
        assert_eq!(correlator.pending_len(), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        tokio::task::yield_now().await;
        assert!(drain(&mut rx).is_empty(), "no notification after purge");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_entry_without_error() {
        let correlator = SyncCorrelator::new(30_000);
        let (sender, mut rx) = agent(1, "Lead");

        correlator.register(&sender, "c1".into(), Some(500));
        correlator.cancel("c1");
        assert_eq!(correlator.pending_len(), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        tokio::task::yield_now().await;
        assert!(drain(&mut rx).is_empty());
    }
}
