// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! File-based ingress for clients that cannot hold a socket.
//!
//! A watched directory accepts YAML op files; each file synthesizes one
//! envelope that runs through the normal dispatch path, attributed to a sink
//! connection carrying the file's `from` name. Processed files are removed;
//! malformed files are renamed `<name>.err` so they stop retriggering.
//!
//! ```yaml
//! op: send
//! from: FileBot
//! to: Lead
//! body: build finished
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_proto::{
    Envelope, Kind, MessageKind, ReleasePayload, SendPayload, SpawnPayload,
};

use crate::error::RelayError;
use crate::server::RelayCore;

/// One synthesized operation per outbox file.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum OutboxOp {
    Send {
        from: String,
        #[serde(default)]
        to: Option<String>,
        body: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default)]
        data: Option<serde_json::Value>,
        #[serde(default)]
        topic: Option<String>,
    },
    Spawn {
        from: String,
        name: String,
        cli: String,
        task: String,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        team: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Release {
        from: String,
        name: String,
    },
}

impl OutboxOp {
    pub fn from_name(&self) -> &str {
        match self {
            OutboxOp::Send { from, .. }
            | OutboxOp::Spawn { from, .. }
            | OutboxOp::Release { from, .. } => from,
        }
    }
}

pub fn parse_op(text: &str) -> Result<OutboxOp, RelayError> {
    serde_yaml::from_str(text).map_err(|e| RelayError::Config(format!("outbox file: {e}")))
}

/// Turn a parsed op into the envelope the dispatch path expects.
pub fn build_envelope(op: &OutboxOp) -> Result<Envelope, RelayError> {
    let env = match op {
        OutboxOp::Send {
            to,
            body,
            kind,
            data,
            topic,
            ..
        } => {
            let mut env = Envelope::with_payload(
                Kind::Send,
                &SendPayload {
                    kind: *kind,
                    body: body.clone(),
                    data: data.clone(),
                    thread_id: None,
                },
            )
            .map_err(RelayError::Proto)?;
            env.to = to.clone();
            env.topic = topic.clone();
            env
        }
        OutboxOp::Spawn {
            from,
            name,
            cli,
            task,
            cwd,
            team,
            model,
        } => Envelope::with_payload(
            Kind::Spawn,
            &SpawnPayload {
                name: name.clone(),
                cli: cli.clone(),
                task: task.clone(),
                cwd: cwd.clone(),
                team: team.clone(),
                spawner_name: Some(from.clone()),
                model: model.clone(),
                shadow_of: None,
                shadow_speak_on: vec![],
            },
        )
        .map_err(RelayError::Proto)?,
        OutboxOp::Release { name, .. } => Envelope::with_payload(
            Kind::Release,
            &ReleasePayload { name: name.clone() },
        )
        .map_err(RelayError::Proto)?,
    };
    Ok(env)
}

/// Watch `dir` until cancelled, feeding synthesized envelopes into the
/// daemon's dispatch path.
pub async fn run_outbox(
    dir: PathBuf,
    core: Arc<RelayCore>,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    std::fs::create_dir_all(&dir)?;
    info!(dir = %dir.display(), "outbox ingress watching");

    let (tx, mut rx) = mpsc::channel::<notify::Result<Event>>(64);
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.blocking_send(res);
    })
    .map_err(|e| RelayError::Config(format!("outbox watcher: {e}")))?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| RelayError::Config(format!("outbox watch {}: {e}", dir.display())))?;

    // Pick up files written while the daemon was down.
    let mut startup: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_op_file(p))
        .collect();
    startup.sort();
    for path in startup {
        process_file(&path, &core).await;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(Ok(event)) => {
                    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        continue;
                    }
                    for path in event.paths.iter().filter(|p| is_op_file(p)) {
                        process_file(path, &core).await;
                    }
                }
                Some(Err(e)) => warn!(error = %e, "outbox watch error"),
                None => break,
            },
        }
    }
    Ok(())
}

fn is_op_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("yaml")
}

async fn process_file(path: &Path, core: &Arc<RelayCore>) {
    // The writer may still be mid-write on the Create event; a file that
    // vanished or is unreadable will come around again on Modify.
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return,
    };
    match parse_op(&text).and_then(|op| Ok((build_envelope(&op)?, op))) {
        Ok((env, op)) => {
            debug!(path = %path.display(), from = op.from_name(), kind = ?env.kind, "outbox op");
            core.inject(op.from_name(), env).await;
            let _ = std::fs::remove_file(path);
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed outbox file");
            let _ = std::fs::rename(path, path.with_extension("err"));
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_send_op() {
        let op = parse_op("op: send\nfrom: FileBot\nto: Lead\nbody: hello\n").unwrap();
        match &op {
            OutboxOp::Send { from, to, body, .. } => {
                assert_eq!(from, "FileBot");
                assert_eq!(to.as_deref(), Some("Lead"));
                assert_eq!(body, "hello");
            }
            other => panic!("wrong op: {other:?}"),
        }
        let env = build_envelope(&op).unwrap();
        assert_eq!(env.kind, Kind::Send);
        assert_eq!(env.to.as_deref(), Some("Lead"));
    }

    #[test]
    fn parse_spawn_op_carries_spawner() {
        let op =
            parse_op("op: spawn\nfrom: FileBot\nname: W1\ncli: claude\ntask: run tests\n")
                .unwrap();
        let env = build_envelope(&op).unwrap();
        assert_eq!(env.kind, Kind::Spawn);
        let p: SpawnPayload = env.payload_as().unwrap();
        assert_eq!(p.spawner_name.as_deref(), Some("FileBot"));
        assert_eq!(p.cli, "claude");
    }

    #[test]
    fn parse_release_op() {
        let op = parse_op("op: release\nfrom: FileBot\nname: W1\n").unwrap();
        let env = build_envelope(&op).unwrap();
        assert_eq!(env.kind, Kind::Release);
        let p: ReleasePayload = env.payload_as().unwrap();
        assert_eq!(p.name, "W1");
    }

    #[test]
    fn malformed_op_is_an_error() {
        assert!(parse_op("op: teleport\nfrom: X\n").is_err());
        assert!(parse_op("not yaml at all: [").is_err());
    }

    #[test]
    fn op_file_filter() {
        assert!(is_op_file(Path::new("/x/msg.yaml")));
        assert!(!is_op_file(Path::new("/x/msg.yaml.err")));
        assert!(!is_op_file(Path::new("/x/msg.txt")));
    }
}
