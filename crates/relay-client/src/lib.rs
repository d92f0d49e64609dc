// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Minimal wire client for the agent-relay daemon.
//!
//! Implements the client side of the framed envelope protocol: connect,
//! HELLO/WELCOME handshake, sends, acknowledgments, channel / pub-sub /
//! shadow / spawn helpers. Daemon heartbeat PINGs are answered transparently
//! inside [`RelayClient::recv`]; everything else is surfaced to the caller.
//!
//! This is the client the `agent-relay send` and `agent-relay status`
//! commands use, and the harness the daemon's integration suite drives.
//!
//! ```no_run
//! # async fn demo() -> Result<(), relay_client::ClientError> {
//! use relay_client::RelayClient;
//!
//! let mut client = RelayClient::connect("/run/user/1000/agent-relay.sock").await?;
//! let welcome = client.hello("Lead").await?;
//! println!("session {}", welcome.session_id);
//! client.send_message("Worker", "go").await?;
//! # Ok(())
//! # }
//! ```

use std::{collections::VecDeque, path::Path, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        unix::{OwnedReadHalf, OwnedWriteHalf},
        UnixStream,
    },
};
use tracing::trace;

use relay_proto::{
    encode_frame_with_limit, AckPayload, Envelope, ErrorPayload, FrameDecoder, HelloPayload,
    Kind, PayloadMeta, PingPayload, PongPayload, ReleasePayload, SendPayload, ShadowBindPayload,
    SpawnPayload, SyncMeta, WelcomePayload, WireFormat, DEFAULT_MAX_FRAME_BYTES,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Proto(#[from] relay_proto::ProtoError),

    #[error("connection closed by daemon")]
    Closed,

    #[error("handshake failed: {0}")]
    Handshake(String),
}

pub struct RelayClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    decoder: FrameDecoder,
    queue: VecDeque<Envelope>,
    format: WireFormat,
    agent: Option<String>,
    welcome: Option<WelcomePayload>,
}

impl RelayClient {
    /// Connect over the Unix socket, speaking JSON frames.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        Self::connect_with_format(path, WireFormat::Json).await
    }

    /// Connect with an explicit wire format (JSON or MessagePack).
    pub async fn connect_with_format(
        path: impl AsRef<Path>,
        format: WireFormat,
    ) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader,
            writer,
            decoder: FrameDecoder::new(DEFAULT_MAX_FRAME_BYTES),
            queue: VecDeque::new(),
            format,
            agent: None,
            welcome: None,
        })
    }

    /// Perform the handshake under `name` and return the WELCOME.
    pub async fn hello(&mut self, name: impl Into<String>) -> Result<WelcomePayload, ClientError> {
        self.hello_with(HelloPayload {
            agent: name.into(),
            ..Default::default()
        })
        .await
    }

    /// Handshake with full identity metadata.
    pub async fn hello_with(
        &mut self,
        payload: HelloPayload,
    ) -> Result<WelcomePayload, ClientError> {
        let name = payload.agent.clone();
        let env = Envelope::with_payload(Kind::Hello, &payload)?;
        self.send_envelope(&env).await?;

        loop {
            let reply = self.recv_raw().await?;
            match reply.kind {
                Kind::Welcome => {
                    let welcome: WelcomePayload = reply.payload_as()?;
                    self.agent = Some(name);
                    self.welcome = Some(welcome.clone());
                    return Ok(welcome);
                }
                Kind::Error => {
                    let p: ErrorPayload = reply
                        .payload_as()
                        .unwrap_or_else(|_| ErrorPayload {
                            code: relay_proto::ErrorCode::Internal,
                            message: "unreadable error".into(),
                            fatal: true,
                        });
                    return Err(ClientError::Handshake(p.message));
                }
                other => trace!(kind = ?other, "ignoring pre-welcome envelope"),
            }
        }
    }

    pub fn agent_name(&self) -> Option<&str> {
        self.agent.as_deref()
    }

    pub fn welcome(&self) -> Option<&WelcomePayload> {
        self.welcome.as_ref()
    }

    /// Write one envelope as a frame in this client's format.
    pub async fn send_envelope(&mut self, env: &Envelope) -> Result<(), ClientError> {
        let frame = encode_frame_with_limit(env, self.format, DEFAULT_MAX_FRAME_BYTES)?;
        self.writer.write_all(&frame).await?;
        Ok(())
    }

    /// Direct (or `"*"` broadcast) message. Returns the envelope id.
    pub async fn send_message(
        &mut self,
        to: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<String, ClientError> {
        let env = Envelope::with_payload(
            Kind::Send,
            &SendPayload {
                body: body.into(),
                ..Default::default()
            },
        )?
        .to(to);
        self.send_envelope(&env).await?;
        Ok(env.id)
    }

    /// Blocking send: the daemon will forward the matching ACK or time out
    /// with an ERROR. Returns the envelope id.
    pub async fn send_blocking(
        &mut self,
        to: impl Into<String>,
        body: impl Into<String>,
        correlation_id: impl Into<String>,
        timeout_ms: u64,
    ) -> Result<String, ClientError> {
        let env = Envelope::with_payload(
            Kind::Send,
            &SendPayload {
                body: body.into(),
                ..Default::default()
            },
        )?
        .to(to)
        .with_meta(PayloadMeta {
            requires_ack: Some(true),
            sync: Some(SyncMeta {
                correlation_id: correlation_id.into(),
                timeout_ms: Some(timeout_ms),
                blocking: true,
            }),
            ..Default::default()
        });
        self.send_envelope(&env).await?;
        Ok(env.id)
    }

    pub async fn ack(&mut self, payload: AckPayload) -> Result<(), ClientError> {
        let env = Envelope::with_payload(Kind::Ack, &payload)?;
        self.send_envelope(&env).await?;
        Ok(())
    }

    /// Acknowledge a received DELIVER by id and sequence.
    pub async fn ack_deliver(&mut self, deliver: &Envelope) -> Result<(), ClientError> {
        self.ack(AckPayload {
            ack_id: Some(deliver.id.clone()),
            seq: deliver.delivery.as_ref().map(|d| d.seq),
            ..Default::default()
        })
        .await
    }

    pub async fn join_channel(&mut self, channel: impl Into<String>) -> Result<(), ClientError> {
        let env = Envelope::new(Kind::ChannelJoin).to(channel);
        self.send_envelope(&env).await
    }

    pub async fn leave_channel(&mut self, channel: impl Into<String>) -> Result<(), ClientError> {
        let env = Envelope::new(Kind::ChannelLeave).to(channel);
        self.send_envelope(&env).await
    }

    pub async fn channel_message(
        &mut self,
        channel: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<String, ClientError> {
        let env = Envelope::with_payload(
            Kind::ChannelMessage,
            &SendPayload {
                body: body.into(),
                ..Default::default()
            },
        )?
        .to(channel);
        self.send_envelope(&env).await?;
        Ok(env.id)
    }

    pub async fn channel_info(&mut self, channel: impl Into<String>) -> Result<(), ClientError> {
        let env = Envelope::new(Kind::ChannelInfo).to(channel);
        self.send_envelope(&env).await
    }

    pub async fn subscribe(&mut self, topic: impl Into<String>) -> Result<(), ClientError> {
        let env = Envelope::new(Kind::Subscribe).on_topic(topic);
        self.send_envelope(&env).await
    }

    pub async fn unsubscribe(&mut self, topic: impl Into<String>) -> Result<(), ClientError> {
        let env = Envelope::new(Kind::Unsubscribe).on_topic(topic);
        self.send_envelope(&env).await
    }

    pub async fn shadow_bind(&mut self, payload: ShadowBindPayload) -> Result<(), ClientError> {
        let env = Envelope::with_payload(Kind::ShadowBind, &payload)?;
        self.send_envelope(&env).await
    }

    /// Ask the daemon to spawn a worker. Returns the SPAWN envelope id, which
    /// the SPAWN_RESULT echoes in `reply_to`.
    pub async fn spawn(&mut self, payload: SpawnPayload) -> Result<String, ClientError> {
        let env = Envelope::with_payload(Kind::Spawn, &payload)?;
        self.send_envelope(&env).await?;
        Ok(env.id)
    }

    pub async fn release(&mut self, name: impl Into<String>) -> Result<String, ClientError> {
        let env = Envelope::with_payload(
            Kind::Release,
            &ReleasePayload { name: name.into() },
        )?;
        self.send_envelope(&env).await?;
        Ok(env.id)
    }

    /// Orderly goodbye; the daemon closes the connection.
    pub async fn bye(&mut self) -> Result<(), ClientError> {
        let env = Envelope::new(Kind::Bye);
        self.send_envelope(&env).await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Next envelope from the daemon. Heartbeat PINGs are answered with PONG
    /// and not surfaced.
    pub async fn recv(&mut self) -> Result<Envelope, ClientError> {
        loop {
            let env = self.recv_raw().await?;
            if env.kind == Kind::Ping {
                let nonce = env
                    .payload_as::<PingPayload>()
                    .map(|p| p.nonce)
                    .unwrap_or_default();
                let pong = Envelope::with_payload(Kind::Pong, &PongPayload { nonce })?;
                self.send_envelope(&pong).await?;
                continue;
            }
            return Ok(env);
        }
    }

    /// As [`recv`](Self::recv), bounded by a deadline. `Ok(None)` on timeout.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Envelope>, ClientError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(res) => res.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Next envelope with no transparent PING handling.
    pub async fn recv_raw(&mut self) -> Result<Envelope, ClientError> {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(env) = self.queue.pop_front() {
                return Ok(env);
            }
            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                return Err(ClientError::Closed);
            }
            self.queue.extend(self.decoder.push(&buf[..n])?);
        }
    }
}
