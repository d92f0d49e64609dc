// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Proto(#[from] relay_proto::ProtoError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("daemon already running (pid {pid})")]
    AlreadyRunning { pid: i32 },

    #[error("launcher error: {0}")]
    Launcher(String),

    #[error("peer not authorized: {0}")]
    Unauthorized(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("connection closed")]
    ConnectionClosed,
}
