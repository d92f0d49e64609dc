// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Optional TCP+TLS listener support for network deployments.
//!
//! Builds the rustls server configuration from PEM files: server certificate
//! chain and key, plus an optional client CA bundle. When a CA is configured,
//! clients must present a certificate that chains to it; the certificate's
//! common name can additionally be matched against an allow-list.

use std::{io::BufReader, path::Path, sync::Arc};

use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    RootCertStore, ServerConfig,
};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tracing::debug;

use crate::config::TlsConfig;
use crate::error::RelayError;

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, RelayError> {
    let file = std::fs::File::open(path)
        .map_err(|e| RelayError::Tls(format!("open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RelayError::Tls(format!("parse {}: {e}", path.display())))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, RelayError> {
    let file = std::fs::File::open(path)
        .map_err(|e| RelayError::Tls(format!("open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| RelayError::Tls(format!("parse {}: {e}", path.display())))?
        .ok_or_else(|| RelayError::Tls(format!("no private key in {}", path.display())))
}

/// Assemble the rustls server config for the daemon's TLS listener.
pub fn build_server_config(cfg: &TlsConfig) -> Result<Arc<ServerConfig>, RelayError> {
    let certs = load_certs(&cfg.cert)?;
    let key = load_key(&cfg.key)?;

    let builder = ServerConfig::builder();
    let config = if let Some(ca_path) = &cfg.client_ca {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots
                .add(cert)
                .map_err(|e| RelayError::Tls(format!("client CA: {e}")))?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| RelayError::Tls(format!("client verifier: {e}")))?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| RelayError::Tls(e.to_string()))?
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| RelayError::Tls(e.to_string()))?
    };

    Ok(Arc::new(config))
}

/// Common name of the validated client certificate, if one was presented.
pub fn client_common_name(stream: &TlsStream<TcpStream>) -> Option<String> {
    let (_, session) = stream.get_ref();
    let certs = session.peer_certificates()?;
    let leaf = certs.first()?;
    let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref()).ok()?;
    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string());
    debug!(cn = ?cn, "TLS client certificate");
    cn
}

/// Enforce the configured common-name allow-list against a completed TLS
/// session. An empty list accepts any validated client.
pub fn check_allowed_cn(cfg: &TlsConfig, stream: &TlsStream<TcpStream>) -> Result<Option<String>, RelayError> {
    let cn = client_common_name(stream);
    if cfg.allowed_cns.is_empty() {
        return Ok(cn);
    }
    match &cn {
        Some(name) if cfg.allowed_cns.iter().any(|a| a == name) => Ok(cn),
        Some(name) => Err(RelayError::Unauthorized(format!(
            "client CN {name:?} not in allow-list"
        ))),
        None => Err(RelayError::Unauthorized(
            "client certificate required by allow-list".into(),
        )),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
