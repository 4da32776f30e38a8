//! Code port listener, one task per incoming stream.
//!
//! Each connection carries exactly one sealed unit and is read to EOF. The
//! bytes go to the [`SecureCodeLoader`] on the blocking pool so a slow or
//! failing unit never stalls the accept loop or other connections.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use ensemble_core::config::AccessMode;

use crate::loader::{CodeError, LoadOutcome, SecureCodeLoader};
use crate::netif;

/// How long a connection may take to deliver its unit and close.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CodeServer {
    listener: TcpListener,
    loader: Arc<SecureCodeLoader>,
    access: AccessMode,
    max_bytes: usize,
    read_timeout: Duration,
    local_addrs: HashSet<IpAddr>,
}

impl CodeServer {
    /// Bind the code port. `AccessMode::Closed` is not a valid server mode;
    /// callers skip starting the server instead.
    pub async fn bind(
        addr: SocketAddr,
        loader: Arc<SecureCodeLoader>,
        access: AccessMode,
        max_bytes: usize,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(access != AccessMode::Closed, "code access is closed");
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind code port {addr}"))?;

        let local_addrs = match netif::enumerate() {
            Ok(ifaces) => ifaces
                .into_iter()
                .filter_map(|i| i.addr.map(IpAddr::V4))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "could not enumerate local addresses, loopback only");
                HashSet::new()
            }
        };

        Ok(Self {
            listener,
            loader,
            access,
            max_bytes,
            read_timeout: DEFAULT_READ_TIMEOUT,
            local_addrs,
        })
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn admits(&self, peer: IpAddr) -> bool {
        match self.access {
            AccessMode::Open => true,
            AccessMode::Local => peer.is_loopback() || self.local_addrs.contains(&peer),
            AccessMode::Closed => false,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        tracing::info!(
            addr = %self.listener.local_addr()?,
            access = ?self.access,
            "code server listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("code server stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "code accept failed");
                            continue;
                        }
                    };
                    if !self.admits(peer.ip()) {
                        tracing::warn!(%peer, error = %CodeError::AccessDenied(peer.ip()), "code connection rejected");
                        drop(stream);
                        continue;
                    }
                    let loader = self.loader.clone();
                    let max_bytes = self.max_bytes;
                    let read_timeout = self.read_timeout;
                    tokio::spawn(async move {
                        match handle_connection(stream, loader, max_bytes, read_timeout).await {
                            Ok(outcome) => tracing::info!(%peer, ?outcome, "code unit processed"),
                            Err(e) => tracing::warn!(%peer, error = %e, "code unit discarded"),
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    loader: Arc<SecureCodeLoader>,
    max_bytes: usize,
    read_timeout: Duration,
) -> Result<LoadOutcome, CodeError> {
    let mut payload = Vec::new();
    let mut limited = (&mut stream).take(max_bytes as u64 + 1);
    match tokio::time::timeout(read_timeout, limited.read_to_end(&mut payload)).await {
        Ok(result) => {
            result?;
        }
        Err(_) => return Err(CodeError::ReadTimeout(read_timeout.as_millis() as u64)),
    }
    if payload.len() > max_bytes {
        return Err(CodeError::TooLarge(payload.len()));
    }
    tracing::debug!(bytes = payload.len(), "code unit received");

    tokio::task::spawn_blocking(move || loader.process(&payload))
        .await
        .map_err(|e| CodeError::Invocation {
            unit: "<unknown>".into(),
            reason: e.to_string(),
        })?
}
