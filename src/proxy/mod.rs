//! The capture proxy: accept loop, connection handling and relaying.

pub mod body;
pub mod handler;
pub mod tunnel;
pub(crate) mod upstream;

pub use handler::ConnectionHandler;

use crate::ca::CertificateAuthority;
use crate::capture::{CaptureStore, HostFilter};
use crate::config::ProxyConfig;
use crate::state::StatsCollector;
use rustls::ClientConfig;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Pause after an accept error that is not tied to a single connection
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a connection needs, shared by all connections of one run.
pub struct ProxyContext {
    pub config: Arc<ProxyConfig>,
    /// Present only while HTTPS interception is enabled
    pub ca: Option<Arc<CertificateAuthority>>,
    pub host_filter: Arc<HostFilter>,
    pub store: Arc<CaptureStore>,
    pub stats: Arc<StatsCollector>,
    pub upstream_tls: Arc<ClientConfig>,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
}

pub struct ProxyServer {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
}

impl ProxyServer {
    pub fn new(listener: TcpListener, ctx: Arc<ProxyContext>) -> Self {
        Self { listener, ctx }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until cancelled. The listener is closed on return.
    pub async fn run(self) {
        let cancel = self.ctx.cancel.clone();
        tracing::debug!(addr = ?self.listener.local_addr().ok(), "Accept loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let handler = ConnectionHandler::new(self.ctx.clone(), peer);
                        self.ctx.tracker.spawn(handler.run(stream));
                    }
                    Err(e) if is_connection_error(&e) => {
                        tracing::debug!(error = %e, "Dropped connection during accept");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed, backing off");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                },
            }
        }

        tracing::debug!("Accept loop stopped");
    }
}

/// Errors that concern one connection rather than the listening socket.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
