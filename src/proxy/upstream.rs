//! Origin connections: dialing, TLS re-origination and single-request exchanges.

use super::body::ProxyBody;
use super::ProxyContext;
use crate::capture::Scheme;
use crate::error::ConnectionError;
use http::{Request, Response};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::io;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

/// Where a request is re-originated to
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Name verified against the upstream certificate
    pub server_name: String,
}

impl Target {
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            scheme: Scheme::Http,
            server_name: host.clone(),
            host,
            port,
        }
    }

    pub fn https(host: impl Into<String>, port: u16, server_name: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::Https,
            host: host.into(),
            port,
            server_name: server_name.into(),
        }
    }

    /// Value for the `Host` header
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

/// Connect to `host:port`, trying each resolved address in turn.
pub(crate) async fn dial(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, ConnectionError> {
    let dial_error = |source| ConnectionError::Dial {
        target: format!("{host}:{port}"),
        source,
    };

    let addrs = timeout(connect_timeout, lookup_host((host, port)))
        .await
        .map_err(|_| ConnectionError::Timeout("DNS lookup"))?
        .map_err(dial_error)?;

    let mut last_error = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                tracing::trace!(%addr, "Connected upstream");
                return Ok(stream);
            }
            Ok(Err(e)) => last_error = Some(e),
            Err(_) => {
                last_error = Some(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
            }
        }
    }

    Err(dial_error(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")
    })))
}

/// Send `request` over a fresh connection to `target` and return the response head.
///
/// The body keeps streaming from the connection task after this returns.
pub(crate) async fn send(
    ctx: &ProxyContext,
    target: &Target,
    request: Request<ProxyBody>,
) -> Result<Response<Incoming>, ConnectionError> {
    let timeouts = &ctx.config.timeouts;
    let stream = dial(&target.host, target.port, timeouts.connect()).await?;

    match target.scheme {
        Scheme::Http => exchange(ctx, TokioIo::new(stream), request).await,
        Scheme::Https => {
            let server_name = ServerName::try_from(target.server_name.clone())
                .map_err(|_| ConnectionError::ServerName(target.server_name.clone()))?;
            let connector = TlsConnector::from(ctx.upstream_tls.clone());
            let tls = timeout(timeouts.handshake(), connector.connect(server_name, stream))
                .await
                .map_err(|_| ConnectionError::Timeout("upstream TLS handshake"))?
                .map_err(ConnectionError::Tls)?;
            exchange(ctx, TokioIo::new(tls), request).await
        }
    }
}

async fn exchange<I>(
    ctx: &ProxyContext,
    io: I,
    request: Request<ProxyBody>,
) -> Result<Response<Incoming>, ConnectionError>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    ctx.tracker.spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "Upstream connection closed with error");
        }
    });

    let response = timeout(ctx.config.timeouts.response(), sender.send_request(request))
        .await
        .map_err(|_| ConnectionError::Timeout("upstream response"))??;
    Ok(response)
}
