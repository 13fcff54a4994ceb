//! Per-connection request handling.
//!
//! Every accepted socket is served as HTTP/1.1 with upgrades enabled. A plain
//! request is forwarded to its origin; a CONNECT request either becomes a raw
//! byte pipe or is TLS-terminated with a minted leaf so the requests inside
//! can be captured.

use super::body::{self, shared_preview, CaptureRecorder, ProxyBody, TappedBody};
use super::tunnel;
use super::upstream::{self, Target};
use super::ProxyContext;
use crate::capture::entry::headers_from;
use crate::capture::filter::strip_port;
use crate::capture::CaptureEntry;
use crate::error::ConnectionError;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::{service_fn, HttpService};
use hyper::upgrade::Upgraded;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::LazyConfigAcceptor;

/// Headers that describe a single hop and are never forwarded
const HOP_BY_HOP: [&str; 7] = [
    "proxy-connection",
    "proxy-authorization",
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "upgrade",
];

#[derive(Clone)]
pub struct ConnectionHandler {
    ctx: Arc<ProxyContext>,
    peer: SocketAddr,
}

impl ConnectionHandler {
    pub fn new(ctx: Arc<ProxyContext>, peer: SocketAddr) -> Self {
        Self { ctx, peer }
    }

    /// Serve one client connection until it closes or the proxy stops.
    pub async fn run(self, stream: TcpStream) {
        let stats = self.ctx.stats.clone();
        let _active = stats.connection_opened();
        tracing::trace!(peer = %self.peer, "Accepted connection");

        let this = self.clone();
        let service = service_fn(move |req| {
            let this = this.clone();
            async move { Ok::<_, Infallible>(this.dispatch(req).await) }
        });

        if let Err(e) = self.serve(TokioIo::new(stream), service).await {
            stats.record_connection_error();
            tracing::debug!(peer = %self.peer, error = %e, "Client connection ended with error");
        }
    }

    /// Drive an HTTP/1.1 server connection, shutting it down gracefully on cancel.
    async fn serve<I, S>(&self, io: I, service: S) -> Result<(), hyper::Error>
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
        S: HttpService<Incoming, ResBody = ProxyBody>,
        S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let conn = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(self.ctx.config.timeouts.header_read())
            .serve_connection(io, service)
            .with_upgrades();
        tokio::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => result,
            _ = self.ctx.cancel.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.as_mut().await
            }
        }
    }

    async fn dispatch(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            return self.connect(req).await;
        }

        let uri = req.uri();
        let authority = match (uri.scheme_str(), uri.authority()) {
            (Some("http"), Some(authority)) => authority,
            _ => {
                tracing::debug!(peer = %self.peer, uri = %uri, "Rejected non-proxy request");
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "termtap expects absolute-form proxy requests (http://host/path)\n",
                );
            }
        };

        let host = strip_port(authority.as_str()).to_string();
        let port = authority.port_u16().unwrap_or(80);
        let capture = self.ctx.host_filter.allowed(&host);
        self.forward(req, Target::http(host, port), capture).await
    }

    async fn connect(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let (host, port) = match parse_connect_target(req.uri()) {
            Ok(target) => target,
            Err(e) => {
                tracing::debug!(peer = %self.peer, error = %e, "Rejected CONNECT");
                let mut response = error_response(StatusCode::BAD_GATEWAY, format!("{e}\n"));
                response
                    .headers_mut()
                    .insert(header::CONNECTION, HeaderValue::from_static("close"));
                return response;
            }
        };

        let intercept = self.ctx.ca.is_some() && self.ctx.host_filter.allowed(&host);
        self.ctx.stats.record_tunnel(intercept);

        if intercept {
            let this = self.clone();
            self.ctx.tracker.spawn(async move {
                match hyper::upgrade::on(req).await {
                    Ok(upgraded) => {
                        if let Err(e) = this.intercept(upgraded, &host, port).await {
                            this.ctx.stats.record_connection_error();
                            tracing::debug!(%host, port, error = %e, "Intercepted tunnel failed");
                        }
                    }
                    Err(e) => tracing::debug!(%host, error = %e, "CONNECT upgrade failed"),
                }
            });
            return Response::new(body::empty());
        }

        // Dial before answering so an unreachable target gets a 502 instead of a dead tunnel.
        let upstream = match upstream::dial(&host, port, self.ctx.config.timeouts.connect()).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(%host, port, error = %e, "Tunnel dial failed");
                return error_response(StatusCode::BAD_GATEWAY, format!("{e}\n"));
            }
        };

        let this = self.clone();
        self.ctx.tracker.spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let ctx = &this.ctx;
                    let result = tunnel::relay(
                        TokioIo::new(upgraded),
                        upstream,
                        ctx.config.timeouts.idle(),
                        &ctx.cancel,
                        &ctx.tracker,
                    )
                    .await;
                    if let Err(e) = result {
                        tracing::debug!(%host, port, error = %e, "Tunnel relay ended with error");
                    }
                }
                Err(e) => tracing::debug!(%host, error = %e, "CONNECT upgrade failed"),
            }
        });
        Response::new(body::empty())
    }

    /// Terminate the client's TLS with a leaf for the requested name and serve
    /// the decrypted requests.
    async fn intercept(
        &self,
        upgraded: Upgraded,
        host: &str,
        port: u16,
    ) -> Result<(), ConnectionError> {
        let Some(ca) = self.ctx.ca.clone() else {
            return Err(ConnectionError::Tls(std::io::Error::other(
                "interception is disabled",
            )));
        };
        let handshake = self.ctx.config.timeouts.handshake();

        let acceptor = LazyConfigAcceptor::new(
            rustls::server::Acceptor::default(),
            TokioIo::new(upgraded),
        );
        let start = timeout(handshake, acceptor)
            .await
            .map_err(|_| ConnectionError::Timeout("client TLS handshake"))?
            .map_err(ConnectionError::Tls)?;

        let server_name = start
            .client_hello()
            .server_name()
            .map(str::to_string)
            .unwrap_or_else(|| host.to_string());
        let leaf = ca.issue_leaf(&server_name).await?;

        let tls = timeout(handshake, start.into_stream(leaf.server_config()))
            .await
            .map_err(|_| ConnectionError::Timeout("client TLS handshake"))?
            .map_err(ConnectionError::Tls)?;
        tracing::debug!(%host, port, %server_name, "Intercepting tunnel");

        let target = Target::https(host, port, server_name);
        let this = self.clone();
        let service = service_fn(move |req| {
            let this = this.clone();
            let target = target.clone();
            async move { Ok::<_, Infallible>(this.forward(req, target, true).await) }
        });

        self.serve(TokioIo::new(tls), service).await?;
        Ok(())
    }

    /// Re-originate `req` to `target`, recording the exchange when `capture` is set.
    async fn forward(
        &self,
        req: Request<Incoming>,
        target: Target,
        capture: bool,
    ) -> Response<ProxyBody> {
        let ctx = &self.ctx;
        let (mut parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let request_headers = capture.then(|| headers_from(&parts.headers));

        strip_hop_by_hop(&mut parts.headers);
        if !parts.headers.contains_key(header::HOST) {
            if let Ok(value) = HeaderValue::from_str(&target.authority()) {
                parts.headers.insert(header::HOST, value);
            }
        }
        parts.uri = match Uri::try_from(path.as_str()) {
            Ok(uri) => uri,
            Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid request path\n"),
        };
        parts.version = Version::HTTP_11;

        let idle = ctx.config.timeouts.idle();
        let request_preview = shared_preview(if capture {
            ctx.config.body_preview_limit
        } else {
            0
        });
        let recorder = request_headers.map(|headers| {
            let mut entry = CaptureEntry::new(
                parts.method.as_str(),
                target.scheme,
                target.host.clone(),
                target.port,
                path.clone(),
            );
            entry.request_headers = headers;
            CaptureRecorder::new(
                entry,
                request_preview.clone(),
                ctx.store.clone(),
                ctx.stats.clone(),
            )
        });

        let body = TappedBody::new(body, request_preview)
            .idle_timeout(idle)
            .boxed_unsync();

        match upstream::send(ctx, &target, Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);

                let body = match recorder {
                    Some(mut recorder) => {
                        recorder.response_head(parts.status, &parts.headers);
                        let preview = shared_preview(ctx.config.body_preview_limit);
                        let tapped = preview.clone();
                        TappedBody::new(body, preview)
                            .idle_timeout(idle)
                            .on_end(move |error| recorder.finish(&tapped, error))
                            .boxed_unsync()
                    }
                    None => TappedBody::new(body, shared_preview(0))
                        .idle_timeout(idle)
                        .boxed_unsync(),
                };
                Response::from_parts(parts, body)
            }
            Err(e) => {
                tracing::warn!(
                    host = %target.host,
                    port = target.port,
                    error = %e,
                    "Upstream request failed"
                );
                if let Some(recorder) = recorder {
                    recorder.fail(&e);
                }
                error_response(StatusCode::BAD_GATEWAY, format!("termtap: {e}\n"))
            }
        }
    }
}

/// Split a CONNECT authority into host and port; both are required.
fn parse_connect_target(uri: &Uri) -> Result<(String, u16), ConnectionError> {
    let malformed = || ConnectionError::MalformedTarget(uri.to_string());

    if uri.scheme().is_some() || uri.path_and_query().is_some_and(|pq| pq.as_str() != "/") {
        return Err(malformed());
    }
    let authority = uri.authority().ok_or_else(malformed)?;
    let port = authority.port_u16().filter(|p| *p != 0).ok_or_else(malformed)?;
    let host = strip_port(authority.as_str());
    if host.is_empty() {
        return Err(malformed());
    }
    Ok((host.to_string(), port))
}

/// Remove hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn error_response(status: StatusCode, message: impl Into<bytes::Bytes>) -> Response<ProxyBody> {
    let mut response = Response::new(body::full(message));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
