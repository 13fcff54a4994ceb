#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use termtap::config::ProxyConfig;
use termtap::state::ProxyController;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Echoes the method and path so tests can check the body arrived unmodified.
async fn origin_handler(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes())
        .unwrap_or_default();

    let text = if body.is_empty() {
        format!("{method} {path}")
    } else {
        format!("{method} {path} {}", String::from_utf8_lossy(&body))
    };

    Ok(Response::builder()
        .header("x-origin", "termtap-test")
        .body(Full::new(Bytes::from(text)))
        .expect("Failed to build response"))
}

/// Plain HTTP origin on 127.0.0.1
pub async fn spawn_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind origin");
    let addr = listener.local_addr().expect("Failed to get origin address");

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(origin_handler))
                    .await;
            });
        }
    });

    addr
}

/// HTTPS origin on 127.0.0.1 presenting `server_config`'s certificate
pub async fn spawn_tls_origin(server_config: Arc<ServerConfig>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind TLS origin");
    let addr = listener.local_addr().expect("Failed to get origin address");
    let acceptor = TlsAcceptor::from(server_config);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service_fn(origin_handler))
                    .await;
            });
        }
    });

    addr
}

/// Origin that sends a response head and the first bytes of a longer body,
/// then holds the connection open without sending the rest.
pub async fn spawn_stalling_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind stalling origin");
    let addr = listener.local_addr().expect("Failed to get origin address");

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nhello")
                    .await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
        }
    });

    addr
}

/// A port that refuses connections
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    listener.local_addr().expect("Failed to get address").port()
}

pub fn proxy_config(data_dir: &Path, intercept_https: bool) -> ProxyConfig {
    ProxyConfig {
        listen: "127.0.0.1:0".parse().expect("Invalid address"),
        intercept_https,
        data_dir: Some(data_dir.to_path_buf()),
        ..Default::default()
    }
}

pub fn ca_cert_path(data_dir: &Path) -> PathBuf {
    data_dir.join("ca.pem")
}

/// HTTP client routing everything through the proxy at `proxy`
pub fn client(proxy: SocketAddr, trusted_root: Option<&Path>) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy}")).expect("Invalid proxy url"))
        .timeout(Duration::from_secs(10));

    if let Some(path) = trusted_root {
        let pem = std::fs::read(path).expect("Failed to read root certificate");
        builder = builder.add_root_certificate(
            reqwest::Certificate::from_pem(&pem).expect("Invalid root certificate"),
        );
    }

    builder.build().expect("Failed to build client")
}

/// Captures are appended when the response body completes, which can trail
/// the client finishing its read by a moment.
pub async fn wait_for_count(controller: &ProxyController, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while controller.store().count() < expected {
        if tokio::time::Instant::now() > deadline {
            panic!(
                "expected {expected} captures, found {}",
                controller.store().count()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
