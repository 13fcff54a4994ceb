mod common;

use common::{
    ca_cert_path, client, dead_port, proxy_config, spawn_origin, spawn_stalling_origin,
    spawn_tls_origin, wait_for_count,
};
use std::time::Duration;
use tempfile::TempDir;
use termtap::ca::CertificateAuthority;
use termtap::capture::{FilterState, Scheme};
use termtap::state::ProxyController;

#[tokio::test]
async fn test_plain_http_request_is_captured() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let origin = spawn_origin().await;

    let controller = ProxyController::new(proxy_config(temp_dir.path(), false));
    let proxy = controller.start().await.expect("Failed to start proxy");
    let before = controller.store().count();

    let response = client(proxy, None)
        .get(format!("http://{origin}/items?page=2"))
        .send()
        .await
        .expect("Request through proxy failed");
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("x-origin").map(|v| v.as_bytes()),
        Some(&b"termtap-test"[..])
    );
    assert_eq!(response.text().await.expect("Failed to read body"), "GET /items");

    wait_for_count(&controller, before + 1).await;
    let entries = controller.store().list(&FilterState::default());
    assert_eq!(entries.len(), before + 1);

    let entry = entries.last().expect("Missing capture");
    assert_eq!(entry.method, "GET");
    assert_eq!(entry.scheme, Scheme::Http);
    assert_eq!(entry.host, "127.0.0.1");
    assert_eq!(entry.port, origin.port());
    assert_eq!(entry.path, "/items?page=2");
    assert_eq!(entry.status, Some(200));
    assert_eq!(&entry.response_body[..], b"GET /items");
    assert!(entry.error.is_none());

    controller.stop().await;
}

#[tokio::test]
async fn test_request_body_preview_is_recorded() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let origin = spawn_origin().await;

    let mut config = proxy_config(temp_dir.path(), false);
    config.body_preview_limit = 4;
    let controller = ProxyController::new(config);
    let proxy = controller.start().await.expect("Failed to start proxy");

    let body = client(proxy, None)
        .post(format!("http://{origin}/submit"))
        .body("name=termtap")
        .send()
        .await
        .expect("Request through proxy failed")
        .text()
        .await
        .expect("Failed to read body");
    assert_eq!(body, "POST /submit name=termtap");

    wait_for_count(&controller, 1).await;
    let entry = controller.store().list(&FilterState::default())[0].clone();
    assert_eq!(entry.method, "POST");
    assert_eq!(&entry.request_body[..], b"name");
    assert_eq!(entry.request_body_size, 12);
    assert!(entry.request_body_truncated());
    assert!(entry.response_body_truncated());

    controller.stop().await;
}

#[tokio::test]
async fn test_excluded_host_is_forwarded_without_capture() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let origin = spawn_origin().await;

    let mut config = proxy_config(temp_dir.path(), false);
    config.exclude_hosts = vec!["127.0.0.1".to_string()];
    let controller = ProxyController::new(config);
    let proxy = controller.start().await.expect("Failed to start proxy");

    let body = client(proxy, None)
        .get(format!("http://{origin}/private"))
        .send()
        .await
        .expect("Request through proxy failed")
        .text()
        .await
        .expect("Failed to read body");
    assert_eq!(body, "GET /private");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.store().count(), 0);

    controller.stop().await;
}

#[tokio::test]
async fn test_host_patterns_change_at_runtime() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let origin = spawn_origin().await;

    let controller = ProxyController::new(proxy_config(temp_dir.path(), false));
    let proxy = controller.start().await.expect("Failed to start proxy");
    let http = client(proxy, None);

    controller.set_host_patterns::<&str>(&[], &["127.0.0.1"]);
    http.get(format!("http://{origin}/skipped"))
        .send()
        .await
        .expect("Request through proxy failed");

    controller.set_host_patterns::<&str>(&[], &[]);
    http.get(format!("http://{origin}/kept"))
        .send()
        .await
        .expect("Request through proxy failed")
        .text()
        .await
        .expect("Failed to read body");

    wait_for_count(&controller, 1).await;
    let entries = controller.store().list(&FilterState::default());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, "/kept");

    controller.stop().await;
}

#[tokio::test]
async fn test_upstream_failure_returns_502_and_error_entry() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let port = dead_port().await;

    let controller = ProxyController::new(proxy_config(temp_dir.path(), false));
    let proxy = controller.start().await.expect("Failed to start proxy");

    let response = client(proxy, None)
        .get(format!("http://127.0.0.1:{port}/down"))
        .send()
        .await
        .expect("Proxy should answer");
    assert_eq!(response.status(), 502);

    wait_for_count(&controller, 1).await;
    let entry = controller.store().list(&FilterState::default())[0].clone();
    assert_eq!(entry.status, Some(502));
    assert!(entry.is_error());
    assert!(entry
        .error
        .as_deref()
        .is_some_and(|e| e.contains("failed to connect")));

    // The listener keeps serving after a failed transaction.
    let origin = spawn_origin().await;
    let body = client(proxy, None)
        .get(format!("http://{origin}/after"))
        .send()
        .await
        .expect("Request through proxy failed")
        .text()
        .await
        .expect("Failed to read body");
    assert_eq!(body, "GET /after");

    controller.stop().await;
}

#[tokio::test]
async fn test_https_interception_captures_one_entry() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    // The origin's certificate comes from the same root the proxy will load,
    // so the proxy can verify it through `upstream_ca_file`.
    let ca = CertificateAuthority::initialize(temp_dir.path())
        .await
        .expect("Failed to create CA");
    let origin_leaf = ca.issue_leaf("localhost").await.expect("Failed to issue");
    let origin = spawn_tls_origin(origin_leaf.server_config()).await;

    let mut config = proxy_config(temp_dir.path(), true);
    config.upstream_ca_file = Some(ca_cert_path(temp_dir.path()));
    let controller = ProxyController::new(config);
    let proxy = controller.start().await.expect("Failed to start proxy");

    let exported = temp_dir.path().join("exported").join("termtap-ca.pem");
    controller
        .export_ca(&exported)
        .await
        .expect("Failed to export CA");

    let before = controller.store().count();
    let response = client(proxy, Some(&exported))
        .get(format!("https://localhost:{}/secure", origin.port()))
        .send()
        .await
        .expect("HTTPS request through proxy failed");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.expect("Failed to read body"), "GET /secure");

    wait_for_count(&controller, before + 1).await;
    let entries = controller.store().list(&FilterState::default());
    assert_eq!(entries.len(), before + 1);

    let entry = entries.last().expect("Missing capture");
    assert_eq!(entry.scheme, Scheme::Https);
    assert_eq!(entry.host, "localhost");
    assert_eq!(entry.port, origin.port());
    assert_eq!(entry.path, "/secure");
    assert_eq!(entry.status, Some(200));
    assert_eq!(&entry.response_body[..], b"GET /secure");

    let stats = controller.stats().await.expect("Proxy should be running");
    assert_eq!(stats.intercepted_tunnels.get(), 1);

    controller.stop().await;
}

#[tokio::test]
async fn test_stalled_response_body_is_cut_off_and_recorded() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let origin = spawn_stalling_origin().await;

    let mut config = proxy_config(temp_dir.path(), false);
    config.timeouts.idle_secs = 1;
    let controller = ProxyController::new(config);
    let proxy = controller.start().await.expect("Failed to start proxy");

    let response = client(proxy, None)
        .get(format!("http://{origin}/slow"))
        .send()
        .await
        .expect("Proxy should answer");
    assert_eq!(response.status(), 200);
    assert!(response.bytes().await.is_err());

    wait_for_count(&controller, 1).await;
    let entry = controller.store().list(&FilterState::default())[0].clone();
    assert_eq!(entry.status, Some(200));
    assert_eq!(&entry.response_body[..], b"hello");
    assert!(entry.error.as_deref().is_some_and(|e| e.contains("idle")));

    controller.stop().await;
}

#[tokio::test]
async fn test_untrusted_upstream_certificate_in_tunnel_gets_502() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let origin_dir = TempDir::new().expect("Failed to create temp dir");

    // Signed by a root the proxy has never seen.
    let foreign = CertificateAuthority::initialize(origin_dir.path())
        .await
        .expect("Failed to create origin CA");
    let origin_leaf = foreign.issue_leaf("localhost").await.expect("Failed to issue");
    let origin = spawn_tls_origin(origin_leaf.server_config()).await;

    let controller = ProxyController::new(proxy_config(temp_dir.path(), true));
    let proxy = controller.start().await.expect("Failed to start proxy");

    let response = client(proxy, Some(&ca_cert_path(temp_dir.path())))
        .get(format!("https://localhost:{}/secure", origin.port()))
        .send()
        .await
        .expect("Proxy should answer inside the tunnel");
    assert_eq!(response.status(), 502);

    wait_for_count(&controller, 1).await;
    let entries = controller.store().list(&FilterState::default());
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.scheme, Scheme::Https);
    assert_eq!(entry.status, Some(502));
    assert!(entry
        .error
        .as_deref()
        .is_some_and(|e| e.contains("TLS handshake failed")));

    controller.stop().await;
}

#[tokio::test]
async fn test_https_passthrough_when_interception_disabled() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    let ca = CertificateAuthority::initialize(temp_dir.path())
        .await
        .expect("Failed to create CA");
    let origin_leaf = ca.issue_leaf("localhost").await.expect("Failed to issue");
    let origin = spawn_tls_origin(origin_leaf.server_config()).await;

    let controller = ProxyController::new(proxy_config(temp_dir.path(), false));
    let proxy = controller.start().await.expect("Failed to start proxy");

    // The client talks TLS straight to the origin, so it must trust the origin's root.
    let body = client(proxy, Some(&ca_cert_path(temp_dir.path())))
        .get(format!("https://localhost:{}/tunnel", origin.port()))
        .send()
        .await
        .expect("Tunnelled request failed")
        .text()
        .await
        .expect("Failed to read body");
    assert_eq!(body, "GET /tunnel");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.store().count(), 0);

    let stats = controller.stats().await.expect("Proxy should be running");
    assert_eq!(stats.passthrough_tunnels.get(), 1);

    controller.stop().await;
}

#[tokio::test]
async fn test_excluded_https_host_is_tunnelled_raw() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    let ca = CertificateAuthority::initialize(temp_dir.path())
        .await
        .expect("Failed to create CA");
    let origin_leaf = ca.issue_leaf("localhost").await.expect("Failed to issue");
    let origin = spawn_tls_origin(origin_leaf.server_config()).await;

    let mut config = proxy_config(temp_dir.path(), true);
    config.exclude_hosts = vec!["localhost".to_string()];
    let controller = ProxyController::new(config);
    let proxy = controller.start().await.expect("Failed to start proxy");

    let body = client(proxy, Some(&ca_cert_path(temp_dir.path())))
        .get(format!("https://localhost:{}/raw", origin.port()))
        .send()
        .await
        .expect("Tunnelled request failed")
        .text()
        .await
        .expect("Failed to read body");
    assert_eq!(body, "GET /raw");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.store().count(), 0);

    let ca = controller
        .certificate_authority()
        .await
        .expect("Missing CA");
    assert_eq!(ca.cached_leaves(), 0);

    controller.stop().await;
}

#[tokio::test]
async fn test_malformed_connect_target_gets_502() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let controller = ProxyController::new(proxy_config(temp_dir.path(), false));
    let proxy = controller.start().await.expect("Failed to start proxy");

    let mut stream = tokio::net::TcpStream::connect(proxy)
        .await
        .expect("Failed to connect to proxy");
    stream
        .write_all(b"CONNECT example.com HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .expect("Failed to write");

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("Proxy did not close the connection")
        .expect("Failed to read");
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 502"), "got: {response}");
    assert!(response.to_ascii_lowercase().contains("connection: close"));

    // Other clients are unaffected.
    let origin = spawn_origin().await;
    let status = client(proxy, None)
        .get(format!("http://{origin}/"))
        .send()
        .await
        .expect("Request through proxy failed")
        .status();
    assert_eq!(status, 200);

    controller.stop().await;
}

#[tokio::test]
async fn test_origin_form_request_is_rejected() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let controller = ProxyController::new(proxy_config(temp_dir.path(), false));
    let proxy = controller.start().await.expect("Failed to start proxy");

    let mut stream = tokio::net::TcpStream::connect(proxy)
        .await
        .expect("Failed to connect to proxy");
    stream
        .write_all(b"GET /direct HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .expect("Failed to write");

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("Proxy did not close the connection")
        .expect("Failed to read");
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 400"));
    assert_eq!(controller.store().count(), 0);

    controller.stop().await;
}
