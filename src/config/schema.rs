use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the capture proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the proxy listens on (e.g., "127.0.0.1:8888")
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Whether CONNECT tunnels are TLS-intercepted
    #[serde(default = "default_true")]
    pub intercept_https: bool,

    /// Print every captured transaction
    #[serde(default)]
    pub verbose: bool,

    /// Maximum number of captured transactions kept in memory
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Host patterns to capture (empty means all hosts)
    #[serde(default)]
    pub include_hosts: Vec<String>,

    /// Host patterns never captured or intercepted
    #[serde(default)]
    pub exclude_hosts: Vec<String>,

    /// Directory holding the root CA (defaults to the platform data dir)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Bytes of each request/response body kept on a capture
    #[serde(default = "default_body_preview_limit")]
    pub body_preview_limit: usize,

    /// Extra PEM roots trusted for upstream TLS in addition to webpki roots
    #[serde(default)]
    pub upstream_ca_file: Option<PathBuf>,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,

    #[serde(default = "default_handshake_secs")]
    pub handshake_secs: u64,

    #[serde(default = "default_header_read_secs")]
    pub header_read_secs: u64,

    /// Time allowed for the upstream response head
    #[serde(default = "default_response_secs")]
    pub response_secs: u64,

    /// Idle time after which a raw tunnel or a stalled body is closed
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn header_read(&self) -> Duration {
        Duration::from_secs(self.header_read_secs)
    }

    pub fn response(&self) -> Duration {
        Duration::from_secs(self.response_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8888))
}

fn default_true() -> bool {
    true
}

fn default_buffer_size() -> usize {
    1000
}

fn default_body_preview_limit() -> usize {
    64 * 1024
}

fn default_connect_secs() -> u64 {
    10
}

fn default_handshake_secs() -> u64 {
    10
}

fn default_header_read_secs() -> u64 {
    30
}

fn default_response_secs() -> u64 {
    60
}

fn default_idle_secs() -> u64 {
    120
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            handshake_secs: default_handshake_secs(),
            header_read_secs: default_header_read_secs(),
            response_secs: default_response_secs(),
            idle_secs: default_idle_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            intercept_https: true,
            verbose: false,
            buffer_size: default_buffer_size(),
            include_hosts: Vec::new(),
            exclude_hosts: Vec::new(),
            data_dir: None,
            body_preview_limit: default_body_preview_limit(),
            upstream_ca_file: None,
            timeouts: TimeoutConfig::default(),
        }
    }
}
