use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header list in wire order; repeated names are kept as separate pairs.
pub type Headers = Vec<(String, String)>;

pub fn headers_from(map: &HeaderMap) -> Headers {
    map.iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// One recorded request/response transaction.
///
/// Bodies are previews capped at the configured limit; the `*_body_size`
/// fields carry the full byte counts.
#[derive(Debug, Clone)]
pub struct CaptureEntry {
    /// Assigned by the store on append
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub request_headers: Headers,
    pub request_body: Bytes,
    pub request_body_size: u64,
    pub status: Option<u16>,
    pub response_headers: Headers,
    pub response_body: Bytes,
    pub response_body_size: u64,
    pub duration: Duration,
    pub error: Option<String>,
}

impl CaptureEntry {
    pub fn new(
        method: impl Into<String>,
        scheme: Scheme,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            method: method.into(),
            scheme,
            host: host.into(),
            port,
            path: path.into(),
            request_headers: Vec::new(),
            request_body: Bytes::new(),
            request_body_size: 0,
            status: None,
            response_headers: Vec::new(),
            response_body: Bytes::new(),
            response_body_size: 0,
            duration: Duration::ZERO,
            error: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Full URL, omitting the scheme's default port
    pub fn url(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            format!("{}://{}{}", self.scheme, host, self.path)
        } else {
            format!("{}://{}:{}{}", self.scheme, host, self.port, self.path)
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn request_body_truncated(&self) -> bool {
        (self.request_body.len() as u64) < self.request_body_size
    }

    pub fn response_body_truncated(&self) -> bool {
        (self.response_body.len() as u64) < self.response_body_size
    }

    /// Single-line form used by the verbose CLI output
    pub fn summary(&self) -> String {
        let status = self
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "---".to_string());
        let mut line = format!(
            "{} {} {} ({} ms, {} B)",
            self.method,
            status,
            self.url(),
            self.duration.as_millis(),
            self.response_body_size
        );
        if let Some(error) = &self.error {
            line.push_str(" error: ");
            line.push_str(error);
        }
        line
    }
}
