use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Certificate authority error: {0}")]
    Ca(#[from] CaError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid listen address '{0}': expected PORT, :PORT or HOST:PORT")]
    ListenAddr(String),

    #[error("Could not determine a data directory; set data_dir in the config")]
    NoDataDir,
}

#[derive(Error, Debug)]
pub enum CaError {
    #[error("Failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to generate certificate: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("Existing root certificate at {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("Invalid hostname for certificate: {0}")]
    InvalidHostname(String),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Root certificate expires at {not_after}; restart to generate a new one")]
    RootExpiring { not_after: time::OffsetDateTime },

    #[error("Certificate minting task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("HTTPS interception is disabled, no root certificate to export (drop --https=false)")]
    HttpsDisabled,

    #[error("Failed to write CA certificate to {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Ca(#[from] CaError),
}

/// Failure of a single proxied connection or transaction. Never escapes the
/// connection task; it is logged and recorded on the capture entry instead.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("malformed target '{0}'")]
    MalformedTarget(String),

    #[error("failed to connect to {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("TLS handshake failed: {0}")]
    Tls(#[source] io::Error),

    #[error("invalid server name '{0}'")]
    ServerName(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("certificate error: {0}")]
    Ca(#[from] CaError),

    #[error("relay error: {0}")]
    Relay(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
