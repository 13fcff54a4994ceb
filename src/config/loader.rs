use super::schema::ProxyConfig;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "termtap";

/// Load configuration from defaults, the TOML file and `TERMTAP_` variables.
///
/// An explicit `path` must exist; the default location is optional.
pub fn load(path: Option<&Path>) -> Result<ProxyConfig> {
    let mut figment = Figment::from(Serialized::defaults(ProxyConfig::default()));

    match path {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::Parse(format!(
                    "config file {} does not exist",
                    path.display()
                ))
                .into());
            }
            tracing::debug!("Loading configuration from {}", path.display());
            figment = figment.merge(Toml::file(path));
        }
        None => {
            if let Some(default_path) = default_config_path() {
                figment = figment.merge(Toml::file(default_path));
            }
        }
    }

    let config: ProxyConfig = figment
        .merge(Env::prefixed("TERMTAP_").split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &ProxyConfig) -> Result<()> {
    if config.buffer_size == 0 {
        return Err(ConfigError::Validation("Capture buffer size must be greater than 0".into()).into());
    }

    let timeouts = &config.timeouts;
    for (name, secs) in [
        ("connect", timeouts.connect_secs),
        ("handshake", timeouts.handshake_secs),
        ("header_read", timeouts.header_read_secs),
        ("response", timeouts.response_secs),
        ("idle", timeouts.idle_secs),
    ] {
        if secs == 0 {
            return Err(ConfigError::Validation(format!("Timeout '{name}' must be greater than 0")).into());
        }
    }

    if let Some(path) = &config.upstream_ca_file {
        if !path.is_file() {
            return Err(ConfigError::Validation(format!(
                "Upstream CA file {} does not exist",
                path.display()
            ))
            .into());
        }
    }

    for pattern in config.include_hosts.iter().chain(&config.exclude_hosts) {
        if pattern.trim().is_empty() {
            return Err(ConfigError::Validation("Host patterns must not be empty".into()).into());
        }
    }

    Ok(())
}

/// Parse the `--port` flag: `PORT`, `:PORT` or `HOST:PORT`.
///
/// Bare ports bind the loopback interface.
pub fn parse_listen_addr(input: &str) -> std::result::Result<SocketAddr, ConfigError> {
    let input = input.trim();
    let invalid = || ConfigError::ListenAddr(input.to_string());

    let addr = if let Some(port) = input.strip_prefix(':').or_else(|| {
        input.bytes().all(|b| b.is_ascii_digit()).then_some(input)
    }) {
        let port: u16 = port.parse().map_err(|_| invalid())?;
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    } else if let Ok(addr) = input.parse::<SocketAddr>() {
        addr
    } else {
        match input.rsplit_once(':') {
            Some((host, port)) if host.eq_ignore_ascii_case("localhost") => {
                let port: u16 = port.parse().map_err(|_| invalid())?;
                SocketAddr::from((Ipv4Addr::LOCALHOST, port))
            }
            _ => return Err(invalid()),
        }
    };

    if addr.port() == 0 {
        return Err(invalid());
    }
    Ok(addr)
}

/// Directory holding persisted proxy state such as the root CA.
pub fn resolve_data_dir(config: &ProxyConfig) -> std::result::Result<PathBuf, ConfigError> {
    if let Some(dir) = &config.data_dir {
        return Ok(dir.clone());
    }
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR))
        .ok_or(ConfigError::NoDataDir)
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("proxy.toml"))
}
