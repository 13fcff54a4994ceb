use super::schema::ProxyConfig;
use std::net::SocketAddr;

/// Values given on the command line. They win over every other source.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen: Option<SocketAddr>,
    pub intercept_https: Option<bool>,
    pub verbose: bool,
    pub buffer_size: Option<usize>,
    /// Appended to the configured include patterns
    pub include_hosts: Vec<String>,
    /// Appended to the configured exclude patterns
    pub exclude_hosts: Vec<String>,
}

/// Apply command line overrides to the loaded configuration
pub fn apply_overrides(config: &mut ProxyConfig, overrides: CliOverrides) {
    if let Some(listen) = overrides.listen {
        tracing::debug!(%listen, "Overriding listen address");
        config.listen = listen;
    }
    if let Some(intercept) = overrides.intercept_https {
        config.intercept_https = intercept;
    }
    if overrides.verbose {
        config.verbose = true;
    }
    if let Some(buffer_size) = overrides.buffer_size {
        config.buffer_size = buffer_size;
    }
    config.include_hosts.extend(overrides.include_hosts);
    config.exclude_hosts.extend(overrides.exclude_hosts);
}
