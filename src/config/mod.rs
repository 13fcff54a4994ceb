mod loader;
mod overrides;
mod schema;

pub use loader::{load, parse_listen_addr, resolve_data_dir, validate};
pub use overrides::{apply_overrides, CliOverrides};
pub use schema::{ProxyConfig, TimeoutConfig};
