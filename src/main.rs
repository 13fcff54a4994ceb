use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

use termtap::commands;
use termtap::config::{self, CliOverrides};
use termtap::error::Result;
use termtap::state::ProxyController;

#[derive(Parser, Debug)]
#[command(name = "termtap", version)]
#[command(about = "Terminal HTTP client with an HTTPS-intercepting capture proxy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the capture proxy in the foreground
    Proxy(ProxyArgs),
}

#[derive(Debug, clap::Args)]
struct ProxyArgs {
    /// Listen address: PORT, :PORT or HOST:PORT (bare ports bind 127.0.0.1)
    #[arg(short, long, value_name = "ADDR")]
    port: Option<String>,

    /// Intercept HTTPS tunnels (--https=false relays them untouched)
    #[arg(
        long,
        value_name = "BOOL",
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    https: Option<bool>,

    /// Print every capture and enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Maximum number of captures kept in memory
    #[arg(short, long, value_name = "N")]
    buffer: Option<usize>,

    /// Only capture hosts matching this pattern (repeatable)
    #[arg(long = "include", value_name = "HOST")]
    include: Vec<String>,

    /// Never capture or intercept hosts matching this pattern (repeatable)
    #[arg(long = "exclude", value_name = "HOST")]
    exclude: Vec<String>,

    /// Write the root CA certificate to PATH and exit
    #[arg(long, value_name = "PATH")]
    export_ca: Option<PathBuf>,

    /// Path to a TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Proxy(args) => {
            init_tracing(args.verbose);
            match run_proxy(args).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

/// Logs go to stderr; stdout is reserved for proxy output.
fn init_tracing(verbose: bool) {
    let default = if verbose { "termtap=debug" } else { "termtap=warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_proxy(args: ProxyArgs) -> Result<()> {
    let listen = args
        .port
        .as_deref()
        .map(config::parse_listen_addr)
        .transpose()?;

    let mut proxy_config = config::load(args.config.as_deref())?;
    config::apply_overrides(
        &mut proxy_config,
        CliOverrides {
            listen,
            intercept_https: args.https,
            verbose: args.verbose,
            buffer_size: args.buffer,
            include_hosts: args.include,
            exclude_hosts: args.exclude,
        },
    );
    config::validate(&proxy_config)?;

    let controller = Arc::new(ProxyController::new(proxy_config));

    if let Some(path) = args.export_ca {
        return commands::export_ca(&controller, &path).await;
    }

    commands::run_proxy(controller, shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
