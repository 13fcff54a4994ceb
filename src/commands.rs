use crate::capture::CaptureEntry;
use crate::error::Result;
use crate::state::ProxyController;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// Run the proxy in the foreground until `shutdown` resolves.
pub async fn run_proxy(
    controller: Arc<ProxyController>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let addr = controller.start().await?;
    let config = controller.config();

    println!("termtap capture proxy started");
    println!("  Listening on:       http://{addr}");
    println!(
        "  HTTPS interception: {}",
        if config.intercept_https {
            "enabled"
        } else {
            "disabled"
        }
    );
    if config.intercept_https {
        let ca = controller.certificate_authority().await?;
        println!("  Root certificate:   {}", ca.cert_path().display());
    }
    if !config.include_hosts.is_empty() {
        println!("  Include hosts:      {}", config.include_hosts.join(", "));
    }
    if !config.exclude_hosts.is_empty() {
        println!("  Exclude hosts:      {}", config.exclude_hosts.join(", "));
    }
    println!();
    println!("Route traffic through the proxy with:");
    println!("  export HTTP_PROXY=http://{addr}");
    println!("  export HTTPS_PROXY=http://{addr}");
    println!();
    println!("Press Ctrl+C to stop.");

    let printer = config
        .verbose
        .then(|| spawn_summary_printer(controller.subscribe()));

    shutdown.await;
    println!();
    println!("Shutting down...");

    let report = controller.stop().await;
    if let Some(printer) = printer {
        printer.abort();
    }

    println!("Captured {} request(s)", controller.store().count());
    if let Some(report) = report {
        if report.errors > 0 {
            println!("  {} failed transaction(s)", report.errors);
        }
        if report.abandoned_tasks > 0 {
            println!(
                "  {} connection(s) did not finish before shutdown",
                report.abandoned_tasks
            );
        }
        if config.verbose {
            println!();
            print!("{}", report.metrics);
        }
    }
    Ok(())
}

fn spawn_summary_printer(mut events: broadcast::Receiver<Arc<CaptureEntry>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(entry) => println!("{}", entry.summary()),
                Err(RecvError::Lagged(skipped)) => {
                    eprintln!("({skipped} capture(s) not shown, output fell behind)");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Export the root certificate and explain how to trust it.
pub async fn export_ca(controller: &ProxyController, path: &Path) -> Result<()> {
    let path = controller.export_ca(path).await?;
    let path = path.display();

    println!("Root certificate written to {path}");
    println!();
    println!("Trust it on macOS:");
    println!(
        "  sudo security add-trusted-cert -d -r trustRoot -k /Library/Keychains/System.keychain {path}"
    );
    println!();
    println!("Trust it on Linux (Debian/Ubuntu):");
    println!("  sudo cp {path} /usr/local/share/ca-certificates/termtap.crt");
    println!("  sudo update-ca-certificates");
    println!();
    println!("Trust it on Linux (Fedora/RHEL):");
    println!("  sudo cp {path} /etc/pki/ca-trust/source/anchors/termtap.pem");
    println!("  sudo update-ca-trust");
    Ok(())
}
