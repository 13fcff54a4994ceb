//! Proxy lifecycle: the single owner of the running proxy and its shared state.

use crate::ca::CertificateAuthority;
use crate::capture::{CaptureEntry, CaptureStore, HostFilter};
use crate::config::{resolve_data_dir, ProxyConfig};
use crate::error::{ExportError, ProxyError, Result};
use crate::proxy::{ProxyContext, ProxyServer};
use crate::tls;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub mod stats;

pub use stats::StatsCollector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Point-in-time view of the proxy for status displays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyState {
    pub phase: ProxyPhase,
    pub running: bool,
    /// Bound address while running, configured address otherwise
    pub listen: SocketAddr,
    pub intercept_https: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub captured: usize,
}

/// Summary of a run, returned by `stop`
#[derive(Debug, Clone)]
pub struct StopReport {
    pub captured: u64,
    pub errors: u64,
    pub uptime: chrono::Duration,
    /// Connection tasks still running when the grace period ran out
    pub abandoned_tasks: usize,
    /// Final counters in the Prometheus text format
    pub metrics: String,
}

struct RunningProxy {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
    stats: Arc<StatsCollector>,
}

/// Owns the proxy's start/stop state machine.
///
/// Captured entries and the certificate authority outlive individual runs,
/// so toggling the proxy keeps history and reuses already minted leaves.
pub struct ProxyController {
    config: Arc<ProxyConfig>,
    store: Arc<CaptureStore>,
    host_filter: Arc<HostFilter>,
    ca: OnceCell<Arc<CertificateAuthority>>,
    running: Mutex<Option<RunningProxy>>,
    state_tx: watch::Sender<ProxyState>,
}

impl ProxyController {
    pub fn new(config: ProxyConfig) -> Self {
        let store = Arc::new(CaptureStore::new(config.buffer_size));
        let host_filter = Arc::new(HostFilter::new(
            config.include_hosts.as_slice(),
            config.exclude_hosts.as_slice(),
        ));
        let (state_tx, _) = watch::channel(ProxyState {
            phase: ProxyPhase::Stopped,
            running: false,
            listen: config.listen,
            intercept_https: config.intercept_https,
            started_at: None,
            captured: 0,
        });

        Self {
            config: Arc::new(config),
            store,
            host_filter,
            ca: OnceCell::new(),
            running: Mutex::new(None),
            state_tx,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Start the proxy. Returns the bound address; a no-op when already running.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        self.start_locked(&mut running).await
    }

    /// Stop the proxy. Returns `None` when it was not running.
    pub async fn stop(&self) -> Option<StopReport> {
        let mut running = self.running.lock().await;
        self.stop_locked(&mut running).await
    }

    /// Flip between running and stopped. Returns whether the proxy now runs.
    pub async fn toggle(&self) -> Result<bool> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            self.stop_locked(&mut running).await;
            Ok(false)
        } else {
            self.start_locked(&mut running).await?;
            Ok(true)
        }
    }

    async fn start_locked(&self, running: &mut Option<RunningProxy>) -> Result<SocketAddr> {
        if let Some(proxy) = running.as_ref() {
            tracing::debug!(addr = %proxy.local_addr, "Proxy already running");
            return Ok(proxy.local_addr);
        }

        self.publish(ProxyPhase::Starting, self.config.listen, None);
        match self.launch().await {
            Ok(proxy) => {
                let addr = proxy.local_addr;
                self.publish(ProxyPhase::Running, addr, Some(proxy.stats.started_at()));
                *running = Some(proxy);
                Ok(addr)
            }
            Err(e) => {
                self.publish(ProxyPhase::Stopped, self.config.listen, None);
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<RunningProxy> {
        let ca = if self.config.intercept_https {
            Some(self.certificate_authority().await?)
        } else {
            None
        };
        let upstream_tls = tls::upstream_client_config(self.config.upstream_ca_file.as_deref())?;

        let listener = TcpListener::bind(self.config.listen)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: self.config.listen,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let stats = Arc::new(StatsCollector::new());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let ctx = Arc::new(ProxyContext {
            config: self.config.clone(),
            ca,
            host_filter: self.host_filter.clone(),
            store: self.store.clone(),
            stats: stats.clone(),
            upstream_tls,
            cancel: cancel.clone(),
            tracker: tracker.clone(),
        });
        let accept_task = tokio::spawn(ProxyServer::new(listener, ctx).run());

        tracing::info!(
            addr = %local_addr,
            intercept_https = self.config.intercept_https,
            "Capture proxy started"
        );

        Ok(RunningProxy {
            local_addr,
            cancel,
            tracker,
            accept_task,
            stats,
        })
    }

    async fn stop_locked(&self, running: &mut Option<RunningProxy>) -> Option<StopReport> {
        let proxy = running.take()?;
        self.publish(ProxyPhase::Stopping, proxy.local_addr, Some(proxy.stats.started_at()));

        proxy.cancel.cancel();
        if let Err(e) = proxy.accept_task.await {
            tracing::warn!(error = %e, "Accept loop ended abnormally");
        }

        proxy.tracker.close();
        let grace = self.config.timeouts.shutdown_grace();
        let abandoned_tasks = match tokio::time::timeout(grace, proxy.tracker.wait()).await {
            Ok(()) => 0,
            Err(_) => {
                let remaining = proxy.tracker.len();
                tracing::warn!(
                    remaining,
                    grace_secs = grace.as_secs(),
                    "Abandoning connection tasks that did not finish in time"
                );
                remaining
            }
        };

        self.publish(ProxyPhase::Stopped, self.config.listen, None);

        let report = StopReport {
            captured: proxy.stats.captured(),
            errors: proxy.stats.errors(),
            uptime: proxy.stats.uptime(),
            abandoned_tasks,
            metrics: proxy.stats.render_metrics(),
        };
        tracing::info!(
            captured = report.captured,
            errors = report.errors,
            abandoned = report.abandoned_tasks,
            "Capture proxy stopped"
        );
        Some(report)
    }

    fn publish(&self, phase: ProxyPhase, listen: SocketAddr, started_at: Option<DateTime<Utc>>) {
        self.state_tx.send_modify(|state| {
            state.phase = phase;
            state.running = phase == ProxyPhase::Running;
            state.listen = listen;
            state.started_at = started_at;
        });
    }

    pub fn state(&self) -> ProxyState {
        let mut state = self.state_tx.borrow().clone();
        state.captured = self.store.count();
        state
    }

    /// Watch phase changes; `captured` in the watched value is not kept current.
    pub fn watch_state(&self) -> watch::Receiver<ProxyState> {
        self.state_tx.subscribe()
    }

    /// Counters of the current run, if any.
    pub async fn stats(&self) -> Option<Arc<StatsCollector>> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|proxy| proxy.stats.clone())
    }

    pub fn store(&self) -> Arc<CaptureStore> {
        self.store.clone()
    }

    pub fn host_filter(&self) -> Arc<HostFilter> {
        self.host_filter.clone()
    }

    /// Replace the host patterns; takes effect for the next connection.
    pub fn set_host_patterns<S: AsRef<str>>(&self, include: &[S], exclude: &[S]) {
        self.host_filter.set_patterns(include, exclude);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CaptureEntry>> {
        self.store.subscribe()
    }

    /// Load or create the root CA, once per controller.
    pub async fn certificate_authority(&self) -> Result<Arc<CertificateAuthority>> {
        self.ca
            .get_or_try_init(|| async {
                let data_dir = resolve_data_dir(&self.config)?;
                let ca = CertificateAuthority::initialize(&data_dir).await?;
                Ok::<_, ProxyError>(Arc::new(ca))
            })
            .await
            .cloned()
    }

    /// Write the root certificate to `path`. Fails when interception is disabled.
    pub async fn export_ca(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        if !self.config.intercept_https {
            return Err(ExportError::HttpsDisabled.into());
        }
        let path = path.as_ref();
        let ca = self.certificate_authority().await?;
        ca.export(path).await?;
        Ok(path.to_path_buf())
    }
}
