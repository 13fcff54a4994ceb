//! Raw byte pipe for tunnels that are not intercepted.

use crate::error::ConnectionError;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const BUFFER_SIZE: usize = 16 * 1024;

/// Last time either direction moved a byte, shared by both copy tasks.
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

/// Copy bytes both ways until both sides close, the pair sits idle for
/// `idle`, or `cancel` fires. Returns bytes sent `(client → upstream, upstream → client)`.
///
/// Each direction runs as its own tracked task; an error in one stops the other.
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    idle: Duration,
    cancel: &CancellationToken,
    tracker: &TaskTracker,
) -> Result<(u64, u64), ConnectionError>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let stop = cancel.child_token();
    let activity = Arc::new(Activity::new());

    let outbound = tracker.spawn(pump(
        client_read,
        upstream_write,
        idle,
        stop.clone(),
        activity.clone(),
    ));
    let inbound = tracker.spawn(pump(
        upstream_read,
        client_write,
        idle,
        stop.clone(),
        activity,
    ));

    let (sent, received) = tokio::join!(outbound, inbound);
    let joined = |result: Result<io::Result<u64>, tokio::task::JoinError>| {
        result
            .map_err(|e| ConnectionError::Relay(io::Error::other(e)))?
            .map_err(ConnectionError::Relay)
    };
    let sent = joined(sent)?;
    let received = joined(received)?;

    tracing::debug!(sent, received, "Tunnel closed");
    Ok((sent, received))
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    idle: Duration,
    stop: CancellationToken,
    activity: Arc<Activity>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    let result = loop {
        let read = tokio::select! {
            _ = stop.cancelled() => break Ok(total),
            read = timeout(idle, reader.read(&mut buf)) => read,
        };

        let n = match read {
            Ok(Ok(0)) => break Ok(total),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => break Err(e),
            // The other direction may still be busy; only a quiet pair is idle.
            Err(_) if activity.idle_for() < idle => continue,
            Err(_) => break Err(io::Error::new(io::ErrorKind::TimedOut, "tunnel idle timeout")),
        };

        match timeout(idle, writer.write_all(&buf[..n])).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => break Err(e),
            Err(_) => break Err(io::Error::new(io::ErrorKind::TimedOut, "tunnel write timeout")),
        }
        activity.touch();
        total += n as u64;
    };

    if result.is_err() {
        stop.cancel();
    }
    let _ = writer.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relay_copies_both_ways() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, mut upstream_peer) = duplex(1024);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let relay_task = tokio::spawn({
            let cancel = cancel.clone();
            let tracker = tracker.clone();
            async move { relay(client, upstream, Duration::from_secs(5), &cancel, &tracker).await }
        });

        client_peer.write_all(b"ping").await.expect("Failed to write");
        let mut buf = [0u8; 4];
        upstream_peer.read_exact(&mut buf).await.expect("Failed to read");
        assert_eq!(&buf, b"ping");

        upstream_peer.write_all(b"pong!").await.expect("Failed to write");
        let mut buf = [0u8; 5];
        client_peer.read_exact(&mut buf).await.expect("Failed to read");
        assert_eq!(&buf, b"pong!");

        drop(client_peer);
        drop(upstream_peer);

        let (sent, received) = relay_task
            .await
            .expect("Relay panicked")
            .expect("Relay failed");
        assert_eq!((sent, received), (4, 5));
    }

    #[tokio::test]
    async fn test_relay_stops_on_cancel() {
        let (client, _client_peer) = duplex(64);
        let (upstream, _upstream_peer) = duplex(64);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let relay_task = tokio::spawn({
            let cancel = cancel.clone();
            let tracker = tracker.clone();
            async move { relay(client, upstream, Duration::from_secs(60), &cancel, &tracker).await }
        });

        cancel.cancel();
        let result = timeout(Duration::from_secs(5), relay_task)
            .await
            .expect("Relay ignored cancellation")
            .expect("Relay panicked");
        assert!(result.is_ok());

        tracker.close();
        timeout(Duration::from_secs(5), tracker.wait())
            .await
            .expect("Copy tasks left running");
    }

    #[tokio::test]
    async fn test_idle_pair_times_out() {
        let (client, _client_peer) = duplex(64);
        let (upstream, _upstream_peer) = duplex(64);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let result = relay(client, upstream, Duration::from_millis(50), &cancel, &tracker).await;
        assert!(matches!(result, Err(ConnectionError::Relay(e)) if e.kind() == io::ErrorKind::TimedOut));
    }
}
