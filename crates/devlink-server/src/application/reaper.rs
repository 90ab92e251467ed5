//! Periodic idle-session sweep.
//!
//! Devices are expected to send something at least once per
//! `idle_timeout`.  Every `interval` the reaper closes sessions whose last
//! heartbeat is older than that with [`CloseReason::Timeout`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use devlink_core::CloseReason;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::SessionRegistry;

/// Defaults: sweep every two minutes, close after five idle minutes.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct IdleReaper {
    registry: Arc<SessionRegistry>,
    interval: Duration,
    idle_timeout: Duration,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IdleReaper {
    pub fn new(registry: Arc<SessionRegistry>, interval: Duration, idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            interval,
            idle_timeout,
            token: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Spawns the sweep loop.  Calling it again while running does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() || self.token.is_cancelled() {
            return;
        }
        let reaper = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            info!(
                interval = ?reaper.interval,
                idle_timeout = ?reaper.idle_timeout,
                "idle reaper started"
            );
            loop {
                tokio::select! {
                    _ = reaper.token.cancelled() => break,
                    _ = tokio::time::sleep(reaper.interval) => {}
                }
                let closed = reaper.sweep().await;
                if closed > 0 {
                    info!(closed, "closed idle sessions");
                }
            }
            debug!("idle reaper loop finished");
        }));
    }

    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    /// Closes every live session whose last heartbeat is at or before
    /// `now - idle_timeout`.  Returns how many were closed.
    pub async fn sweep_at(&self, now: Instant) -> usize {
        let Some(cutoff) = now.checked_sub(self.idle_timeout) else {
            return 0;
        };
        let mut closed = 0;
        for session in self.registry.list_all().await {
            if session.is_closed() {
                continue;
            }
            let idle_since = session.last_heartbeat();
            if idle_since <= cutoff {
                debug!(
                    device_key = %session.device_key(),
                    idle_for = ?now.saturating_duration_since(idle_since),
                    "closing idle session"
                );
                session.close(CloseReason::Timeout).await;
                closed += 1;
            }
        }
        closed
    }

    /// Stops the sweep loop and closes every registered session with
    /// [`CloseReason::ServerShutdown`].
    pub async fn stop(&self) {
        self.token.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let sessions = self.registry.list_all().await;
        let count = sessions.len();
        for session in sessions {
            session.close(CloseReason::ServerShutdown).await;
        }
        info!(closed = count, "idle reaper stopped");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::session::Session;
    use crate::application::testing::FakeSession;

    fn reaper(registry: &Arc<SessionRegistry>) -> Arc<IdleReaper> {
        IdleReaper::new(Arc::clone(registry), Duration::from_secs(10), Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_closes_only_idle_sessions() {
        // Arrange
        let registry = Arc::new(SessionRegistry::new());
        let now = Instant::now();
        let idle = FakeSession::new("s1", "idle");
        idle.fake_channel().set_last_active(now);
        let busy = FakeSession::new("s2", "busy");
        busy.fake_channel().set_last_active(now + Duration::from_secs(30));
        registry.connect(idle.clone()).await;
        registry.connect(busy.clone()).await;

        // Act
        let closed = reaper(&registry).sweep_at(now + Duration::from_secs(60)).await;

        // Assert
        assert_eq!(closed, 1);
        assert_eq!(idle.close_reason(), Some(CloseReason::Timeout));
        assert!(!busy.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_minute_timeout_closes_only_sessions_idle_longer() {
        // Arrange: 300 s idle timeout swept every 100 s; at t = 400 s one
        // session has been idle 400 s, the other 100 s.
        let registry = Arc::new(SessionRegistry::new());
        let start = Instant::now();
        let stale = FakeSession::new("s1", "stale");
        stale.fake_channel().set_last_active(start);
        let fresh = FakeSession::new("s2", "fresh");
        fresh.fake_channel().set_last_active(start + Duration::from_secs(300));
        registry.connect(stale.clone()).await;
        registry.connect(fresh.clone()).await;
        let reaper = IdleReaper::new(
            Arc::clone(&registry),
            Duration::from_secs(100),
            Duration::from_secs(300),
        );

        // Act
        let closed = reaper.sweep_at(start + Duration::from_secs(400)).await;

        // Assert
        assert_eq!(closed, 1);
        assert_eq!(stale.close_reason(), Some(CloseReason::Timeout));
        assert!(!fresh.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_skips_already_closed_sessions() {
        let registry = Arc::new(SessionRegistry::new());
        let now = Instant::now();
        let session = FakeSession::new("s1", "dev");
        session.fake_channel().set_last_active(now);
        registry.connect(session.clone()).await;
        session.close(CloseReason::RemoteClose).await;

        let closed = reaper(&registry).sweep_at(now + Duration::from_secs(600)).await;

        assert_eq!(closed, 0);
        assert_eq!(session.close_reason(), Some(CloseReason::RemoteClose));
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_reaper_closes_idle_session_after_timeout() {
        let registry = Arc::new(SessionRegistry::new());
        let session = FakeSession::new("s1", "dev");
        session.fake_channel().set_last_active(Instant::now());
        registry.connect(session.clone()).await;
        let reaper = reaper(&registry);

        reaper.start();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!session.is_closed());
        tokio::time::sleep(Duration::from_secs(45)).await;

        assert_eq!(session.close_reason(), Some(CloseReason::Timeout));
        reaper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_every_session_with_server_shutdown() {
        let registry = Arc::new(SessionRegistry::new());
        let a = FakeSession::new("s1", "a");
        let b = FakeSession::new("s2", "b");
        registry.connect(a.clone()).await;
        registry.connect(b.clone()).await;
        let reaper = reaper(&registry);
        reaper.start();

        reaper.stop().await;

        assert_eq!(a.close_reason(), Some(CloseReason::ServerShutdown));
        assert_eq!(b.close_reason(), Some(CloseReason::ServerShutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_after_stop_does_not_restart() {
        let registry = Arc::new(SessionRegistry::new());
        let reaper = reaper(&registry);
        reaper.stop().await;

        reaper.start();

        assert!(reaper.task.lock().unwrap().is_none());
    }
}
