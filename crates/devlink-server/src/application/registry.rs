//! Device identity → live session.
//!
//! At most one session is registered per device key.  When a device
//! reconnects, the new session replaces the old one; the old one is marked
//! expired and closed with [`CloseReason::SessionExpired`], and listeners see
//! a single [`ConnectionEvent::Reconnect`] for the new session.

use std::collections::HashMap;
use std::sync::Arc;

use devlink_core::{CloseReason, ConnectionEvent};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::handler::ConnectionListener;
use super::session::Session;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<dyn Session>>>,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Registers a running session under its device key.
    ///
    /// If another session already holds the key it is expired and closed
    /// and a `Reconnect` event is fired; otherwise a `Connect` event.
    /// Registering the same session twice only fires `Connect` again.
    pub async fn connect(&self, session: Arc<dyn Session>) {
        let key = session.device_key().to_string();
        let previous = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(key.clone(), Arc::clone(&session))
        };

        let event = match previous {
            Some(old) if old.session_id() != session.session_id() => {
                info!(
                    device_key = %key,
                    old_session = %old.session_id(),
                    new_session = %session.session_id(),
                    "device reconnected, replacing session"
                );
                old.mark_expired();
                old.close(CloseReason::SessionExpired).await;
                ConnectionEvent::Reconnect
            }
            _ => {
                info!(device_key = %key, session_id = %session.session_id(), "device connected");
                ConnectionEvent::Connect
            }
        };
        self.notify(session, event).await;
    }

    /// Removes and closes the session registered under `device_key`.
    /// Unknown keys are ignored.
    pub async fn disconnect(&self, device_key: &str) {
        let removed = self.sessions.write().await.remove(device_key);
        let Some(session) = removed else {
            debug!(%device_key, "disconnect for unknown device ignored");
            return;
        };
        session.close(CloseReason::RemoteClose).await;
        info!(%device_key, "device disconnected");
        self.notify(session, ConnectionEvent::Disconnect).await;
    }

    /// Unregisters `session` after it closed on its own.
    ///
    /// The entry is only removed if it still belongs to `session`; a newer
    /// session registered under the same key is left alone.
    pub async fn disconnect_session(&self, session: &Arc<dyn Session>) {
        let key = session.device_key();
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(key) {
                Some(current) if current.session_id() == session.session_id() => {
                    sessions.remove(key)
                }
                _ => None,
            }
        };
        if removed.is_some() {
            info!(device_key = %key, reason = ?session.close_reason(), "device disconnected");
            self.notify(Arc::clone(session), ConnectionEvent::Disconnect).await;
        }
    }

    pub async fn get(&self, device_key: &str) -> Option<Arc<dyn Session>> {
        self.sessions.read().await.get(device_key).cloned()
    }

    /// Snapshot of every registered session.
    pub async fn list_all(&self) -> Vec<Arc<dyn Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Fires `event` at every listener, each in its own task.
    async fn notify(&self, session: Arc<dyn Session>, event: ConnectionEvent) {
        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let key = session.device_key().to_string();
                if let Err(e) = listener.on_connection_event(session, event).await {
                    warn!(device_key = %key, %event, error = %e, "connection listener failed");
                }
            });
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
