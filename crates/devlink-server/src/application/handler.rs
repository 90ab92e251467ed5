//! Application hooks: what happens to packages and connection events.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use devlink_core::ConnectionEvent;

use super::session::Session;

/// Consumes packages decoded from a device.
///
/// Called once per package, in decode order, from the session's handle
/// loop.  An `Err` (or a panic) is logged and the next package is still
/// delivered.
#[async_trait]
pub trait PackageHandler<P>: Send + Sync + 'static {
    async fn handle(&self, session: &dyn Session, package: P) -> anyhow::Result<()>;
}

/// Observes sessions joining and leaving the registry.
///
/// Each notification runs in its own task; delivery is at most once and a
/// failure is only logged.
#[async_trait]
pub trait ConnectionListener: Send + Sync + 'static {
    async fn on_connection_event(
        &self,
        session: Arc<dyn Session>,
        event: ConnectionEvent,
    ) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> ConnectionListener for F
where
    F: Fn(Arc<dyn Session>, ConnectionEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn on_connection_event(
        &self,
        session: Arc<dyn Session>,
        event: ConnectionEvent,
    ) -> anyhow::Result<()> {
        (self)(session, event).await
    }
}
