//! Connection lifecycle hooks.
//!
//! The pool calls these at fixed points of a connection's life. Hooks run
//! after the pool's own session reset, so `after_release` always sees a
//! session with follower reads off and no open transaction; returning
//! `false` from `before_acquire` or `after_release` destroys the connection.

use async_trait::async_trait;
use tracing::{debug, warn, Level};

use crate::connection::Connection;
use crate::error::DbResult;
use crate::session::probe_follower_reads;

#[async_trait]
pub trait ConnectionHooks: Send + Sync {
    /// Runs once on a freshly opened connection; an error discards it
    async fn after_connect(&self, _conn: &mut dyn Connection) -> DbResult<()> {
        Ok(())
    }

    /// Runs before an idle connection is handed out; `false` vetoes it
    async fn before_acquire(&self, _conn: &mut dyn Connection) -> bool {
        true
    }

    /// Runs before a connection re-enters the idle set; `false` destroys it
    async fn after_release(&self, _conn: &mut dyn Connection) -> bool {
        true
    }

    /// Runs right before the physical connection is closed
    async fn before_close(&self, _endpoint: &str) {}
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl ConnectionHooks for NoopHooks {}

/// Default hooks: optional liveness ping, plus follower-read probes when
/// DEBUG logging is on.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionProbeHooks {
    ping_on_acquire: bool,
}

impl SessionProbeHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ping idle connections before handing them out
    pub fn ping_on_acquire(mut self, enabled: bool) -> Self {
        self.ping_on_acquire = enabled;
        self
    }
}

#[async_trait]
impl ConnectionHooks for SessionProbeHooks {
    async fn after_connect(&self, conn: &mut dyn Connection) -> DbResult<()> {
        debug!(host = conn.endpoint(), "connection established");
        Ok(())
    }

    async fn before_acquire(&self, conn: &mut dyn Connection) -> bool {
        if self.ping_on_acquire {
            if let Err(err) = conn.ping().await {
                debug!(host = conn.endpoint(), error = %err, "idle connection failed ping");
                return false;
            }
        }
        if tracing::enabled!(Level::DEBUG) {
            match probe_follower_reads(conn).await {
                Ok(on) => debug!(host = conn.endpoint(), follower_reads = on, "acquiring connection"),
                Err(err) => {
                    debug!(host = conn.endpoint(), error = %err, "follower-read probe failed");
                    return false;
                }
            }
        }
        true
    }

    async fn after_release(&self, conn: &mut dyn Connection) -> bool {
        if !tracing::enabled!(Level::DEBUG) {
            return true;
        }
        match probe_follower_reads(conn).await {
            Ok(false) => {
                debug!(host = conn.endpoint(), follower_reads = false, "released connection");
                true
            }
            Ok(true) => {
                warn!(
                    host = conn.endpoint(),
                    "released connection still reports follower reads on; discarding"
                );
                false
            }
            Err(err) => {
                debug!(host = conn.endpoint(), error = %err, "follower-read probe failed");
                false
            }
        }
    }

    async fn before_close(&self, endpoint: &str) {
        debug!(host = endpoint, "closing connection");
    }
}
