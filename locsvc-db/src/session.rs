//! Per-connection session state and the statements that change it.

use crate::connection::Connection;
use crate::error::DbResult;

/// Session setting that lets YugabyteDB serve reads from follower replicas
pub const FOLLOWER_READS_SETTING: &str = "yb_read_from_followers";

pub const ENABLE_FOLLOWER_READS: &str = "SET yb_read_from_followers = true";
pub const DISABLE_FOLLOWER_READS: &str = "SET yb_read_from_followers = false";
pub const BEGIN_READ_ONLY: &str = "BEGIN READ ONLY";
pub const COMMIT: &str = "COMMIT";
pub const ROLLBACK: &str = "ROLLBACK";

const PROBE_FOLLOWER_READS: &str =
    "SELECT current_setting('yb_read_from_followers') AS yb_read_from_followers";

/// What the pool believes about a checked-out session.
///
/// `follower_reads` is set *before* the `SET ... = true` is sent and only
/// cleared after `SET ... = false` succeeds, so an interrupted toggle always
/// errs towards "needs a reset".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionState {
    pub follower_reads: bool,
    pub in_transaction: bool,
    /// The session can no longer be trusted and must not return to idle
    pub broken: bool,
}

impl SessionState {
    /// Safe to hand to another caller as-is
    pub fn is_clean(&self) -> bool {
        !self.follower_reads && !self.in_transaction && !self.broken
    }
}

/// Ask the server whether follower reads are on for this session
pub async fn probe_follower_reads(conn: &mut dyn Connection) -> DbResult<bool> {
    let row = conn.fetch_optional(PROBE_FOLLOWER_READS, &[]).await?;
    let value: Option<String> = match row {
        Some(row) => row.get(FOLLOWER_READS_SETTING)?,
        None => None,
    };
    Ok(matches!(value.as_deref(), Some("on" | "true")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_session() {
        assert!(SessionState::default().is_clean());
        let dirty = SessionState {
            follower_reads: true,
            ..Default::default()
        };
        assert!(!dirty.is_clean());
        let broken = SessionState {
            broken: true,
            ..Default::default()
        };
        assert!(!broken.is_clean());
    }
}
