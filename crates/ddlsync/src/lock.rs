//! Advisory migration lock.
//!
//! Two `ddlsync` processes pointed at the same database must not plan
//! against the same snapshot. Each run takes a transaction-scoped advisory
//! lock right after `BEGIN`; Postgres releases it on commit or rollback, so
//! a crashed run can never leave it held.

use crate::traced::{Connection, ConnectionExt};
use crate::{Error, Result};
use std::time::Duration;
use tokio_postgres::error::SqlState;

/// Name hashed into the advisory lock key.
pub const LOCK_NAME: &str = "ddlsync:schema-migration";

/// Derive the 64-bit advisory lock key for a lock name.
pub fn lock_key(name: &str) -> i64 {
    let hash = blake3::hash(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    i64::from_le_bytes(bytes)
}

/// Block until the migration lock is ours, or until `lock_timeout` elapses.
///
/// Must be called inside a transaction. The session's `lock_timeout` is set
/// with `SET LOCAL`, so it also bounds every DDL statement of the run.
pub async fn acquire<C: Connection>(conn: &C, lock_timeout: Option<Duration>) -> Result<()> {
    let conn = conn.traced();
    if let Some(timeout) = lock_timeout {
        conn.batch_execute(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            timeout.as_millis()
        ))
        .await?;
    }

    let key = lock_key(LOCK_NAME);
    match conn
        .execute("SELECT pg_advisory_xact_lock($1)", &[&key])
        .await
    {
        Ok(_) => {
            tracing::debug!(key, "acquired migration lock");
            Ok(())
        }
        Err(e) if e.code() == Some(&SqlState::LOCK_NOT_AVAILABLE) => Err(Error::LockUnavailable {
            waited: lock_timeout.unwrap_or_default(),
        }),
        Err(e) => Err(Error::Postgres(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_is_stable() {
        assert_eq!(lock_key(LOCK_NAME), lock_key("ddlsync:schema-migration"));
    }

    #[test]
    fn test_lock_key_differs_by_name() {
        assert_ne!(lock_key(LOCK_NAME), lock_key("something-else"));
    }
}
