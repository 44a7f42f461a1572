//! Burst coordination: debounce a client's multi-message burst, elect a
//! single writer through the session row, and gather the resulting turn.
//!
//! Invocations share nothing but the store. Every fact used here is re-read
//! from it on each invocation.

pub mod aggregate;
pub mod lock;
pub mod stability;
pub mod traits;

pub use aggregate::{BurstAggregator, PendingTurn};
pub use lock::{LockError, LockLease, LockManager, LockOutcome};
pub use stability::StabilityDetector;
pub use traits::{BurstTimings, Decision};

use crate::sessions::Store;
use std::sync::Arc;

pub fn create_stability_detector(store: Arc<dyn Store>, timings: BurstTimings) -> StabilityDetector {
    StabilityDetector::new(store, timings)
}

pub fn create_lock_manager(store: Arc<dyn Store>, timings: BurstTimings) -> LockManager {
    LockManager::new(store, timings.lock_ttl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::{SessionStore, SqliteStore};
    use std::time::Duration;

    #[tokio::test]
    async fn lock_manager_factory_applies_the_configured_ttl() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let session = store.create_session("5511444440000").await.unwrap();
        let timings = BurstTimings {
            lock_ttl: Duration::from_secs(90),
            ..BurstTimings::default()
        };

        let manager = create_lock_manager(store.clone(), timings);
        let LockOutcome::Acquired(lease) = manager.acquire(&session.id, "inv").await else {
            panic!("acquisition should win");
        };

        let remaining = lease.expires_at() - chrono::Utc::now();
        assert!(remaining > chrono::Duration::seconds(80));
        assert!(remaining <= chrono::Duration::seconds(90));
        assert!(lease.release().await.unwrap());
    }
}
