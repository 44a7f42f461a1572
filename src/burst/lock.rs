//! Single-writer election over the session row.
//!
//! The store's conditional update is the only source of truth: a lease is
//! held because the datastore said so, never because this process remembers
//! taking it. Expiry heals locks whose holder vanished.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::sessions::{LockAttempt, SessionId, SessionStore, Store};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("session {0} does not exist")]
    MissingSession(SessionId),
    #[error("lock on session {0} is no longer held by this invocation")]
    Lost(SessionId),
    #[error("lock store unavailable: {0:#}")]
    Store(#[source] anyhow::Error),
}

/// Result of an acquisition attempt. Only `Acquired` grants processing rights.
#[derive(Debug)]
pub enum LockOutcome {
    Acquired(LockLease),
    /// Another token holds an unexpired lock.
    Contended { owner: Option<String> },
    /// The store could not confirm ownership; treated like contention.
    Unavailable(LockError),
}

pub struct LockManager {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Fresh opaque token identifying one invocation.
    pub fn new_token() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Compare-and-set the session lock to `token`. Fails closed on store errors.
    pub async fn acquire(&self, session_id: &SessionId, token: &str) -> LockOutcome {
        match self.store.try_acquire_lock(session_id, token, self.ttl).await {
            Ok(LockAttempt::Acquired { expires_at }) => {
                tracing::debug!(
                    session_id = %session_id,
                    invocation = token,
                    expires_at = %expires_at,
                    "Session lock acquired"
                );
                LockOutcome::Acquired(LockLease {
                    store: Arc::clone(&self.store),
                    session_id: session_id.clone(),
                    token: token.to_string(),
                    ttl: self.ttl,
                    expires_at,
                    released: false,
                })
            }
            Ok(LockAttempt::Held { owner, expires_at }) => {
                tracing::debug!(
                    session_id = %session_id,
                    invocation = token,
                    owner = owner.as_deref().unwrap_or("<released>"),
                    expires_at = ?expires_at,
                    "Session lock held elsewhere"
                );
                LockOutcome::Contended { owner }
            }
            Ok(LockAttempt::MissingSession) => {
                LockOutcome::Unavailable(LockError::MissingSession(session_id.clone()))
            }
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id,
                    invocation = token,
                    "Lock acquisition failed closed: {error:#}"
                );
                LockOutcome::Unavailable(LockError::Store(error))
            }
        }
    }
}

/// Proof of a successful acquisition.
///
/// Release it explicitly with [`LockLease::release`]. A lease dropped without
/// release (panic, cancelled task) schedules a best-effort release on the
/// current runtime; the TTL covers the case where none is available.
pub struct LockLease {
    store: Arc<dyn Store>,
    session_id: SessionId,
    token: String,
    ttl: Duration,
    expires_at: DateTime<Utc>,
    released: bool,
}

impl std::fmt::Debug for LockLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockLease")
            .field("session_id", &self.session_id)
            .field("token", &self.token)
            .field("expires_at", &self.expires_at)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockLease {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Extend the expiry by another TTL. Fails with `Lost` once the lease expired.
    pub async fn renew(&mut self) -> Result<(), LockError> {
        let renewed = self
            .store
            .renew_lock(&self.session_id, &self.token, self.ttl)
            .await
            .map_err(LockError::Store)?;
        if !renewed {
            return Err(LockError::Lost(self.session_id.clone()));
        }
        self.expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero());
        Ok(())
    }

    /// Clear the lock if this token still owns it. `Ok(false)` means someone
    /// else took over after expiry and their lock was left alone.
    pub async fn release(mut self) -> Result<bool, LockError> {
        self.released = true;
        let cleared = self
            .store
            .release_lock(&self.session_id, &self.token)
            .await
            .map_err(LockError::Store)?;
        if !cleared {
            tracing::warn!(
                session_id = %self.session_id,
                invocation = %self.token,
                "Lock was no longer ours at release"
            );
        }
        Ok(cleared)
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                session_id = %self.session_id,
                "Lock lease dropped outside a runtime; leaving it to expire"
            );
            return;
        };
        let store = Arc::clone(&self.store);
        let session_id = self.session_id.clone();
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(error) = store.release_lock(&session_id, &token).await {
                tracing::warn!(
                    session_id = %session_id,
                    "Deferred lock release failed: {error:#}"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::{SqliteStore, SessionStore as _};

    async fn setup() -> (Arc<SqliteStore>, SessionId) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let session = store.create_session("5511666660000").await.unwrap();
        (store, session.id)
    }

    #[tokio::test]
    async fn second_acquirer_sees_contention_with_owner() {
        let (store, sid) = setup().await;
        let manager = LockManager::new(store.clone(), Duration::from_secs(30));

        let LockOutcome::Acquired(lease) = manager.acquire(&sid, "inv-a").await else {
            panic!("first acquisition should win");
        };
        match manager.acquire(&sid, "inv-b").await {
            LockOutcome::Contended { owner } => assert_eq!(owner.as_deref(), Some("inv-a")),
            other => panic!("expected contention, got {other:?}"),
        }

        assert!(lease.release().await.unwrap());
        assert!(matches!(
            manager.acquire(&sid, "inv-b").await,
            LockOutcome::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn renew_pushes_the_expiry_forward() {
        let (store, sid) = setup().await;
        let manager = LockManager::new(store.clone(), Duration::from_secs(30));
        let LockOutcome::Acquired(mut lease) = manager.acquire(&sid, "inv-a").await else {
            panic!("acquisition should win");
        };
        let first_expiry = lease.expires_at();

        tokio::time::sleep(Duration::from_millis(20)).await;
        lease.renew().await.unwrap();

        assert!(lease.expires_at() > first_expiry);
        let row = store.get_session(&sid).await.unwrap().unwrap();
        assert!(row.lock_expires_at.unwrap() > first_expiry);
        assert!(lease.release().await.unwrap());
    }

    #[tokio::test]
    async fn missing_session_fails_closed() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let manager = LockManager::new(store, Duration::from_secs(30));
        let outcome = manager
            .acquire(&SessionId::from_string("ghost"), "inv")
            .await;
        assert!(matches!(
            outcome,
            LockOutcome::Unavailable(LockError::MissingSession(_))
        ));
    }

    #[tokio::test]
    async fn expired_lease_cannot_renew_or_clear_the_new_owner() {
        let (store, sid) = setup().await;
        let short = LockManager::new(store.clone(), Duration::from_millis(20));
        let LockOutcome::Acquired(mut stale) = short.acquire(&sid, "inv-old").await else {
            panic!("first acquisition should win");
        };

        tokio::time::sleep(Duration::from_millis(60)).await;

        let long = LockManager::new(store.clone(), Duration::from_secs(30));
        let LockOutcome::Acquired(fresh) = long.acquire(&sid, "inv-new").await else {
            panic!("expired lock should be reacquirable");
        };

        assert!(matches!(stale.renew().await, Err(LockError::Lost(_))));
        assert!(!stale.release().await.unwrap());
        let row = store.get_session(&sid).await.unwrap().unwrap();
        assert_eq!(row.lock_owner.as_deref(), Some("inv-new"));

        assert!(fresh.release().await.unwrap());
    }

    #[tokio::test]
    async fn dropped_lease_is_released_in_the_background() {
        let (store, sid) = setup().await;
        let manager = LockManager::new(store.clone(), Duration::from_secs(30));
        let LockOutcome::Acquired(lease) = manager.acquire(&sid, "inv-dropped").await else {
            panic!("acquisition should win");
        };
        drop(lease);

        let mut released = false;
        for _ in 0..50 {
            let row = store.get_session(&sid).await.unwrap().unwrap();
            if row.lock_owner.is_none() {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released, "dropped lease should be released");
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(LockManager::new_token(), LockManager::new_token());
    }
}
