//! Debounce for one inbound message: wait until its burst goes quiet, or
//! step aside when a newer message shows up.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::time::Instant;

use super::traits::{BurstTimings, Decision};
use crate::sessions::{SessionId, SessionStore, Store};

pub struct StabilityDetector {
    store: Arc<dyn Store>,
    timings: BurstTimings,
}

impl StabilityDetector {
    pub fn new(store: Arc<dyn Store>, timings: BurstTimings) -> Self {
        Self { store, timings }
    }

    /// Block until `tracked` is ripe for processing or superseded.
    ///
    /// Read-only. Returns within `max_total_wait` plus one store round trip.
    pub async fn wait_for_quiet(&self, session_id: &SessionId, tracked: i64) -> Result<Decision> {
        let started = Instant::now();

        tokio::time::sleep(self.timings.initial_wait).await;
        let latest = self.latest_inbound_id(session_id).await?;
        if latest > tracked {
            return Ok(superseded(session_id, latest));
        }

        let mut last_seen = latest.max(tracked);
        let mut last_new_message_time = Instant::now();

        loop {
            let elapsed = started.elapsed();
            if elapsed >= self.timings.max_total_wait {
                return Ok(Decision::DeadlineReached);
            }
            if last_new_message_time.elapsed() >= self.timings.stability_window {
                return Ok(Decision::Stable);
            }

            let remaining = self.timings.max_total_wait - elapsed;
            tokio::time::sleep(self.timings.check_interval.min(remaining)).await;

            let latest = self.latest_inbound_id(session_id).await?;
            if latest > last_seen {
                if latest != tracked {
                    return Ok(superseded(session_id, latest));
                }
                last_seen = latest;
                last_new_message_time = Instant::now();
            }
        }
    }

    async fn latest_inbound_id(&self, session_id: &SessionId) -> Result<i64> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .with_context(|| format!("session {session_id} disappeared while waiting"))?;
        Ok(session.last_inbound_message_id.unwrap_or(0))
    }
}

fn superseded(session_id: &SessionId, newer: i64) -> Decision {
    tracing::debug!(
        session_id = %session_id,
        newer_message_id = newer,
        "Superseded by a newer message"
    );
    Decision::Superseded { by: newer }
}
