use crate::config::BurstConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing policy of one invocation's wait-then-lock cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstTimings {
    pub initial_wait: Duration,
    pub check_interval: Duration,
    pub stability_window: Duration,
    pub max_total_wait: Duration,
    pub lock_ttl: Duration,
    pub response_timeout: Duration,
}

impl BurstTimings {
    pub fn from_config(config: &BurstConfig) -> Self {
        Self {
            initial_wait: config.initial_wait(),
            check_interval: config.check_interval(),
            stability_window: config.stability_window(),
            max_total_wait: config.max_total_wait(),
            lock_ttl: config.lock_ttl(),
            response_timeout: config.response_timeout(),
        }
    }
}

impl Default for BurstTimings {
    fn default() -> Self {
        Self::from_config(&BurstConfig::default())
    }
}

/// What the stability detector concluded for the tracked message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// A newer client message exists; its own invocation takes over.
    Superseded { by: i64 },
    /// The burst went quiet for the full stability window.
    Stable,
    /// The total wait budget ran out before the burst went quiet.
    DeadlineReached,
}

impl Decision {
    pub fn proceeds(self) -> bool {
        !matches!(self, Self::Superseded { .. })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Superseded { .. } => "superseded",
            Self::Stable => "stable",
            Self::DeadlineReached => "deadline_reached",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_supersession_stops_the_pipeline() {
        assert!(!Decision::Superseded { by: 7 }.proceeds());
        assert!(Decision::Stable.proceeds());
        assert!(Decision::DeadlineReached.proceeds());
    }

    #[test]
    fn default_timings_keep_the_required_ordering() {
        let t = BurstTimings::default();
        assert!(t.check_interval < t.stability_window);
        assert!(t.stability_window < t.max_total_wait);
        assert!(t.response_timeout < t.lock_ttl);
    }
}
