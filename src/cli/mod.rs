//! Command implementations

pub mod chats;
pub mod list;
pub mod messages;
pub mod stats;
pub mod validate;

use chrono::{DateTime, Duration, Utc};
use clap::ValueEnum;
use tokio_util::sync::CancellationToken;

/// Recency window for selecting conversations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RecencyFilter {
    All,
    /// Active within the last 30 days
    #[value(name = "30days")]
    Days30,
}

impl RecencyFilter {
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            RecencyFilter::All => None,
            RecencyFilter::Days30 => Some(now - Duration::days(30)),
        }
    }
}

/// Token that trips on the first Ctrl-C, so in-flight tasks can finish
/// their current page instead of tearing a batch.
pub(crate) fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; letting in-flight pages finish");
            trigger.cancel();
        }
    });
    cancel
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recency_cutoff() {
        let now = Utc::now();
        assert!(RecencyFilter::All.cutoff(now).is_none());
        let cutoff = RecencyFilter::Days30.cutoff(now).unwrap();
        assert_eq!((now - cutoff).num_days(), 30);
    }
}
