//! Page fetch boundary
//!
//! The transport that produces raw record pages is an external
//! collaborator; everything above it only sees `PageSource`. Each fetch
//! attempt classifies its own outcome so the retry loop never has to
//! guess from exception shapes.

mod api;

pub use api::{ApiTransport, ConversationListSource, MessageSource};

use async_trait::async_trait;
use thiserror::Error;

/// One page of records plus the cursor for the next one. A `None` cursor
/// is the natural end of pagination.
#[derive(Debug, Clone)]
pub struct Page<R> {
    pub records: Vec<R>,
    pub next_cursor: Option<String>,
}

/// Classification of a single fetch attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Worth retrying with backoff: network failure, timeout, throttling.
    #[error("transient fetch error: {0}")]
    Retryable(String),

    /// Retrying cannot help: rejected request, auth failure, undecodable
    /// payload.
    #[error("fatal fetch error: {0}")]
    Fatal(String),
}

impl FetchError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::Fatal(_))
    }
}

/// A paginated record feed. Pages within one source are causally ordered
/// by cursor, so calls are strictly sequential per source.
#[async_trait]
pub trait PageSource: Send {
    type Record: Send;

    /// Fetch the page at `cursor` (`None` = first page).
    async fn next_page(&mut self, cursor: Option<&str>) -> Result<Page<Self::Record>, FetchError>;
}
