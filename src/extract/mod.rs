mod heuristic;
mod model;

pub use heuristic::{guess_language, scan_signals, ChangeSignals, HeuristicExtractor};
pub use model::LlmExtractor;

use async_trait::async_trait;

use crate::errors::RowError;
use crate::page::Page;
use crate::record::ChangeRecord;

/// What an extractor knows about the row besides the page itself.
#[derive(Debug, Clone, Copy)]
pub struct UrlContext<'a> {
    pub row_number: u64,
    pub url: &'a str,
    /// Record from the previous stage, when re-extracting.
    pub existing: Option<&'a ChangeRecord>,
}

/// Turns a parsed page into a change record.
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    async fn extract(&self, page: &Page, ctx: &UrlContext<'_>) -> Result<ChangeRecord, RowError>;
}
