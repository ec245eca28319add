//! Submission log
//!
//! Handles:
//! - Append-only audit records per submission attempt
//! - Lookup of the history of a request
//! - Listing broadcast transactions that still await an outcome

mod manager;
mod memory;

pub use manager::StateManager;
pub use memory::MemoryLog;

use crate::error::SubmitterResult;
use crate::tx::SubmissionRecord;

use async_trait::async_trait;
use uuid::Uuid;

/// Durable record of what was sent, when, at what fee and with which outcome
#[async_trait]
pub trait SubmissionLog: Send + Sync {
    /// Add a record. Records are never updated in place.
    async fn append(&self, record: &SubmissionRecord) -> SubmitterResult<()>;

    /// Every record of one request, oldest first
    async fn get(&self, request_id: Uuid) -> SubmitterResult<Vec<SubmissionRecord>>;

    /// Latest record per transaction hash where that record is still `Broadcast`
    async fn unresolved(&self) -> SubmitterResult<Vec<SubmissionRecord>>;

    /// Record counts by status
    async fn stats(&self) -> SubmitterResult<LogStats>;
}

/// Record counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogStats {
    pub broadcast: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub replaced: u64,
}
