//! Transaction submission module with nonce management and fee estimation

mod gas;
mod nonce;
mod sender;
mod types;

pub use gas::{FeeEstimator, PriceTrend, TrendDirection};
pub use nonce::{RepairReport, SequenceManager, SweepReport};
pub use sender::{ReconcileReport, SubmissionPipeline};
pub use types::{
    FeeOverrides, FeeQuote, RecordStatus, ReplacementKind, ReplacementOutcome, SpeedTier,
    SubmissionOutcome, SubmissionRecord, SubmissionRequest, SubmissionState, SubmissionStatus,
    TxStatus,
};
