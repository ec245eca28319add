//! Transaction submitter - nonce, fee and retry management for EVM accounts
//!
//! Takes signed-off transaction requests for a set of managed accounts and
//! drives them to inclusion: nonces are reserved per account, fees are
//! estimated against the live market, failed broadcasts are classified and
//! retried, and every step is written to an append-only submission log.

pub mod chain;
pub mod config;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod signer;
pub mod state;
pub mod tx;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{SubmitterError, SubmitterResult};
