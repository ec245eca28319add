//! Ledger access
//!
//! This module provides:
//! - The [`LedgerNode`] trait the pipeline talks to
//! - Fee, call, receipt and transaction value types shared by the pipeline
//! - An ethers-backed implementation with multi-RPC failover
//! - The single table that maps node error messages onto [`LedgerRejection`]

pub mod provider;

pub use provider::EthersNode;

use crate::error::{LedgerRejection, SubmitterError, SubmitterResult};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

/// Gas price types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// Highest per-gas price this bid can be charged
    pub fn ceiling(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => *max_fee_per_gas,
        }
    }

    /// Scale every component by `percent` / 100, rounding up
    pub fn scale_percent(&self, percent: u64) -> GasPrice {
        let scale = |value: U256| {
            let scaled = value.saturating_mul(U256::from(percent));
            let hundred = U256::from(100);
            let (quotient, remainder) = scaled.div_mod(hundred);
            if remainder.is_zero() {
                quotient
            } else {
                quotient + 1
            }
        };
        match self {
            GasPrice::Legacy(price) => GasPrice::Legacy(scale(*price)),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: scale(*max_fee_per_gas),
                max_priority_fee_per_gas: scale(*max_priority_fee_per_gas),
            },
        }
    }

    /// Cap every component at `max`
    pub fn clamp(&self, max: U256) -> GasPrice {
        match self {
            GasPrice::Legacy(price) => GasPrice::Legacy((*price).min(max)),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let max_fee = (*max_fee_per_gas).min(max);
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: (*max_priority_fee_per_gas).min(max_fee),
                }
            }
        }
    }
}

/// A call as the node sees it before signing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

/// Inclusion receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: H256,
    pub block_number: u64,
    /// Index of the transaction inside its block
    pub position: u64,
    pub gas_used: U256,
    pub effective_gas_price: U256,
    /// False when execution reverted
    pub success: bool,
}

impl Receipt {
    /// Fee actually paid
    pub fn cost(&self) -> U256 {
        self.gas_used.saturating_mul(self.effective_gas_price)
    }
}

/// A transaction as stored by the ledger (pending or included)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTransaction {
    pub hash: H256,
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: u64,
    pub value: U256,
    pub input: Bytes,
    pub gas_limit: U256,
    pub gas_price: GasPrice,
}

/// Operations the pipeline needs from a ledger access node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerNode: Send + Sync {
    /// Chain ID the node serves
    fn chain_id(&self) -> u64;

    /// Next nonce the ledger expects from `address` (confirmed state)
    async fn confirmed_sequence(&self, address: Address) -> SubmitterResult<u64>;

    /// Current fee market snapshot
    async fn fee_market(&self) -> SubmitterResult<GasPrice>;

    /// Gas needed to execute `call`
    async fn estimate_compute_limit(&self, call: &CallRequest) -> SubmitterResult<U256>;

    /// Dry-run `call` without broadcasting
    async fn simulate_call(&self, call: &CallRequest) -> SubmitterResult<Bytes>;

    /// Submit a signed transaction
    async fn broadcast(&self, signed: Bytes) -> SubmitterResult<H256>;

    /// Receipt for an included transaction
    async fn receipt(&self, tx_hash: H256) -> SubmitterResult<Option<Receipt>>;

    /// Look up a pending or included transaction
    async fn transaction(&self, tx_hash: H256) -> SubmitterResult<Option<LedgerTransaction>>;
}

/// Node error fragments and the rejection they denote. Order matters: the
/// first matching fragment wins.
const REJECTION_TABLE: &[(&str, LedgerRejection)] = &[
    ("nonce too low", LedgerRejection::NonceTooLow),
    ("nonce too high", LedgerRejection::NonceTooHigh),
    ("already known", LedgerRejection::AlreadyKnown),
    ("known transaction", LedgerRejection::AlreadyKnown),
    (
        "replacement transaction underpriced",
        LedgerRejection::ReplacementUnderpriced,
    ),
    ("transaction underpriced", LedgerRejection::Underpriced),
    ("max fee per gas less than block base fee", LedgerRejection::Underpriced),
    ("insufficient funds", LedgerRejection::InsufficientFunds),
    ("exceeds block gas limit", LedgerRejection::GasLimitExceeded),
];

const RATE_LIMIT_FRAGMENTS: &[&str] = &["rate limit", "too many requests", "429"];

/// Map a node error message onto the error taxonomy
pub fn classify_node_error(operation: &str, message: &str) -> SubmitterError {
    let lowered = message.to_lowercase();

    if let Some((_, rejection)) = REJECTION_TABLE
        .iter()
        .find(|(fragment, _)| lowered.contains(fragment))
    {
        return SubmitterError::Rejected(rejection.clone());
    }

    if lowered.contains("execution reverted") {
        return SubmitterError::Rejected(LedgerRejection::Reverted(message.to_string()));
    }

    if RATE_LIMIT_FRAGMENTS
        .iter()
        .any(|fragment| lowered.contains(fragment))
    {
        return SubmitterError::RateLimited {
            operation: operation.to_string(),
        };
    }

    SubmitterError::Rpc {
        operation: operation.to_string(),
        message: message.to_string(),
    }
}
