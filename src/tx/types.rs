//! Request, quote, record and outcome types for the submission pipeline

use crate::chain::{CallRequest, GasPrice, Receipt};

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How aggressively to bid for inclusion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedTier {
    Slow,
    Standard,
    Fast,
}

impl Default for SpeedTier {
    fn default() -> Self {
        SpeedTier::Standard
    }
}

/// Caller-supplied fee settings. Explicit prices are honored or rejected,
/// never silently altered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeeOverrides {
    pub gas_limit: Option<U256>,
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
}

impl FeeOverrides {
    /// Explicit price, if the caller supplied one
    pub fn explicit_price(&self) -> Option<GasPrice> {
        if let Some(price) = self.gas_price {
            return Some(GasPrice::Legacy(price));
        }
        match (self.max_fee_per_gas, self.max_priority_fee_per_gas) {
            (Some(max_fee), Some(priority)) => Some(GasPrice::Eip1559 {
                max_fee_per_gas: max_fee,
                max_priority_fee_per_gas: priority,
            }),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &FeeOverrides::default()
    }
}

/// A transaction the caller wants on chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRequest {
    pub id: Uuid,
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub fees: FeeOverrides,
    pub speed: SpeedTier,
    pub simulate_only: bool,
    /// Free text kept for audit
    pub description: String,
}

impl SubmissionRequest {
    pub fn new(from: Address, to: Address) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            data: Bytes::default(),
            value: U256::zero(),
            fees: FeeOverrides::default(),
            speed: SpeedTier::default(),
            simulate_only: false,
            description: String::new(),
        }
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    pub fn with_fees(mut self, fees: FeeOverrides) -> Self {
        self.fees = fees;
        self
    }

    pub fn with_speed(mut self, speed: SpeedTier) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn simulate(mut self) -> Self {
        self.simulate_only = true;
        self
    }

    pub fn call(&self) -> CallRequest {
        CallRequest {
            from: self.from,
            to: self.to,
            value: self.value,
            data: self.data.clone(),
        }
    }
}

/// Fee bid for one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeQuote {
    pub gas_limit: U256,
    pub gas_price: GasPrice,
    pub estimated_cost: U256,
}

impl FeeQuote {
    pub fn new(gas_limit: U256, gas_price: GasPrice) -> Self {
        Self {
            gas_limit,
            gas_price,
            estimated_cost: Self::calculate_cost(gas_limit, &gas_price),
        }
    }

    /// Same limit, different price
    pub fn with_price(&self, gas_price: GasPrice) -> Self {
        Self::new(self.gas_limit, gas_price)
    }

    /// Calculate total cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
        gas_limit.saturating_mul(gas_price.ceiling())
    }
}

/// Lifecycle of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Created,
    Estimated,
    Reserved,
    Broadcast,
    Confirmed,
    Failed,
}

impl SubmissionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubmissionState::Confirmed | SubmissionState::Failed)
    }
}

/// Status carried by a persisted record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Broadcast,
    Confirmed,
    Failed,
    /// Another transaction took this one's nonce
    Replaced,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Broadcast => "broadcast",
            RecordStatus::Confirmed => "confirmed",
            RecordStatus::Failed => "failed",
            RecordStatus::Replaced => "replaced",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "broadcast" => Some(RecordStatus::Broadcast),
            "confirmed" => Some(RecordStatus::Confirmed),
            "failed" => Some(RecordStatus::Failed),
            "replaced" => Some(RecordStatus::Replaced),
            _ => None,
        }
    }
}

/// One append-only entry in the submission log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub id: Uuid,
    pub request_id: Uuid,
    pub sender: Address,
    pub attempt: u32,
    pub nonce: Option<u64>,
    pub quote: Option<FeeQuote>,
    pub tx_hash: Option<H256>,
    pub status: RecordStatus,
    pub block_number: Option<u64>,
    pub position: Option<u64>,
    pub cost: Option<U256>,
    pub error: Option<String>,
    /// Original transaction when this record is a cancel/replace
    pub replaces: Option<H256>,
    pub description: String,
    pub recorded_at: DateTime<Utc>,
}

impl SubmissionRecord {
    /// Record a transaction handed to the ledger
    pub fn broadcast(
        request: &SubmissionRequest,
        attempt: u32,
        nonce: u64,
        quote: FeeQuote,
        tx_hash: H256,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id: request.id,
            sender: request.from,
            attempt,
            nonce: Some(nonce),
            quote: Some(quote),
            tx_hash: Some(tx_hash),
            status: RecordStatus::Broadcast,
            block_number: None,
            position: None,
            cost: None,
            error: None,
            replaces: None,
            description: request.description.clone(),
            recorded_at: Utc::now(),
        }
    }

    /// Record a cancel or replacement sent at the nonce of `original`
    pub fn replacement(
        request_id: Uuid,
        sender: Address,
        nonce: u64,
        quote: FeeQuote,
        tx_hash: H256,
        original: H256,
        description: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            sender,
            attempt: 1,
            nonce: Some(nonce),
            quote: Some(quote),
            tx_hash: Some(tx_hash),
            status: RecordStatus::Broadcast,
            block_number: None,
            position: None,
            cost: None,
            error: None,
            replaces: Some(original),
            description,
            recorded_at: Utc::now(),
        }
    }

    /// Record a zero-value self transfer sent to fill a nonce gap
    pub fn gap_filler(sender: Address, nonce: u64, quote: FeeQuote, tx_hash: H256) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            sender,
            attempt: 1,
            nonce: Some(nonce),
            quote: Some(quote),
            tx_hash: Some(tx_hash),
            status: RecordStatus::Broadcast,
            block_number: None,
            position: None,
            cost: None,
            error: None,
            replaces: None,
            description: format!("fill nonce gap {}", nonce),
            recorded_at: Utc::now(),
        }
    }

    /// Record a request that never reached the ledger
    pub fn rejected(request: &SubmissionRequest, attempts: u32, error: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id: request.id,
            sender: request.from,
            attempt: attempts,
            nonce: None,
            quote: None,
            tx_hash: None,
            status: RecordStatus::Failed,
            block_number: None,
            position: None,
            cost: None,
            error: Some(error),
            replaces: None,
            description: request.description.clone(),
            recorded_at: Utc::now(),
        }
    }

    /// Follow-up record carrying the inclusion outcome
    pub fn included(&self, receipt: &Receipt) -> Self {
        let status = if receipt.success {
            RecordStatus::Confirmed
        } else {
            RecordStatus::Failed
        };
        Self {
            id: Uuid::new_v4(),
            status,
            block_number: Some(receipt.block_number),
            position: Some(receipt.position),
            cost: Some(receipt.cost()),
            error: (!receipt.success).then(|| "execution reverted".to_string()),
            recorded_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Follow-up record for a broadcast transaction that will never land
    pub fn dropped(&self, error: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: RecordStatus::Failed,
            error: Some(error),
            recorded_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Follow-up record for a transaction whose nonce was used by another
    pub fn superseded(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: RecordStatus::Replaced,
            recorded_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != RecordStatus::Broadcast
    }
}

/// Final result of `submit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    /// Dry run only, nothing broadcast
    Simulated,
    Confirmed,
    /// Reverted on chain or never accepted
    Failed,
    /// Broadcast but not seen in time; reconcile with `status`
    Unknown,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Simulated => "simulated",
            SubmissionStatus::Confirmed => "confirmed",
            SubmissionStatus::Failed => "failed",
            SubmissionStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    pub request_id: Uuid,
    pub status: SubmissionStatus,
    pub tx_hash: Option<H256>,
    pub nonce: Option<u64>,
    pub attempts: u32,
    pub quote: FeeQuote,
    pub receipt: Option<Receipt>,
    pub simulation: Option<Bytes>,
    pub error: Option<String>,
}

/// Ledger-side status of a transaction hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed(Receipt),
    Failed(Receipt),
    /// Neither a receipt nor the transaction is known, e.g. it was replaced
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementKind {
    Cancel,
    Replace,
}

/// Result of `cancel_or_replace`
#[derive(Debug, Clone)]
pub struct ReplacementOutcome {
    pub kind: ReplacementKind,
    pub original: H256,
    pub tx_hash: H256,
    pub nonce: u64,
    pub gas_price: GasPrice,
}
