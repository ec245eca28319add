//! In-process submission log, used when no database is configured

use super::{LogStats, SubmissionLog};
use crate::error::SubmitterResult;
use crate::tx::{RecordStatus, SubmissionRecord};

use async_trait::async_trait;
use ethers::types::H256;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryLog {
    records: RwLock<Vec<SubmissionRecord>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl SubmissionLog for MemoryLog {
    async fn append(&self, record: &SubmissionRecord) -> SubmitterResult<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn get(&self, request_id: Uuid) -> SubmitterResult<Vec<SubmissionRecord>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn unresolved(&self) -> SubmitterResult<Vec<SubmissionRecord>> {
        let records = self.records.read().await;

        // Insertion order is append order, so the last write per hash wins
        let mut latest: HashMap<H256, &SubmissionRecord> = HashMap::new();
        for record in records.iter() {
            if let Some(hash) = record.tx_hash {
                latest.insert(hash, record);
            }
        }

        let mut pending: Vec<SubmissionRecord> = latest
            .into_values()
            .filter(|r| r.status == RecordStatus::Broadcast)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.recorded_at);
        Ok(pending)
    }

    async fn stats(&self) -> SubmitterResult<LogStats> {
        let records = self.records.read().await;
        let mut stats = LogStats::default();
        for record in records.iter() {
            match record.status {
                RecordStatus::Broadcast => stats.broadcast += 1,
                RecordStatus::Confirmed => stats.confirmed += 1,
                RecordStatus::Failed => stats.failed += 1,
                RecordStatus::Replaced => stats.replaced += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{GasPrice, Receipt};
    use crate::tx::{FeeQuote, SubmissionRequest};
    use ethers::types::{Address, U256};

    fn broadcast(request: &SubmissionRequest, nonce: u64, hash: u64) -> SubmissionRecord {
        let quote = FeeQuote::new(U256::from(21_000), GasPrice::Legacy(U256::from(10)));
        SubmissionRecord::broadcast(request, 1, nonce, quote, H256::from_low_u64_be(hash))
    }

    #[tokio::test]
    async fn test_get_returns_history_in_order() {
        let log = MemoryLog::new();
        let request = SubmissionRequest::new(Address::repeat_byte(1), Address::repeat_byte(2));
        let other = SubmissionRequest::new(Address::repeat_byte(1), Address::repeat_byte(3));

        let first = broadcast(&request, 0, 1);
        log.append(&first).await.unwrap();
        log.append(&broadcast(&other, 1, 2)).await.unwrap();
        log.append(&first.dropped("superseded".into())).await.unwrap();

        let history = log.get(request.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, RecordStatus::Broadcast);
        assert_eq!(history[1].status, RecordStatus::Failed);
    }

    #[tokio::test]
    async fn test_unresolved_uses_latest_record_per_hash() {
        let log = MemoryLog::new();
        let request = SubmissionRequest::new(Address::repeat_byte(1), Address::repeat_byte(2));

        let done = broadcast(&request, 0, 1);
        let pending = broadcast(&request, 1, 2);
        log.append(&done).await.unwrap();
        log.append(&pending).await.unwrap();

        let receipt = Receipt {
            tx_hash: H256::from_low_u64_be(1),
            block_number: 10,
            position: 0,
            gas_used: U256::from(21_000),
            effective_gas_price: U256::from(10),
            success: true,
        };
        log.append(&done.included(&receipt)).await.unwrap();

        let unresolved = log.unresolved().await.unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].tx_hash, Some(H256::from_low_u64_be(2)));

        let stats = log.stats().await.unwrap();
        assert_eq!(
            stats,
            LogStats {
                broadcast: 2,
                confirmed: 1,
                failed: 0,
                replaced: 0
            }
        );
    }
}
