//! In-memory ledger and signer for pipeline tests

use crate::chain::{CallRequest, GasPrice, LedgerNode, LedgerTransaction, Receipt};
use crate::error::{LedgerRejection, SubmitterError, SubmitterResult};
use crate::signer::TransactionSigner;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// What `FakeSigner` hands the ledger instead of an RLP payload
#[derive(Debug, Serialize, Deserialize)]
struct StubTx {
    from: Address,
    to: Option<Address>,
    nonce: u64,
    value: U256,
    data: Bytes,
    gas_limit: U256,
    gas_price: GasPrice,
}

/// Signs for a fixed set of accounts by serializing the request
pub struct FakeSigner {
    accounts: HashSet<Address>,
}

impl FakeSigner {
    pub fn new(accounts: &[Address]) -> Self {
        Self {
            accounts: accounts.iter().copied().collect(),
        }
    }
}

#[async_trait]
impl TransactionSigner for FakeSigner {
    fn owns(&self, address: Address) -> bool {
        self.accounts.contains(&address)
    }

    fn accounts(&self) -> Vec<Address> {
        self.accounts.iter().copied().collect()
    }

    async fn sign(&self, tx: &TypedTransaction, account: Address) -> SubmitterResult<Bytes> {
        if !self.owns(account) {
            return Err(SubmitterError::Signing(format!("No key for {:?}", account)));
        }

        let gas_price = match tx {
            TypedTransaction::Eip1559(inner) => GasPrice::Eip1559 {
                max_fee_per_gas: inner.max_fee_per_gas.unwrap_or_default(),
                max_priority_fee_per_gas: inner.max_priority_fee_per_gas.unwrap_or_default(),
            },
            other => GasPrice::Legacy(other.gas_price().unwrap_or_default()),
        };
        let stub = StubTx {
            from: account,
            to: tx.to_addr().copied(),
            nonce: tx.nonce().map(|n| n.as_u64()).unwrap_or_default(),
            value: tx.value().copied().unwrap_or_default(),
            data: tx.data().cloned().unwrap_or_default(),
            gas_limit: tx.gas().copied().unwrap_or_default(),
            gas_price,
        };

        serde_json::to_vec(&stub)
            .map(Bytes::from)
            .map_err(|e| SubmitterError::Signing(e.to_string()))
    }
}

#[derive(Default)]
struct LedgerState {
    sequences: HashMap<Address, u64>,
    failures: VecDeque<SubmitterError>,
    lost_replies: VecDeque<SubmitterError>,
    hold: bool,
    revert: bool,
    pending: HashMap<H256, LedgerTransaction>,
    mined: HashMap<H256, (LedgerTransaction, Receipt)>,
    broadcasts: Vec<LedgerTransaction>,
    block: u64,
}

impl LedgerState {
    /// Include pending transactions of `from` while they are next in line
    fn drain(&mut self, from: Address) {
        loop {
            let expected = self.sequences.get(&from).copied().unwrap_or_default();
            let Some(hash) = self
                .pending
                .iter()
                .find(|(_, tx)| tx.from == from && tx.nonce == expected)
                .map(|(hash, _)| *hash)
            else {
                return;
            };
            let Some(tx) = self.pending.remove(&hash) else {
                return;
            };

            self.block += 1;
            let receipt = Receipt {
                tx_hash: hash,
                block_number: self.block,
                position: 0,
                gas_used: U256::from(21_000),
                effective_gas_price: tx.gas_price.ceiling(),
                success: !self.revert,
            };
            self.sequences.insert(from, expected + 1);
            self.mined.insert(hash, (tx, receipt));
        }
    }
}

/// Whether `new` may replace a pending transaction bid at `old`. Every fee
/// component has to rise by at least 10%.
fn outbids(new: &GasPrice, old: &GasPrice) -> bool {
    let bumped = |value: U256| value * 110 / 100;
    match (new, old) {
        (
            GasPrice::Eip1559 {
                max_fee_per_gas: new_max,
                max_priority_fee_per_gas: new_tip,
            },
            GasPrice::Eip1559 {
                max_fee_per_gas: old_max,
                max_priority_fee_per_gas: old_tip,
            },
        ) => *new_max >= bumped(*old_max) && *new_tip >= bumped(*old_tip),
        _ => new.ceiling() >= bumped(old.ceiling()),
    }
}

/// Scripted ledger: includes transactions in nonce order, enforces the
/// replacement bump and can be told to fail, lose or hold broadcasts
pub struct FakeLedger {
    chain_id: u64,
    price: GasPrice,
    state: Mutex<LedgerState>,
}

impl FakeLedger {
    pub fn new(price: GasPrice) -> Self {
        Self {
            chain_id: 31337,
            price,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn set_sequence(&self, address: Address, nonce: u64) {
        self.state.lock().unwrap().sequences.insert(address, nonce);
    }

    /// Reject the next broadcasts with these errors, in order
    pub fn fail_broadcasts(&self, errors: impl IntoIterator<Item = SubmitterError>) {
        self.state.lock().unwrap().failures.extend(errors);
    }

    /// Accept the next broadcasts but answer with these errors, in order
    pub fn lose_replies(&self, errors: impl IntoIterator<Item = SubmitterError>) {
        self.state.lock().unwrap().lost_replies.extend(errors);
    }

    /// Keep new transactions in the mempool until `mine_pending`
    pub fn hold_in_mempool(&self) {
        self.state.lock().unwrap().hold = true;
    }

    /// Include transactions with a failed execution status
    pub fn revert_all(&self) {
        self.state.lock().unwrap().revert = true;
    }

    pub fn mine_pending(&self) {
        let mut state = self.state.lock().unwrap();
        state.hold = false;
        let senders: HashSet<Address> = state.pending.values().map(|tx| tx.from).collect();
        for from in senders {
            state.drain(from);
        }
    }

    /// Every transaction the ledger accepted, in order
    pub fn broadcasts(&self) -> Vec<LedgerTransaction> {
        self.state.lock().unwrap().broadcasts.clone()
    }
}

#[async_trait]
impl LedgerNode for FakeLedger {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn confirmed_sequence(&self, address: Address) -> SubmitterResult<u64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .sequences
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn fee_market(&self) -> SubmitterResult<GasPrice> {
        Ok(self.price)
    }

    async fn estimate_compute_limit(&self, _call: &CallRequest) -> SubmitterResult<U256> {
        Ok(U256::from(21_000))
    }

    async fn simulate_call(&self, _call: &CallRequest) -> SubmitterResult<Bytes> {
        Ok(Bytes::from(vec![0x01]))
    }

    async fn broadcast(&self, signed: Bytes) -> SubmitterResult<H256> {
        let stub: StubTx = serde_json::from_slice(&signed)
            .map_err(|e| SubmitterError::Internal(format!("Undecodable payload: {}", e)))?;

        let hash = H256::from(keccak256(&signed));
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        if state.pending.contains_key(&hash) {
            return Err(SubmitterError::Rejected(LedgerRejection::AlreadyKnown));
        }

        let expected = state.sequences.get(&stub.from).copied().unwrap_or_default();
        if stub.nonce < expected {
            return Err(SubmitterError::Rejected(LedgerRejection::NonceTooLow));
        }

        let competing = state
            .pending
            .iter()
            .find(|(_, tx)| tx.from == stub.from && tx.nonce == stub.nonce)
            .map(|(hash, tx)| (*hash, tx.gas_price));
        if let Some((competing, price)) = competing {
            if !outbids(&stub.gas_price, &price) {
                return Err(SubmitterError::Rejected(
                    LedgerRejection::ReplacementUnderpriced,
                ));
            }
            state.pending.remove(&competing);
        }

        let tx = LedgerTransaction {
            hash,
            from: stub.from,
            to: stub.to,
            nonce: stub.nonce,
            value: stub.value,
            input: stub.data,
            gas_limit: stub.gas_limit,
            gas_price: stub.gas_price,
        };
        state.broadcasts.push(tx.clone());
        state.pending.insert(hash, tx);
        if !state.hold {
            state.drain(stub.from);
        }

        match state.lost_replies.pop_front() {
            Some(error) => Err(error),
            None => Ok(hash),
        }
    }

    async fn receipt(&self, tx_hash: H256) -> SubmitterResult<Option<Receipt>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .mined
            .get(&tx_hash)
            .map(|(_, receipt)| receipt.clone()))
    }

    async fn transaction(&self, tx_hash: H256) -> SubmitterResult<Option<LedgerTransaction>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pending
            .get(&tx_hash)
            .cloned()
            .or_else(|| state.mined.get(&tx_hash).map(|(tx, _)| tx.clone())))
    }
}
