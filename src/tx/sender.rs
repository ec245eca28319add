//! Submission pipeline: estimate, reserve, sign, broadcast and await inclusion

use super::gas::FeeEstimator;
use super::nonce::SequenceManager;
use super::types::{
    FeeQuote, ReplacementKind, ReplacementOutcome, SpeedTier, SubmissionOutcome,
    SubmissionRecord, SubmissionRequest, SubmissionState, SubmissionStatus, TxStatus,
};
use crate::chain::{GasPrice, LedgerNode, Receipt};
use crate::config::PipelineConfig;
use crate::error::{LedgerRejection, SubmitterError, SubmitterResult};
use crate::retry::{RetryEngine, RetryPolicy};
use crate::signer::TransactionSigner;
use crate::state::SubmissionLog;

use ethers::prelude::*;
use chrono::Utc;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::keccak256;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A broadcast that the retried block handed back
struct Landed {
    tx_hash: H256,
    nonce: u64,
    receipt: Option<Receipt>,
}

/// State carried from one attempt of a submission to the next
struct AttemptState {
    quote: FeeQuote,
    /// Sent without a clear answer from the node; resent as-is next time
    unsettled: Option<Unsettled>,
}

struct Unsettled {
    nonce: u64,
    signed: Bytes,
    tx_hash: H256,
}

/// What reconciliation concluded about a broadcast the ledger does not know
enum Settled {
    Superseded,
    Dropped,
    Waiting,
}

/// Counts from one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub replaced: usize,
    /// Broadcasts the ledger lost before inclusion
    pub dropped: usize,
    pub pending: usize,
    /// Gap filler transactions sent
    pub filled: usize,
}

/// End-to-end transaction submission for managed accounts
pub struct SubmissionPipeline {
    node: Arc<dyn LedgerNode>,
    signer: Arc<dyn TransactionSigner>,
    log: Arc<dyn SubmissionLog>,
    sequences: Arc<SequenceManager>,
    fees: Arc<FeeEstimator>,
    retry: RetryEngine,
    transaction_policy: RetryPolicy,
    rpc_policy: RetryPolicy,
    config: PipelineConfig,
}

impl SubmissionPipeline {
    pub fn new(
        node: Arc<dyn LedgerNode>,
        signer: Arc<dyn TransactionSigner>,
        log: Arc<dyn SubmissionLog>,
        sequences: Arc<SequenceManager>,
        fees: Arc<FeeEstimator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            node,
            signer,
            log,
            sequences,
            fees,
            retry: RetryEngine::new(),
            transaction_policy: RetryPolicy::transaction(),
            rpc_policy: RetryPolicy::rpc_query(),
            config,
        }
    }

    /// Replace the transaction and read retry profiles
    pub fn with_retry(mut self, transaction: RetryPolicy, rpc: RetryPolicy) -> Self {
        self.transaction_policy = transaction;
        self.rpc_policy = rpc;
        self
    }

    pub fn sequences(&self) -> &Arc<SequenceManager> {
        &self.sequences
    }

    pub fn fees(&self) -> &Arc<FeeEstimator> {
        &self.fees
    }

    /// Run a request through the whole pipeline.
    ///
    /// Invalid requests and out-of-bound fees are returned as errors. Anything
    /// that fails once a nonce is involved is reported through the outcome.
    pub async fn submit(&self, request: SubmissionRequest) -> SubmitterResult<SubmissionOutcome> {
        let started = Instant::now();
        let chain_id = self.node.chain_id();

        self.validate(&request)?;
        debug!(
            request_id = %request.id,
            state = ?SubmissionState::Created,
            to = ?request.to,
            selector = %hex::encode(request.data.get(..4).unwrap_or_default()),
            "Accepted request"
        );

        let quote = self.fees.estimate(&request, request.speed).await?;
        debug!(
            request_id = %request.id,
            state = ?SubmissionState::Estimated,
            gas_limit = %quote.gas_limit,
            cost = %quote.estimated_cost,
            "Estimated fees"
        );

        if request.simulate_only {
            let call = request.call();
            let output = self.read(|_| self.node.simulate_call(&call)).await?;
            info!(request_id = %request.id, "Simulated request");
            crate::metrics::record_submission(chain_id, SubmissionStatus::Simulated.as_str());
            return Ok(SubmissionOutcome {
                request_id: request.id,
                status: SubmissionStatus::Simulated,
                tx_hash: None,
                nonce: None,
                attempts: 0,
                quote,
                receipt: None,
                simulation: Some(output),
                error: None,
            });
        }

        let cell = Mutex::new(AttemptState {
            quote,
            unsettled: None,
        });
        let retried = {
            let request = &request;
            let cell = &cell;
            self.retry
                .execute(&self.transaction_policy, move |attempt| {
                    self.attempt_once(request, cell, attempt)
                })
                .await
        };
        let attempts = retried.attempts;
        let AttemptState { quote, unsettled } = cell.into_inner();

        let outcome = match (retried.result, unsettled) {
            (Ok(landed), _) => {
                let status = match &landed.receipt {
                    Some(receipt) if receipt.success => SubmissionStatus::Confirmed,
                    Some(_) => SubmissionStatus::Failed,
                    None => SubmissionStatus::Unknown,
                };
                let error = match status {
                    SubmissionStatus::Failed => Some("execution reverted".to_string()),
                    SubmissionStatus::Unknown => Some(format!(
                        "not included within {}s",
                        self.config.inclusion_timeout_secs
                    )),
                    _ => None,
                };
                SubmissionOutcome {
                    request_id: request.id,
                    status,
                    tx_hash: Some(landed.tx_hash),
                    nonce: Some(landed.nonce),
                    attempts,
                    quote,
                    receipt: landed.receipt,
                    simulation: None,
                    error,
                }
            }
            (Err(e), Some(unsettled)) => {
                warn!(
                    request_id = %request.id,
                    attempts,
                    tx_hash = ?unsettled.tx_hash,
                    nonce = unsettled.nonce,
                    error = %e,
                    "Broadcast never acknowledged, outcome unknown"
                );
                self.append(&SubmissionRecord::broadcast(
                    &request,
                    attempts,
                    unsettled.nonce,
                    quote,
                    unsettled.tx_hash,
                ))
                .await;
                SubmissionOutcome {
                    request_id: request.id,
                    status: SubmissionStatus::Unknown,
                    tx_hash: Some(unsettled.tx_hash),
                    nonce: Some(unsettled.nonce),
                    attempts,
                    quote,
                    receipt: None,
                    simulation: None,
                    error: Some(e.to_string()),
                }
            }
            (Err(e), None) => {
                if e.should_alert() {
                    error!(request_id = %request.id, attempts, error = %e, "Submission failed");
                } else {
                    warn!(request_id = %request.id, attempts, error = %e, "Submission failed");
                }
                self.append(&SubmissionRecord::rejected(&request, attempts, e.to_string()))
                    .await;
                SubmissionOutcome {
                    request_id: request.id,
                    status: SubmissionStatus::Failed,
                    tx_hash: None,
                    nonce: None,
                    attempts,
                    quote,
                    receipt: None,
                    simulation: None,
                    error: Some(e.to_string()),
                }
            }
        };

        crate::metrics::record_submission(chain_id, outcome.status.as_str());
        crate::metrics::record_submission_latency(chain_id, started.elapsed().as_secs_f64());
        info!(
            request_id = %request.id,
            status = outcome.status.as_str(),
            tx_hash = ?outcome.tx_hash,
            nonce = ?outcome.nonce,
            attempts,
            "Submission finished"
        );
        Ok(outcome)
    }

    /// One pass of reserve, build, sign and broadcast. A transaction left
    /// unsettled by the previous pass is sent again byte for byte instead of
    /// taking a new nonce. Errors returned from here never follow a
    /// broadcast the ledger is known to hold.
    async fn attempt_once(
        &self,
        request: &SubmissionRequest,
        cell: &Mutex<AttemptState>,
        attempt: u32,
    ) -> SubmitterResult<Landed> {
        let from = request.from;
        let chain_id = self.node.chain_id();
        let mut state = cell.lock().await;
        let quote = state.quote;

        let (nonce, signed, local_hash) = match state.unsettled.take() {
            Some(unsettled) => {
                debug!(
                    request_id = %request.id,
                    nonce = unsettled.nonce,
                    tx_hash = ?unsettled.tx_hash,
                    attempt,
                    "Resending unsettled transaction"
                );
                (unsettled.nonce, unsettled.signed, unsettled.tx_hash)
            }
            None => {
                let nonce = self
                    .sequences
                    .reserve(from, None)
                    .await
                    .map_err(|e| e.in_attempt(from, None, attempt))?;
                debug!(request_id = %request.id, state = ?SubmissionState::Reserved, nonce, attempt, "Reserved nonce");

                let tx = self.build_transaction(
                    from,
                    request.to,
                    request.value,
                    request.data.clone(),
                    nonce,
                    &quote,
                );
                let signed = match self.signer.sign(&tx, from).await {
                    Ok(signed) => signed,
                    Err(e) => {
                        self.sequences.fail(from, nonce).await;
                        return Err(e.in_attempt(from, Some(nonce), attempt));
                    }
                };
                let tx_hash = H256::from(keccak256(&signed));
                (nonce, signed, tx_hash)
            }
        };

        // Held before sending so a lost reply cannot free the nonce
        self.sequences.mark_broadcast(from, nonce, local_hash).await;

        let mut known_receipt = None;
        let tx_hash = match self.node.broadcast(signed.clone()).await {
            Ok(hash) => {
                if hash != local_hash {
                    debug!(local = ?local_hash, node = ?hash, "Node reported another transaction hash");
                    self.sequences.mark_broadcast(from, nonce, hash).await;
                }
                hash
            }
            Err(e) => {
                crate::metrics::record_submit_attempt(chain_id, "rejected");
                warn!(
                    request_id = %request.id,
                    nonce,
                    attempt,
                    class = ?e.class(),
                    error = %e,
                    "Broadcast failed"
                );

                if !e.may_have_landed() {
                    self.sequences.fail(from, nonce).await;
                    let e = self.recover(from, &mut state.quote, e).await;
                    return Err(e.in_attempt(from, Some(nonce), attempt));
                }

                match self.status(local_hash).await {
                    Ok(TxStatus::Pending) => {
                        info!(tx_hash = ?local_hash, nonce, "Ledger holds the transaction despite the error");
                        local_hash
                    }
                    Ok(TxStatus::Confirmed(receipt)) | Ok(TxStatus::Failed(receipt)) => {
                        info!(tx_hash = ?local_hash, nonce, "Ledger included the transaction despite the error");
                        known_receipt = Some(receipt);
                        local_hash
                    }
                    Ok(TxStatus::Unknown)
                        if matches!(e, SubmitterError::Rejected(LedgerRejection::NonceTooLow)) =>
                    {
                        // The nonce went to another transaction; ours can never land
                        self.sequences.fail(from, nonce).await;
                        let e = self.recover(from, &mut state.quote, e).await;
                        return Err(e.in_attempt(from, Some(nonce), attempt));
                    }
                    lookup => {
                        if let Err(lookup) = &lookup {
                            debug!(tx_hash = ?local_hash, error = %lookup, "Broadcast lookup failed");
                        }
                        state.unsettled = Some(Unsettled {
                            nonce,
                            signed,
                            tx_hash: local_hash,
                        });
                        return Err(e.in_attempt(from, Some(nonce), attempt));
                    }
                }
            }
        };
        drop(state);

        crate::metrics::record_submit_attempt(chain_id, "broadcast");
        info!(
            request_id = %request.id,
            state = ?SubmissionState::Broadcast,
            ?tx_hash,
            nonce,
            attempt,
            "Transaction sent"
        );

        let record = SubmissionRecord::broadcast(request, attempt, nonce, quote, tx_hash);
        self.append(&record).await;

        let receipt = match known_receipt {
            Some(receipt) => Some(receipt),
            None => self.await_inclusion(tx_hash).await,
        };
        match &receipt {
            Some(receipt) => {
                self.sequences.confirm(from, nonce).await;
                self.append(&record.included(receipt)).await;
                if !receipt.success {
                    warn!(?tx_hash, nonce, block = receipt.block_number, "Transaction reverted");
                }
            }
            None => {
                warn!(
                    ?tx_hash,
                    nonce,
                    timeout_secs = self.config.inclusion_timeout_secs,
                    "Inclusion not observed in time, outcome unknown"
                );
            }
        }

        Ok(Landed {
            tx_hash,
            nonce,
            receipt,
        })
    }

    /// Act on a rejected broadcast before the next attempt. Returns the error
    /// the retry loop should see.
    async fn recover(
        &self,
        from: Address,
        quote: &mut FeeQuote,
        error: SubmitterError,
    ) -> SubmitterError {
        if RetryEngine::should_repair_sequence(&error) {
            match self.sequences.repair(from).await {
                Ok(report) => info!(
                    address = ?from,
                    previous = report.previous,
                    current = report.current,
                    "Sequence repaired after conflict"
                ),
                Err(e) => warn!(address = ?from, error = %e, "Sequence repair failed"),
            }
        } else if RetryEngine::should_raise_fee(&error) {
            match self.fees.replacement_price(&quote.gas_price) {
                Ok(price) => {
                    debug!(from = ?quote.gas_price, to = ?price, "Raising fee after underpriced rejection");
                    *quote = quote.with_price(price);
                    crate::metrics::record_fee_replacement(self.node.chain_id(), "underpriced");
                }
                // Out of headroom: surface the bound so the loop stops
                Err(bound) => return bound,
            }
        }
        error
    }

    /// Poll for a receipt until the inclusion timeout
    async fn await_inclusion(&self, tx_hash: H256) -> Option<Receipt> {
        let poll = async {
            loop {
                match self.node.receipt(tx_hash).await {
                    Ok(Some(receipt)) => return receipt,
                    Ok(None) => {}
                    Err(e) => debug!(?tx_hash, error = %e, "Receipt lookup failed"),
                }
                sleep(self.config.receipt_poll_interval()).await;
            }
        };

        timeout(self.config.inclusion_timeout(), poll).await.ok()
    }

    /// Ledger-side status of a transaction
    pub async fn status(&self, tx_hash: H256) -> SubmitterResult<TxStatus> {
        if let Some(receipt) = self.read(|_| self.node.receipt(tx_hash)).await? {
            return Ok(if receipt.success {
                TxStatus::Confirmed(receipt)
            } else {
                TxStatus::Failed(receipt)
            });
        }

        match self.read(|_| self.node.transaction(tx_hash)).await? {
            Some(_) => Ok(TxStatus::Pending),
            None => Ok(TxStatus::Unknown),
        }
    }

    /// Supersede a pending transaction of `wallet` at the same nonce, either
    /// with a zero-value self transfer or with `replacement`
    pub async fn cancel_or_replace(
        &self,
        original: H256,
        wallet: Address,
        replacement: Option<SubmissionRequest>,
    ) -> SubmitterResult<ReplacementOutcome> {
        if !self.signer.owns(wallet) {
            return Err(SubmitterError::Validation(format!(
                "{:?} is not a managed account",
                wallet
            )));
        }

        let pending = self
            .read(|_| self.node.transaction(original))
            .await?
            .ok_or_else(|| SubmitterError::TransactionNotFound {
                tx_id: format!("{:?}", original),
            })?;

        if pending.from != wallet {
            return Err(SubmitterError::Validation(format!(
                "{:?} was sent by {:?}, not {:?}",
                original, pending.from, wallet
            )));
        }
        if self.read(|_| self.node.receipt(original)).await?.is_some() {
            return Err(SubmitterError::Validation(format!(
                "{:?} is already included",
                original
            )));
        }

        let gas_price = self.fees.replacement_price(&pending.gas_price)?;

        let (kind, request_id, to, value, data, gas_limit, description) = match replacement {
            None => (
                ReplacementKind::Cancel,
                Uuid::new_v4(),
                wallet,
                U256::zero(),
                Bytes::default(),
                U256::from(self.config.cancel_gas_limit),
                format!("cancel {:?}", original),
            ),
            Some(request) => {
                if request.from != wallet {
                    return Err(SubmitterError::Validation(
                        "replacement must come from the original sender".to_string(),
                    ));
                }
                let fresh = self.fees.estimate_fresh(&request, request.speed).await?;
                (
                    ReplacementKind::Replace,
                    request.id,
                    request.to,
                    request.value,
                    request.data,
                    fresh.gas_limit,
                    request.description,
                )
            }
        };

        let nonce = pending.nonce;
        let quote = FeeQuote::new(gas_limit, gas_price);
        let tx = self.build_transaction(wallet, to, value, data, nonce, &quote);
        let signed = self
            .signer
            .sign(&tx, wallet)
            .await
            .map_err(|e| e.in_attempt(wallet, Some(nonce), 1))?;
        let tx_hash = self
            .node
            .broadcast(signed)
            .await
            .map_err(|e| e.in_attempt(wallet, Some(nonce), 1))?;
        self.sequences.mark_broadcast(wallet, nonce, tx_hash).await;

        let reason = match kind {
            ReplacementKind::Cancel => "cancel",
            ReplacementKind::Replace => "replace",
        };
        crate::metrics::record_fee_replacement(self.node.chain_id(), reason);
        info!(?original, ?tx_hash, nonce, ?kind, "Sent replacement transaction");

        self.append(&SubmissionRecord::replacement(
            request_id,
            wallet,
            nonce,
            quote,
            tx_hash,
            original,
            description,
        ))
        .await;

        Ok(ReplacementOutcome {
            kind,
            original,
            tx_hash,
            nonce,
            gas_price,
        })
    }

    /// Resolve every logged broadcast that still lacks a terminal record
    pub async fn reconcile(&self) -> SubmitterResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for record in self.log.unresolved().await? {
            let Some(tx_hash) = record.tx_hash else {
                continue;
            };
            report.checked += 1;

            let status = match self.status(tx_hash).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(?tx_hash, error = %e, "Could not reconcile transaction");
                    report.pending += 1;
                    continue;
                }
            };

            match status {
                TxStatus::Confirmed(receipt) | TxStatus::Failed(receipt) => {
                    if let Some(nonce) = record.nonce {
                        self.sequences.confirm(record.sender, nonce).await;
                    }
                    if receipt.success {
                        report.confirmed += 1;
                    } else {
                        report.failed += 1;
                    }
                    self.append(&record.included(&receipt)).await;
                }
                TxStatus::Pending => {
                    if let Some(nonce) = record.nonce {
                        // Tracking does not survive a restart; restore it
                        self.sequences
                            .mark_broadcast(record.sender, nonce, tx_hash)
                            .await;
                    }
                    report.pending += 1;
                }
                TxStatus::Unknown => {
                    let Some(nonce) = record.nonce else {
                        report.pending += 1;
                        continue;
                    };
                    match self.settle_unknown(&record, tx_hash, nonce).await {
                        Ok(Settled::Superseded) => report.replaced += 1,
                        Ok(Settled::Dropped) => report.dropped += 1,
                        Ok(Settled::Waiting) => report.pending += 1,
                        Err(e) => {
                            warn!(?tx_hash, error = %e, "Could not read sequence");
                            report.pending += 1;
                        }
                    }
                }
            }
        }

        for account in self.signer.accounts() {
            match self.fill_gaps(account).await {
                Ok(sent) => report.filled += sent.len(),
                Err(e) => warn!(?account, error = %e, "Could not fill nonce gaps"),
            }
        }

        if report.checked > 0 || report.filled > 0 {
            info!(
                checked = report.checked,
                confirmed = report.confirmed,
                failed = report.failed,
                replaced = report.replaced,
                dropped = report.dropped,
                pending = report.pending,
                filled = report.filled,
                "Reconciliation pass complete"
            );
        }
        Ok(report)
    }

    /// Decide what a logged broadcast the ledger does not know has become
    async fn settle_unknown(
        &self,
        record: &SubmissionRecord,
        tx_hash: H256,
        nonce: u64,
    ) -> SubmitterResult<Settled> {
        let sender = record.sender;
        let confirmed = self.read(|_| self.node.confirmed_sequence(sender)).await?;
        if confirmed > nonce {
            info!(?tx_hash, nonce, "Transaction superseded at its nonce");
            self.sequences.confirm(sender, nonce).await;
            self.append(&record.superseded()).await;
            return Ok(Settled::Superseded);
        }

        let age = match self.sequences.broadcast_at(sender, nonce).await {
            Some((tracked, _)) if tracked != tx_hash => {
                info!(?tx_hash, replacement = ?tracked, nonce, "Transaction replaced while pending");
                self.append(&record.superseded()).await;
                return Ok(Settled::Superseded);
            }
            Some((_, age)) => age,
            None => (Utc::now() - record.recorded_at).to_std().unwrap_or_default(),
        };
        if age < self.config.inclusion_timeout() {
            return Ok(Settled::Waiting);
        }

        warn!(?tx_hash, nonce, "Broadcast transaction dropped before inclusion");
        self.sequences.fail(sender, nonce).await;
        self.append(&record.dropped("dropped by the ledger before inclusion".to_string()))
            .await;
        Ok(Settled::Dropped)
    }

    /// Send zero-value self transfers into the nonce gaps that hold back
    /// later transactions of `account`. Gaps at the top are rewound by the
    /// repair instead.
    pub async fn fill_gaps(&self, account: Address) -> SubmitterResult<Vec<H256>> {
        if self.sequences.gaps(account).await.is_empty() {
            return Ok(Vec::new());
        }
        self.sequences.repair(account).await?;

        let nonces = self.sequences.reserve_gaps(account, None).await;
        if nonces.is_empty() {
            return Ok(Vec::new());
        }

        let gas_price = match self.fees.tier_price(SpeedTier::Standard).await {
            Ok(price) => price,
            Err(e) => {
                for nonce in &nonces {
                    self.sequences.fail(account, *nonce).await;
                }
                return Err(e);
            }
        };
        let quote = FeeQuote::new(U256::from(self.config.cancel_gas_limit), gas_price);

        let mut sent = Vec::new();
        for nonce in nonces {
            match self.send_filler(account, nonce, quote).await {
                Ok(tx_hash) => sent.push(tx_hash),
                Err(e) => {
                    warn!(?account, nonce, error = %e, "Gap filler not sent");
                    self.sequences.fail(account, nonce).await;
                }
            }
        }
        if !sent.is_empty() {
            info!(?account, filled = sent.len(), "Filled nonce gaps");
        }
        Ok(sent)
    }

    async fn send_filler(
        &self,
        account: Address,
        nonce: u64,
        quote: FeeQuote,
    ) -> SubmitterResult<H256> {
        let tx = self.build_transaction(
            account,
            account,
            U256::zero(),
            Bytes::default(),
            nonce,
            &quote,
        );
        let signed = self.signer.sign(&tx, account).await?;
        let tx_hash = self.node.broadcast(signed).await?;
        self.sequences.mark_broadcast(account, nonce, tx_hash).await;
        self.append(&SubmissionRecord::gap_filler(account, nonce, quote, tx_hash))
            .await;
        Ok(tx_hash)
    }

    fn validate(&self, request: &SubmissionRequest) -> SubmitterResult<()> {
        if !self.signer.owns(request.from) {
            return Err(SubmitterError::Validation(format!(
                "{:?} is not a managed account",
                request.from
            )));
        }

        let fees = &request.fees;
        if fees.gas_limit == Some(U256::zero()) {
            return Err(SubmitterError::Validation(
                "gas limit override must be positive".to_string(),
            ));
        }
        if fees.gas_price.is_some()
            && (fees.max_fee_per_gas.is_some() || fees.max_priority_fee_per_gas.is_some())
        {
            return Err(SubmitterError::Validation(
                "legacy and EIP-1559 fee overrides are mutually exclusive".to_string(),
            ));
        }
        match (fees.max_fee_per_gas, fees.max_priority_fee_per_gas) {
            (Some(max_fee), Some(priority)) if priority > max_fee => {
                Err(SubmitterError::Validation(
                    "priority fee exceeds max fee per gas".to_string(),
                ))
            }
            (Some(_), None) | (None, Some(_)) => Err(SubmitterError::Validation(
                "max fee and priority fee must be given together".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Build a transaction in the shape the quote's price asks for
    fn build_transaction(
        &self,
        from: Address,
        to: Address,
        value: U256,
        data: Bytes,
        nonce: u64,
        quote: &FeeQuote,
    ) -> TypedTransaction {
        let chain_id = self.node.chain_id();

        match quote.gas_price {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .from(from)
                .to(to)
                .value(value)
                .data(data)
                .nonce(nonce)
                .gas(quote.gas_limit)
                .gas_price(price)
                .chain_id(chain_id)
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(from)
                .to(to)
                .value(value)
                .data(data)
                .nonce(nonce)
                .gas(quote.gas_limit)
                .max_fee_per_gas(max_fee_per_gas)
                .max_priority_fee_per_gas(max_priority_fee_per_gas)
                .chain_id(chain_id)
                .into(),
        }
    }

    /// Ledger read under the RPC-query retry profile
    async fn read<T, F, Fut>(&self, operation: F) -> SubmitterResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SubmitterResult<T>>,
    {
        self.retry
            .execute(&self.rpc_policy, operation)
            .await
            .into_result()
    }

    /// Log append after a broadcast; a write failure must not trigger a resend
    async fn append(&self, record: &SubmissionRecord) {
        if let Err(e) = self.log.append(record).await {
            error!(
                request_id = %record.request_id,
                tx_hash = ?record.tx_hash,
                error = %e,
                "Failed to append submission record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeeConfig, SequenceConfig};
    use crate::error::LedgerRejection;
    use crate::state::MemoryLog;
    use crate::testing::{FakeLedger, FakeSigner};
    use crate::tx::{FeeOverrides, RecordStatus};
    use std::time::Duration;

    const GWEI: u64 = 1_000_000_000;

    fn sender() -> Address {
        Address::repeat_byte(0x11)
    }

    fn target() -> Address {
        Address::repeat_byte(0x22)
    }

    struct Harness {
        ledger: Arc<FakeLedger>,
        log: Arc<MemoryLog>,
        pipeline: SubmissionPipeline,
    }

    fn harness() -> Harness {
        harness_with(GasPrice::Legacy(U256::from(10 * GWEI)))
    }

    fn eip1559_market() -> GasPrice {
        GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(30 * GWEI),
            max_priority_fee_per_gas: U256::from(2 * GWEI),
        }
    }

    fn harness_with(market: GasPrice) -> Harness {
        let ledger = Arc::new(FakeLedger::new(market));
        let node: Arc<dyn LedgerNode> = ledger.clone();
        let log = Arc::new(MemoryLog::new());
        let sequences = Arc::new(SequenceManager::new(
            node.clone(),
            SequenceConfig::default(),
            RetryPolicy::rpc_query(),
        ));
        let fees = Arc::new(FeeEstimator::new(
            node.clone(),
            FeeConfig::default(),
            RetryPolicy::rpc_query(),
        ));
        let config = PipelineConfig {
            inclusion_timeout_secs: 30,
            receipt_poll_interval_ms: 500,
            ..PipelineConfig::default()
        };
        let pipeline = SubmissionPipeline::new(
            node,
            Arc::new(FakeSigner::new(&[sender()])),
            log.clone(),
            sequences,
            fees,
            config,
        );
        Harness {
            ledger,
            log,
            pipeline,
        }
    }

    fn connection_error(message: &str) -> SubmitterError {
        SubmitterError::Rpc {
            operation: "broadcast".to_string(),
            message: message.to_string(),
        }
    }

    fn request() -> SubmissionRequest {
        SubmissionRequest::new(sender(), target())
            .with_data(vec![0xde, 0xad])
            .with_description("test transfer")
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_confirms_and_records() {
        let h = harness();
        h.ledger.set_sequence(sender(), 5);

        let request = request();
        let outcome = h.pipeline.submit(request.clone()).await.unwrap();

        assert_eq!(outcome.status, SubmissionStatus::Confirmed);
        assert_eq!(outcome.nonce, Some(5));
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.receipt.is_some());

        let history = h.log.get(request.id).await.unwrap();
        let statuses: Vec<_> = history.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![RecordStatus::Broadcast, RecordStatus::Confirmed]);
        assert!(history[1].block_number.is_some());
        assert!(history[1].cost.is_some());

        assert_eq!(h.pipeline.sequences().next(sender()).await.unwrap(), 6);
        assert!(h.pipeline.sequences().outstanding(sender()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_reply_is_recovered_from_the_ledger() {
        let h = harness();
        h.ledger.lose_replies([connection_error("operation timed out")]);

        let request = request();
        let outcome = h.pipeline.submit(request.clone()).await.unwrap();

        assert_eq!(outcome.status, SubmissionStatus::Confirmed);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.nonce, Some(0));

        let sent = h.ledger.broadcasts();
        assert_eq!(sent.len(), 1);
        assert_eq!(outcome.tx_hash, Some(sent[0].hash));

        let history = h.log.get(request.id).await.unwrap();
        let statuses: Vec<_> = history.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![RecordStatus::Broadcast, RecordStatus::Confirmed]);
        assert_eq!(h.pipeline.sequences().next(sender()).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_broadcast_is_resent_at_the_same_nonce() {
        let h = harness();
        h.ledger
            .fail_broadcasts((0..2).map(|_| connection_error("connection reset")));

        let outcome = h.pipeline.submit(request()).await.unwrap();
        assert_eq!(outcome.status, SubmissionStatus::Confirmed);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.nonce, Some(0));

        let sent = h.ledger.broadcasts();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].nonce, 0);
        assert_eq!(h.pipeline.sequences().next(sender()).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_broadcast_holds_nonce_until_dropped() {
        let h = harness();
        h.ledger
            .fail_broadcasts((0..3).map(|_| connection_error("connection reset")));

        let request = request();
        let outcome = h.pipeline.submit(request.clone()).await.unwrap();

        assert_eq!(outcome.status, SubmissionStatus::Unknown);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.nonce, Some(0));
        assert!(outcome.error.unwrap().contains("connection reset"));
        assert!(h.ledger.broadcasts().is_empty());

        // The nonce stays taken while the send is unresolved
        let sequences = h.pipeline.sequences();
        assert_eq!(sequences.in_flight(sender()).await, vec![0]);
        assert_eq!(sequences.next(sender()).await.unwrap(), 1);

        let history = h.log.get(request.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RecordStatus::Broadcast);
        assert_eq!(history[0].attempt, 3);
        assert_eq!(history[0].tx_hash, outcome.tx_hash);

        let report = h.pipeline.reconcile().await.unwrap();
        assert_eq!(report.pending, 1);
        assert_eq!(report.dropped, 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        let report = h.pipeline.reconcile().await.unwrap();
        assert_eq!(report.dropped, 1);

        let history = h.log.get(request.id).await.unwrap();
        assert_eq!(history.last().unwrap().status, RecordStatus::Failed);
        assert!(sequences.in_flight(sender()).await.is_empty());
        assert_eq!(sequences.next(sender()).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonce_too_low_repairs_and_succeeds() {
        let h = harness();
        assert_eq!(h.pipeline.sequences().next(sender()).await.unwrap(), 0);

        // Another process moved the account forward
        h.ledger.set_sequence(sender(), 3);

        let outcome = h.pipeline.submit(request()).await.unwrap();
        assert_eq!(outcome.status, SubmissionStatus::Confirmed);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.nonce, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_underpriced_raises_fee_for_next_attempt() {
        let h = harness();
        h.ledger
            .fail_broadcasts([SubmitterError::Rejected(LedgerRejection::Underpriced)]);

        let initial = h
            .pipeline
            .fees()
            .estimate(&request(), request().speed)
            .await
            .unwrap();
        let bumped = h.pipeline.fees().replacement_price(&initial.gas_price).unwrap();

        let outcome = h.pipeline.submit(request()).await.unwrap();
        assert_eq!(outcome.status, SubmissionStatus::Confirmed);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.quote.gas_price, bumped);

        let sent = h.ledger.broadcasts();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].gas_price, bumped);
        assert_eq!(sent[0].nonce, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_rejection_is_not_retried() {
        let h = harness();
        h.ledger
            .fail_broadcasts([SubmitterError::Rejected(LedgerRejection::InsufficientFunds)]);

        let outcome = h.pipeline.submit(request()).await.unwrap();
        assert_eq!(outcome.status, SubmissionStatus::Failed);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(h.pipeline.sequences().next(sender()).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverted_receipt_is_terminal_and_consumes_nonce() {
        let h = harness();
        h.ledger.revert_all();

        let request = request();
        let outcome = h.pipeline.submit(request.clone()).await.unwrap();

        assert_eq!(outcome.status, SubmissionStatus::Failed);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.nonce, Some(0));
        assert!(!outcome.receipt.unwrap().success);
        assert_eq!(h.ledger.broadcasts().len(), 1);

        let history = h.log.get(request.id).await.unwrap();
        assert_eq!(history.last().unwrap().status, RecordStatus::Failed);
        assert_eq!(h.pipeline.sequences().next(sender()).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inclusion_timeout_is_unknown_then_reconciled() {
        let h = harness();
        h.ledger.hold_in_mempool();

        let request = request();
        let outcome = h.pipeline.submit(request.clone()).await.unwrap();
        assert_eq!(outcome.status, SubmissionStatus::Unknown);
        let tx_hash = outcome.tx_hash.unwrap();

        // Reservation is left to expire rather than released
        assert_eq!(h.pipeline.sequences().outstanding(sender()).await, vec![0]);
        assert_eq!(h.pipeline.status(tx_hash).await.unwrap(), TxStatus::Pending);

        let report = h.pipeline.reconcile().await.unwrap();
        assert_eq!(report.pending, 1);

        h.ledger.mine_pending();
        let report = h.pipeline.reconcile().await.unwrap();
        assert_eq!(report.confirmed, 1);

        assert!(matches!(
            h.pipeline.status(tx_hash).await.unwrap(),
            TxStatus::Confirmed(_)
        ));
        let history = h.log.get(request.id).await.unwrap();
        assert_eq!(history.last().unwrap().status, RecordStatus::Confirmed);
        assert!(h.log.unresolved().await.unwrap().is_empty());
        assert!(h.pipeline.sequences().outstanding(sender()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulate_does_not_touch_sequences() {
        let h = harness();

        let outcome = h.pipeline.submit(request().simulate()).await.unwrap();
        assert_eq!(outcome.status, SubmissionStatus::Simulated);
        assert!(outcome.simulation.is_some());
        assert_eq!(outcome.nonce, None);
        assert_eq!(h.pipeline.sequences().tracked_accounts(), 0);
        assert!(h.ledger.broadcasts().is_empty());
        assert_eq!(h.log.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_invalid_requests() {
        let h = harness();

        let stranger = SubmissionRequest::new(Address::repeat_byte(0x99), target());
        let err = h.pipeline.submit(stranger).await.unwrap_err();
        assert!(matches!(err, SubmitterError::Validation(_)));

        let inverted = request().with_fees(FeeOverrides {
            max_fee_per_gas: Some(U256::from(GWEI)),
            max_priority_fee_per_gas: Some(U256::from(2 * GWEI)),
            ..FeeOverrides::default()
        });
        let err = h.pipeline.submit(inverted).await.unwrap_err();
        assert!(matches!(err, SubmitterError::Validation(_)));

        let too_expensive = request().with_fees(FeeOverrides {
            gas_price: Some(U256::from(600 * GWEI)),
            ..FeeOverrides::default()
        });
        let err = h.pipeline.submit(too_expensive).await.unwrap_err();
        assert!(matches!(err, SubmitterError::FeeBoundExceeded { .. }));

        assert!(h.ledger.broadcasts().is_empty());
        assert_eq!(h.pipeline.sequences().tracked_accounts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_submissions_get_distinct_nonces() {
        let h = Arc::new(harness());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let h = h.clone();
                tokio::spawn(async move { h.pipeline.submit(request()).await.unwrap() })
            })
            .collect();

        let mut nonces = Vec::new();
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert_eq!(outcome.status, SubmissionStatus::Confirmed);
            nonces.push(outcome.nonce.unwrap());
        }
        nonces.sort_unstable();
        assert_eq!(nonces, (0..8).collect::<Vec<u64>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_reuses_nonce_with_bumped_zero_value_self_transfer() {
        let h = harness();
        h.ledger.hold_in_mempool();

        let outcome = h.pipeline.submit(request()).await.unwrap();
        assert_eq!(outcome.status, SubmissionStatus::Unknown);
        let original = outcome.tx_hash.unwrap();
        let expected_price = h
            .pipeline
            .fees()
            .replacement_price(&outcome.quote.gas_price)
            .unwrap();

        let cancel = h
            .pipeline
            .cancel_or_replace(original, sender(), None)
            .await
            .unwrap();
        assert_eq!(cancel.kind, ReplacementKind::Cancel);
        assert_eq!(cancel.nonce, outcome.nonce.unwrap());
        assert_eq!(cancel.gas_price, expected_price);

        let sent = h.ledger.broadcasts();
        let last = sent.last().unwrap();
        assert_eq!(last.to, Some(sender()));
        assert_eq!(last.value, U256::zero());
        assert_eq!(last.nonce, cancel.nonce);

        // The original left the mempool
        assert_eq!(h.pipeline.status(original).await.unwrap(), TxStatus::Unknown);

        h.ledger.mine_pending();
        let report = h.pipeline.reconcile().await.unwrap();
        assert_eq!(report.replaced, 1);
        assert_eq!(report.confirmed, 1);
        assert_eq!(h.log.stats().await.unwrap().replaced, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_sends_new_payload_at_same_nonce() {
        let h = harness();
        h.ledger.hold_in_mempool();

        let outcome = h.pipeline.submit(request()).await.unwrap();
        let original = outcome.tx_hash.unwrap();

        let replacement = SubmissionRequest::new(sender(), Address::repeat_byte(0x33))
            .with_value(U256::from(7));
        let replaced = h
            .pipeline
            .cancel_or_replace(original, sender(), Some(replacement.clone()))
            .await
            .unwrap();
        assert_eq!(replaced.kind, ReplacementKind::Replace);
        assert_eq!(replaced.nonce, outcome.nonce.unwrap());

        let last = h.ledger.broadcasts().last().cloned().unwrap();
        assert_eq!(last.to, Some(Address::repeat_byte(0x33)));
        assert_eq!(last.value, U256::from(7));

        let history = h.log.get(replacement.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].replaces, Some(original));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_rejects_included_or_foreign_transactions() {
        let h = harness();

        let outcome = h.pipeline.submit(request()).await.unwrap();
        let included = outcome.tx_hash.unwrap();

        let err = h
            .pipeline
            .cancel_or_replace(included, sender(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitterError::Validation(_)));

        let err = h
            .pipeline
            .cancel_or_replace(H256::repeat_byte(0xff), sender(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitterError::TransactionNotFound { .. }));

        let err = h
            .pipeline
            .cancel_or_replace(included, Address::repeat_byte(0x99), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitterError::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_broadcast_nonce_is_not_given_to_another_request() {
        let h = harness();
        h.ledger.hold_in_mempool();

        let first = h.pipeline.submit(request()).await.unwrap();
        assert_eq!(first.status, SubmissionStatus::Unknown);
        assert_eq!(first.nonce, Some(0));

        tokio::time::advance(Duration::from_secs(301)).await;
        let swept = h.pipeline.sequences().sweep_expired().await;
        assert_eq!(swept.expired, vec![(sender(), 0)]);

        let report = h.pipeline.sequences().repair(sender()).await.unwrap();
        assert_eq!(report.current, 0);
        assert!(report.released.is_empty());

        let other = SubmissionRequest::new(sender(), Address::repeat_byte(0x33));
        let second = h.pipeline.submit(other).await.unwrap();
        assert_eq!(second.nonce, Some(1));
        assert_eq!(second.attempts, 1);

        assert_eq!(
            h.pipeline.status(first.tx_hash.unwrap()).await.unwrap(),
            TxStatus::Pending
        );
        let sent: Vec<_> = h
            .ledger
            .broadcasts()
            .iter()
            .map(|tx| (tx.nonce, tx.to))
            .collect();
        assert_eq!(
            sent,
            vec![(0, Some(target())), (1, Some(Address::repeat_byte(0x33)))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_fills_gaps_that_block_later_transactions() {
        let h = harness();
        let sequences = h.pipeline.sequences();
        assert_eq!(sequences.reserve(sender(), None).await.unwrap(), 0);
        assert_eq!(sequences.reserve(sender(), None).await.unwrap(), 1);
        sequences.fail(sender(), 0).await;

        let request = request();
        let outcome = h.pipeline.submit(request.clone()).await.unwrap();
        assert_eq!(outcome.status, SubmissionStatus::Unknown);
        assert_eq!(outcome.nonce, Some(2));

        tokio::time::advance(Duration::from_secs(301)).await;
        sequences.sweep_expired().await;
        assert_eq!(sequences.gaps(sender()).await, vec![0, 1]);

        let report = h.pipeline.reconcile().await.unwrap();
        assert_eq!(report.pending, 1);
        assert_eq!(report.filled, 2);

        let fillers: Vec<_> = h
            .ledger
            .broadcasts()
            .into_iter()
            .filter(|tx| tx.to == Some(sender()) && tx.value.is_zero())
            .map(|tx| tx.nonce)
            .collect();
        assert_eq!(fillers, vec![0, 1]);

        let report = h.pipeline.reconcile().await.unwrap();
        assert_eq!(report.confirmed, 3);
        assert_eq!(h.ledger.confirmed_sequence(sender()).await.unwrap(), 3);
        assert!(sequences.gaps(sender()).await.is_empty());
        assert!(sequences.in_flight(sender()).await.is_empty());

        let history = h.log.get(request.id).await.unwrap();
        assert_eq!(history.last().unwrap().status, RecordStatus::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eip1559_market_sends_dynamic_fee_transactions() {
        let h = harness_with(eip1559_market());
        let standard = h
            .pipeline
            .fees()
            .estimate(&request(), SpeedTier::Standard)
            .await
            .unwrap();

        let outcome = h
            .pipeline
            .submit(request().with_speed(SpeedTier::Fast))
            .await
            .unwrap();
        assert_eq!(outcome.status, SubmissionStatus::Confirmed);

        let sent = h.ledger.broadcasts();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].gas_price,
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(30 * GWEI) * 125 / 100,
                max_priority_fee_per_gas: U256::from(2 * GWEI) * 125 / 100,
            }
        );
        assert_eq!(outcome.quote.gas_price, sent[0].gas_price);
        assert!(sent[0].gas_price.ceiling() > standard.gas_price.ceiling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eip1559_cancel_raises_max_fee_and_tip() {
        let h = harness_with(eip1559_market());
        h.ledger.hold_in_mempool();

        let outcome = h.pipeline.submit(request()).await.unwrap();
        let original = outcome.tx_hash.unwrap();
        let original_price = h.ledger.broadcasts()[0].gas_price;

        let cancel = h
            .pipeline
            .cancel_or_replace(original, sender(), None)
            .await
            .unwrap();
        let sent = h.ledger.broadcasts().last().cloned().unwrap();
        assert_eq!(sent.gas_price, cancel.gas_price);

        match (original_price, sent.gas_price) {
            (
                GasPrice::Eip1559 {
                    max_fee_per_gas: old_max,
                    max_priority_fee_per_gas: old_tip,
                },
                GasPrice::Eip1559 {
                    max_fee_per_gas: new_max,
                    max_priority_fee_per_gas: new_tip,
                },
            ) => {
                assert!(new_max >= old_max * 110 / 100);
                assert!(new_tip >= old_tip * 110 / 100);
            }
            other => panic!("expected dynamic fee prices, got {:?}", other),
        }
        assert_eq!(h.pipeline.status(original).await.unwrap(), TxStatus::Unknown);
    }
}
