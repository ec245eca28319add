//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking per account to avoid conflicts
//! - Reservations with expiry, released by a periodic sweep
//! - Broadcast tracking so a sent nonce is never handed to another request
//! - Nonce gap detection and repair from the ledger
//!
//! Each account's state sits behind its own mutex. The mutex only guards
//! bookkeeping; ledger round-trips happen with it released.

use crate::chain::LedgerNode;
use crate::config::SequenceConfig;
use crate::error::SubmitterResult;
use crate::retry::{RetryEngine, RetryPolicy};

use dashmap::DashMap;
use ethers::types::{Address, H256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-account nonce state
#[derive(Debug)]
struct AccountSequenceState {
    /// Next nonce the ledger expects (everything below is confirmed)
    confirmed: u64,
    /// One past the highest nonce handed out
    next: u64,
    /// Outstanding reservations: nonce -> expiry
    reserved: BTreeMap<u64, Instant>,
    /// Nonces handed to the ledger and not yet resolved: nonce -> (hash, sent at)
    broadcast: BTreeMap<u64, (H256, Instant)>,
    last_synced_at: Option<Instant>,
    last_activity: Instant,
}

impl AccountSequenceState {
    fn new(now: Instant) -> Self {
        Self {
            confirmed: 0,
            next: 0,
            reserved: BTreeMap::new(),
            broadcast: BTreeMap::new(),
            last_synced_at: None,
            last_activity: now,
        }
    }

    fn is_fresh(&self, now: Instant, freshness: Duration) -> bool {
        self.last_synced_at
            .map(|synced| now.duration_since(synced) < freshness)
            .unwrap_or(false)
    }

    fn allocation_point(&self) -> u64 {
        self.next.max(self.confirmed)
    }

    /// Drop reservations and broadcasts below `confirmed`, returning the
    /// dropped reservations
    fn drop_below_confirmed(&mut self) -> Vec<u64> {
        let keep = self.broadcast.split_off(&self.confirmed);
        self.broadcast = keep;

        let keep = self.reserved.split_off(&self.confirmed);
        let dropped = std::mem::replace(&mut self.reserved, keep);
        dropped.into_keys().collect()
    }

    fn holds(&self, nonce: u64) -> bool {
        self.reserved.contains_key(&nonce) || self.broadcast.contains_key(&nonce)
    }

    fn gaps(&self) -> Vec<u64> {
        (self.confirmed..self.next)
            .filter(|nonce| !self.holds(*nonce))
            .collect()
    }

    fn is_idle(&self, now: Instant, idle_gc: Duration) -> bool {
        self.reserved.is_empty()
            && self.broadcast.is_empty()
            && now.duration_since(self.last_activity) >= idle_gc
    }
}

/// Result of a repair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairReport {
    /// Whether local state changed
    pub repaired: bool,
    /// Reservations dropped because the ledger is already past them
    pub cleaned: Vec<u64>,
    /// Broadcast nonces freed because the ledger no longer knows their transaction
    pub released: Vec<u64>,
    pub previous: u64,
    pub current: u64,
}

/// Result of an expiry sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<(Address, u64)>,
    pub collected: usize,
}

/// Manages nonces across many accounts on one ledger
pub struct SequenceManager {
    /// Ledger node used for resync
    node: Arc<dyn LedgerNode>,
    /// Per-account nonce state
    accounts: DashMap<Address, Arc<Mutex<AccountSequenceState>>>,
    config: SequenceConfig,
    rpc_policy: RetryPolicy,
    retry: RetryEngine,
}

impl SequenceManager {
    /// Create a new sequence manager
    pub fn new(node: Arc<dyn LedgerNode>, config: SequenceConfig, rpc_policy: RetryPolicy) -> Self {
        Self {
            node,
            accounts: DashMap::new(),
            config,
            rpc_policy,
            retry: RetryEngine::new(),
        }
    }

    /// Next nonce `reserve` would hand out for `address`
    pub async fn next(&self, address: Address) -> SubmitterResult<u64> {
        let account = self.account(address);
        self.ensure_fresh(address, &account).await?;

        let state = account.lock().await;
        Ok(state.allocation_point())
    }

    /// Claim the next nonce for `address` until confirmed, failed or expired
    pub async fn reserve(&self, address: Address, ttl: Option<Duration>) -> SubmitterResult<u64> {
        let account = self.account(address);
        self.ensure_fresh(address, &account).await?;

        let now = Instant::now();
        let ttl = ttl.unwrap_or_else(|| self.config.reservation_ttl());

        let mut state = account.lock().await;
        let nonce = state.allocation_point();
        state.reserved.insert(nonce, now + ttl);
        state.next = nonce + 1;
        state.last_activity = now;
        drop(state);

        crate::metrics::record_reservation(self.node.chain_id(), "reserved");
        debug!(?address, nonce, ttl_secs = ttl.as_secs(), "Reserved nonce");
        Ok(nonce)
    }

    /// Release a reservation after inclusion. Returns false if it was not held.
    pub async fn confirm(&self, address: Address, nonce: u64) -> bool {
        let Some(account) = self.existing(address) else {
            return false;
        };

        let mut state = account.lock().await;
        let released = state.reserved.remove(&nonce).is_some();
        state.broadcast.remove(&nonce);

        if nonce >= state.confirmed {
            state.confirmed = nonce + 1;
            let superseded = state.drop_below_confirmed();
            if !superseded.is_empty() {
                debug!(?address, ?superseded, "Reservations superseded by confirmation");
            }
        }
        state.next = state.next.max(state.confirmed);
        state.last_activity = Instant::now();
        drop(state);

        if released {
            crate::metrics::record_reservation(self.node.chain_id(), "confirmed");
            debug!(?address, nonce, "Confirmed nonce");
        }
        released
    }

    /// Release a nonce whose transaction never reached the ledger.
    /// The top slot is handed back so the next reservation reuses it.
    pub async fn fail(&self, address: Address, nonce: u64) -> bool {
        let Some(account) = self.existing(address) else {
            return false;
        };

        let mut state = account.lock().await;
        let reserved = state.reserved.remove(&nonce).is_some();
        let sent = state.broadcast.remove(&nonce).is_some();
        let released = reserved || sent;
        if released && nonce + 1 == state.next && nonce >= state.confirmed {
            state.next = nonce;
        }
        state.last_activity = Instant::now();
        drop(state);

        if released {
            crate::metrics::record_reservation(self.node.chain_id(), "failed");
            debug!(?address, nonce, "Released failed nonce");
        }
        released
    }

    /// Record that `nonce` was handed to the ledger as `tx_hash`. The nonce
    /// stays taken until confirmed, failed, or found unknown by `repair`.
    pub async fn mark_broadcast(&self, address: Address, nonce: u64, tx_hash: H256) {
        let account = self.account(address);
        let now = Instant::now();

        let mut state = account.lock().await;
        if nonce < state.confirmed {
            return;
        }
        let unchanged = matches!(state.broadcast.get(&nonce), Some((hash, _)) if *hash == tx_hash);
        if !unchanged {
            state.broadcast.insert(nonce, (tx_hash, now));
        }
        state.next = state.next.max(nonce + 1);
        state.last_activity = now;
    }

    /// Hash and age of the broadcast tracked at `nonce`
    pub async fn broadcast_at(&self, address: Address, nonce: u64) -> Option<(H256, Duration)> {
        let account = self.existing(address)?;
        let state = account.lock().await;
        state
            .broadcast
            .get(&nonce)
            .map(|(hash, sent_at)| (*hash, Instant::now().duration_since(*sent_at)))
    }

    /// Resync `address` with the ledger's confirmed nonce
    pub async fn repair(&self, address: Address) -> SubmitterResult<RepairReport> {
        let on_chain = self.fetch_confirmed(address).await?;
        let account = self.account(address);

        let tracked: Vec<(u64, H256)> = account
            .lock()
            .await
            .broadcast
            .range(on_chain..)
            .map(|(nonce, (hash, _))| (*nonce, *hash))
            .collect();
        let vanished = self.vanished(address, tracked).await;

        let mut state = account.lock().await;
        let previous = state.confirmed;
        let previous_next = state.next;

        state.confirmed = on_chain;
        let cleaned = state.drop_below_confirmed();

        let mut released = Vec::new();
        for (nonce, tx_hash) in vanished {
            if matches!(state.broadcast.get(&nonce), Some((hash, _)) if *hash == tx_hash) {
                state.broadcast.remove(&nonce);
                released.push(nonce);
            }
        }

        // Never rewind onto a reserved nonce or one the ledger still holds
        let highest_held = state
            .reserved
            .keys()
            .next_back()
            .into_iter()
            .chain(state.broadcast.keys().next_back())
            .max()
            .map(|highest| highest + 1)
            .unwrap_or(on_chain);
        state.next = on_chain.max(highest_held);

        let now = Instant::now();
        state.last_synced_at = Some(now);
        state.last_activity = now;

        let repaired = previous != on_chain
            || previous_next != state.next
            || !cleaned.is_empty()
            || !released.is_empty();
        drop(state);

        if !released.is_empty() {
            warn!(?address, ?released, "Broadcast transactions vanished from the ledger");
        }

        if !cleaned.is_empty() {
            // Dropped without checking whether they were ever broadcast
            warn!(
                ?address,
                ?cleaned,
                on_chain,
                "Dropped reservations below on-chain nonce; unbroadcast ones leave silent gaps"
            );
        }
        if repaired {
            info!(?address, previous, current = on_chain, "Repaired nonce state");
        }
        crate::metrics::record_sequence_repair(self.node.chain_id());

        Ok(RepairReport {
            repaired,
            cleaned,
            released,
            previous,
            current: on_chain,
        })
    }

    /// Nonces between the confirmed nonce and the high-water mark that are
    /// neither confirmed, reserved nor broadcast
    pub async fn gaps(&self, address: Address) -> Vec<u64> {
        match self.existing(address) {
            Some(account) => account.lock().await.gaps(),
            None => Vec::new(),
        }
    }

    /// Reserve every current gap of `address` so it can be filled
    pub async fn reserve_gaps(&self, address: Address, ttl: Option<Duration>) -> Vec<u64> {
        let Some(account) = self.existing(address) else {
            return Vec::new();
        };
        let now = Instant::now();
        let ttl = ttl.unwrap_or_else(|| self.config.reservation_ttl());

        let mut state = account.lock().await;
        let gaps = state.gaps();
        for nonce in &gaps {
            state.reserved.insert(*nonce, now + ttl);
        }
        state.last_activity = now;
        drop(state);

        for nonce in &gaps {
            crate::metrics::record_reservation(self.node.chain_id(), "reserved");
            debug!(?address, nonce, "Reserved gap nonce");
        }
        gaps
    }

    /// Nonces handed to the ledger and still awaiting an outcome
    pub async fn in_flight(&self, address: Address) -> Vec<u64> {
        match self.existing(address) {
            Some(account) => account.lock().await.broadcast.keys().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Currently reserved nonces for `address`
    pub async fn outstanding(&self, address: Address) -> Vec<u64> {
        match self.existing(address) {
            Some(account) => account.lock().await.reserved.keys().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Force-release expired reservations and drop idle accounts
    pub async fn sweep_expired(&self) -> SweepReport {
        let now = Instant::now();
        let idle_gc = self.config.idle_gc();
        let mut report = SweepReport::default();
        let mut idle = Vec::new();

        let accounts: Vec<_> = self
            .accounts
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (address, account) in accounts {
            let mut state = account.lock().await;
            let expired: Vec<u64> = state
                .reserved
                .iter()
                .filter(|(_, expires_at)| **expires_at <= now)
                .map(|(nonce, _)| *nonce)
                .collect();

            for nonce in expired {
                state.reserved.remove(&nonce);
                warn!(?address, nonce, "Reservation expired without release");
                crate::metrics::record_reservation(self.node.chain_id(), "expired");
                report.expired.push((address, nonce));
            }

            if state.is_idle(now, idle_gc) {
                idle.push(address);
            }
        }

        for address in idle {
            let removed = self.accounts.remove_if(&address, |_, account| {
                Arc::strong_count(account) == 1
                    && account
                        .try_lock()
                        .map(|state| state.is_idle(now, idle_gc))
                        .unwrap_or(false)
            });
            if removed.is_some() {
                debug!(?address, "Dropped idle account state");
                report.collected += 1;
            }
        }

        report
    }

    /// Run `sweep_expired` every `interval` until the handle is aborted
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let report = manager.sweep_expired().await;
                if !report.expired.is_empty() || report.collected > 0 {
                    info!(
                        expired = report.expired.len(),
                        collected = report.collected,
                        "Reservation sweep"
                    );
                }
            }
        })
    }

    /// Number of accounts with in-memory state
    pub fn tracked_accounts(&self) -> usize {
        self.accounts.len()
    }

    fn account(&self, address: Address) -> Arc<Mutex<AccountSequenceState>> {
        self.accounts
            .entry(address)
            .or_insert_with(|| Arc::new(Mutex::new(AccountSequenceState::new(Instant::now()))))
            .clone()
    }

    fn existing(&self, address: Address) -> Option<Arc<Mutex<AccountSequenceState>>> {
        self.accounts.get(&address).map(|entry| entry.value().clone())
    }

    /// Resync from the ledger if the account is unknown or stale
    async fn ensure_fresh(
        &self,
        address: Address,
        account: &Mutex<AccountSequenceState>,
    ) -> SubmitterResult<()> {
        if account
            .lock()
            .await
            .is_fresh(Instant::now(), self.config.freshness())
        {
            return Ok(());
        }

        let on_chain = self.fetch_confirmed(address).await?;

        let mut state = account.lock().await;
        if on_chain > state.confirmed {
            state.confirmed = on_chain;
            let superseded = state.drop_below_confirmed();
            if !superseded.is_empty() {
                debug!(?address, ?superseded, "Ledger advanced past reservations");
            }
        } else if on_chain < state.confirmed {
            debug!(
                ?address,
                on_chain,
                local = state.confirmed,
                "Node behind local confirmations, keeping local value"
            );
        }
        state.next = state.next.max(state.confirmed);
        state.last_synced_at = Some(Instant::now());
        Ok(())
    }

    /// Tracked broadcasts the ledger reports as unknown. Lookup failures
    /// keep the nonce held.
    async fn vanished(&self, address: Address, tracked: Vec<(u64, H256)>) -> Vec<(u64, H256)> {
        let node = &self.node;
        let mut vanished = Vec::new();
        for (nonce, tx_hash) in tracked {
            let found = self
                .retry
                .execute(&self.rpc_policy, |_| node.transaction(tx_hash))
                .await
                .into_result();
            match found {
                Ok(None) => vanished.push((nonce, tx_hash)),
                Ok(Some(_)) => {}
                Err(e) => {
                    debug!(?address, nonce, error = %e, "Broadcast lookup failed, keeping nonce")
                }
            }
        }
        vanished
    }

    /// Fetch the confirmed nonce from the ledger
    async fn fetch_confirmed(&self, address: Address) -> SubmitterResult<u64> {
        let node = &self.node;
        self.retry
            .execute(&self.rpc_policy, |_| node.confirmed_sequence(address))
            .await
            .into_result()
    }
}
