//! Gas estimation: fee market reading, speed tiers, bounds and replacement bumps

use super::types::{FeeQuote, SpeedTier, SubmissionRequest};
use crate::chain::{GasPrice, LedgerNode};
use crate::config::FeeConfig;
use crate::error::{SubmitterError, SubmitterResult};
use crate::retry::{RetryEngine, RetryPolicy};

use dashmap::DashMap;
use ethers::types::{Address, U256};
use sha3::{Digest, Keccak256};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

const GWEI: u64 = 1_000_000_000;
const CACHE_PRUNE_THRESHOLD: usize = 1024;
/// Moves smaller than this (in percent) count as stable
const TREND_STABLE_BAND: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QuoteKey {
    to: Address,
    payload_hash: [u8; 32],
    value: U256,
    from: Address,
    speed: SpeedTier,
}

impl QuoteKey {
    fn new(request: &SubmissionRequest, speed: SpeedTier) -> Self {
        let mut payload_hash = [0u8; 32];
        payload_hash.copy_from_slice(&Keccak256::digest(&request.data));
        Self {
            to: request.to,
            payload_hash,
            value: request.value,
            from: request.from,
            speed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedQuote {
    quote: FeeQuote,
    cached_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendDirection {
    Rising,
    Falling,
    Stable,
}

/// Advisory fee trend over the recent price history
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceTrend {
    pub direction: TrendDirection,
    pub percent_change: f64,
    pub samples: usize,
}

/// Gas estimator for transactions
pub struct FeeEstimator {
    node: Arc<dyn LedgerNode>,
    config: FeeConfig,
    rpc_policy: RetryPolicy,
    retry: RetryEngine,
    cache: DashMap<QuoteKey, CachedQuote>,
    /// Observed price ceilings, oldest first
    history: RwLock<VecDeque<U256>>,
    last_known: RwLock<Option<GasPrice>>,
}

impl FeeEstimator {
    /// Create a new fee estimator
    pub fn new(node: Arc<dyn LedgerNode>, config: FeeConfig, rpc_policy: RetryPolicy) -> Self {
        Self {
            node,
            config,
            rpc_policy,
            retry: RetryEngine::new(),
            cache: DashMap::new(),
            history: RwLock::new(VecDeque::new()),
            last_known: RwLock::new(None),
        }
    }

    /// Highest per-gas price this estimator will ever bid
    pub fn max_price(&self) -> U256 {
        U256::from(self.config.max_gas_price_gwei) * U256::from(GWEI)
    }

    /// Latest fee market reading. Falls back to the last known price when
    /// the node is unavailable.
    pub async fn current_price(&self) -> SubmitterResult<GasPrice> {
        let node = &self.node;
        let result = self
            .retry
            .execute(&self.rpc_policy, |_| node.fee_market())
            .await
            .into_result();

        match result {
            Ok(price) => {
                *self.last_known.write().await = Some(price);
                self.record_sample(price.ceiling()).await;
                crate::metrics::record_gas_price(self.node.chain_id(), price.ceiling());
                debug!("Gas price for chain {}: {:?}", self.node.chain_id(), price);
                Ok(price)
            }
            Err(e) => match *self.last_known.read().await {
                Some(price) => {
                    warn!(
                        error = %e,
                        "Fee market unavailable, using last known price (degraded mode)"
                    );
                    crate::metrics::record_fee_degraded(self.node.chain_id());
                    Ok(price)
                }
                None => Err(e),
            },
        }
    }

    /// Quote a request at the given speed, reusing a recent identical quote
    pub async fn estimate(
        &self,
        request: &SubmissionRequest,
        speed: SpeedTier,
    ) -> SubmitterResult<FeeQuote> {
        if !request.fees.is_empty() {
            return self.estimate_fresh(request, speed).await;
        }

        let key = QuoteKey::new(request, speed);
        if let Some(cached) = self.cache.get(&key) {
            if cached.cached_at.elapsed() < self.config.cache_ttl() {
                debug!(request_id = %request.id, "Using cached fee quote");
                return Ok(cached.quote);
            }
        }

        let quote = self.estimate_fresh(request, speed).await?;
        self.store(key, quote);
        Ok(quote)
    }

    /// Quote a request without consulting the cache
    pub async fn estimate_fresh(
        &self,
        request: &SubmissionRequest,
        speed: SpeedTier,
    ) -> SubmitterResult<FeeQuote> {
        let gas_limit = match request.fees.gas_limit {
            Some(limit) => limit,
            None => self.estimate_gas_limit(request).await?,
        };

        let gas_price = match request.fees.explicit_price() {
            Some(explicit) => {
                self.check_bound(&explicit)?;
                explicit
            }
            None => self.tier_price(speed).await?,
        };

        Ok(FeeQuote::new(gas_limit, gas_price))
    }

    /// Market price with the tier premium applied, capped at the maximum
    pub async fn tier_price(&self, speed: SpeedTier) -> SubmitterResult<GasPrice> {
        let current = self.current_price().await?;
        let premium = self.config.premium_percent(speed);
        Ok(current.scale_percent(100 + premium).clamp(self.max_price()))
    }

    /// Minimum price that replaces a pending transaction bid at `original`
    pub fn replacement_price(&self, original: &GasPrice) -> SubmitterResult<GasPrice> {
        let bumped = original.scale_percent(100 + self.config.replacement_bump_percent);
        self.check_bound(&bumped)?;
        Ok(bumped)
    }

    /// Direction and size of the price move over the last `window` samples
    pub async fn trend(&self, window: usize) -> PriceTrend {
        let history = self.history.read().await;
        let window = window.min(history.len());
        let stable = PriceTrend {
            direction: TrendDirection::Stable,
            percent_change: 0.0,
            samples: window,
        };
        if window < 2 {
            return stable;
        }

        let first = history[history.len() - window].low_u128() as f64;
        let last = history[history.len() - 1].low_u128() as f64;
        if first == 0.0 {
            return stable;
        }

        let percent_change = (last - first) / first * 100.0;
        let direction = if percent_change > TREND_STABLE_BAND {
            TrendDirection::Rising
        } else if percent_change < -TREND_STABLE_BAND {
            TrendDirection::Falling
        } else {
            TrendDirection::Stable
        };

        PriceTrend {
            direction,
            percent_change,
            samples: window,
        }
    }

    async fn estimate_gas_limit(&self, request: &SubmissionRequest) -> SubmitterResult<U256> {
        let call = request.call();
        let node = &self.node;
        let estimated = self
            .retry
            .execute(&self.rpc_policy, |_| node.estimate_compute_limit(&call))
            .await
            .into_result()?;

        let buffer = estimated * self.config.gas_limit_buffer_percent / 100;
        Ok(estimated + buffer)
    }

    fn check_bound(&self, price: &GasPrice) -> SubmitterResult<()> {
        let max = self.max_price();
        if price.ceiling() > max {
            return Err(SubmitterError::FeeBoundExceeded {
                requested: price.ceiling(),
                max,
            });
        }
        Ok(())
    }

    fn store(&self, key: QuoteKey, quote: FeeQuote) {
        if self.cache.len() >= CACHE_PRUNE_THRESHOLD {
            let ttl = self.config.cache_ttl();
            self.cache.retain(|_, cached| cached.cached_at.elapsed() < ttl);
        }
        self.cache.insert(
            key,
            CachedQuote {
                quote,
                cached_at: Instant::now(),
            },
        );
    }

    async fn record_sample(&self, price: U256) {
        let mut history = self.history.write().await;
        history.push_back(price);
        while history.len() > self.config.history_size.max(1) {
            history.pop_front();
        }
    }
}
