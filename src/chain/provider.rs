//! Ethers-backed ledger node with multi-RPC support and automatic failover

use super::{classify_node_error, CallRequest, GasPrice, LedgerNode, LedgerTransaction, Receipt};
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{ErrorClass, SubmitterError, SubmitterResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const GWEI: u64 = 1_000_000_000;

/// Multi-provider ledger node with automatic failover
pub struct EthersNode {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl EthersNode {
    /// Create a new node client for the configured RPC endpoints
    pub fn new(config: ChainConfig) -> SubmitterResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(SubmitterError::Config(format!(
                "No valid RPC providers for chain {}",
                config.chain_id
            )));
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    fn http(&self) -> Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        self.http_providers[idx % self.http_providers.len()].clone()
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Run `call` against the active provider, moving to the next one on
    /// transport failures. Ledger rejections are returned as-is.
    async fn with_failover<T, F, Fut>(&self, operation: &str, call: F) -> SubmitterResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = None;

        for _ in 0..self.http_providers.len() {
            match call(self.http()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let error = classify_node_error(operation, &e.to_string());
                    if error.class() != ErrorClass::Transient {
                        return Err(error);
                    }
                    warn!(
                        "{} failed on chain {}: {}",
                        operation, self.config.chain_id, error
                    );
                    self.failover();
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| SubmitterError::Rpc {
            operation: operation.to_string(),
            message: "All providers failed".to_string(),
        }))
    }

    /// Estimate EIP-1559 fees from the latest block's base fee
    async fn estimate_eip1559_fees(&self) -> SubmitterResult<GasPrice> {
        let block = self
            .with_failover("get_block", |p| async move {
                p.get_block(BlockNumber::Latest).await
            })
            .await?
            .ok_or_else(|| SubmitterError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| SubmitterError::GasEstimation("No base fee in block".to_string()))?;

        let priority_fee = U256::from(self.config.priority_fee_gwei) * U256::from(GWEI);

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;

        Ok(GasPrice::Eip1559 {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: priority_fee,
        })
    }

    fn typed_call(call: &CallRequest) -> TypedTransaction {
        TransactionRequest::new()
            .from(call.from)
            .to(call.to)
            .value(call.value)
            .data(call.data.clone())
            .into()
    }
}

#[async_trait]
impl LedgerNode for EthersNode {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn confirmed_sequence(&self, address: Address) -> SubmitterResult<u64> {
        let nonce = self
            .with_failover("get_transaction_count", |p| async move {
                p.get_transaction_count(address, None).await
            })
            .await?;
        Ok(nonce.as_u64())
    }

    async fn fee_market(&self) -> SubmitterResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Eip1559 | GasPriceStrategy::Optimism => {
                self.estimate_eip1559_fees().await
            }
            // Arbitrum uses L1 + L2 gas model; eth_gasPrice already folds it in
            GasPriceStrategy::Legacy | GasPriceStrategy::Arbitrum => {
                let price = self
                    .with_failover("get_gas_price", |p| async move { p.get_gas_price().await })
                    .await?;
                Ok(GasPrice::Legacy(price))
            }
        }
    }

    async fn estimate_compute_limit(&self, call: &CallRequest) -> SubmitterResult<U256> {
        let tx = Self::typed_call(call);
        self.with_failover("estimate_gas", |p| {
            let tx = tx.clone();
            async move { p.estimate_gas(&tx, None).await }
        })
        .await
    }

    async fn simulate_call(&self, call: &CallRequest) -> SubmitterResult<Bytes> {
        let tx = Self::typed_call(call);
        self.with_failover("eth_call", |p| {
            let tx = tx.clone();
            async move { p.call(&tx, None).await }
        })
        .await
    }

    async fn broadcast(&self, signed: Bytes) -> SubmitterResult<H256> {
        self.with_failover("send_raw_transaction", |p| {
            let signed = signed.clone();
            async move {
                let pending = p.send_raw_transaction(signed).await?;
                Ok::<_, ProviderError>(pending.tx_hash())
            }
        })
        .await
    }

    async fn receipt(&self, tx_hash: H256) -> SubmitterResult<Option<Receipt>> {
        let receipt = self
            .with_failover("get_transaction_receipt", |p| async move {
                p.get_transaction_receipt(tx_hash).await
            })
            .await?;

        Ok(receipt.and_then(|r| {
            let block_number = r.block_number?.as_u64();
            Some(Receipt {
                tx_hash,
                block_number,
                position: r.transaction_index.as_u64(),
                gas_used: r.gas_used.unwrap_or_default(),
                effective_gas_price: r.effective_gas_price.unwrap_or_default(),
                success: r.status == Some(1u64.into()),
            })
        }))
    }

    async fn transaction(&self, tx_hash: H256) -> SubmitterResult<Option<LedgerTransaction>> {
        let tx = self
            .with_failover("get_transaction", |p| async move {
                p.get_transaction(tx_hash).await
            })
            .await?;

        Ok(tx.map(|tx| {
            let gas_price = match (tx.max_fee_per_gas, tx.max_priority_fee_per_gas) {
                (Some(max_fee), Some(priority)) => GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority,
                },
                _ => GasPrice::Legacy(tx.gas_price.unwrap_or_default()),
            };
            LedgerTransaction {
                hash: tx.hash,
                from: tx.from,
                to: tx.to,
                nonce: tx.nonce.as_u64(),
                value: tx.value,
                input: tx.input,
                gas_limit: tx.gas,
                gas_price,
            }
        }))
    }
}
