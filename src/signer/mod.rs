//! Key/signing service
//!
//! The pipeline only hands over an unsigned transaction and the account that
//! must sign it. Key material never leaves this module.

use crate::error::{SubmitterError, SubmitterResult};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes};
use std::collections::HashMap;
use tracing::info;

/// Produces signed, broadcast-ready payloads for managed accounts
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Whether `address` is a managed account
    fn owns(&self, address: Address) -> bool;

    /// All managed accounts
    fn accounts(&self) -> Vec<Address>;

    /// Sign `tx` with the key of `account`, returning the raw payload
    async fn sign(&self, tx: &TypedTransaction, account: Address) -> SubmitterResult<Bytes>;
}

/// Local private-key signer for a set of accounts on one chain
pub struct WalletSigner {
    chain_id: u64,
    wallets: HashMap<Address, LocalWallet>,
}

impl WalletSigner {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            wallets: HashMap::new(),
        }
    }

    /// Load one key per environment variable
    pub fn from_env(vars: &[String], chain_id: u64) -> SubmitterResult<Self> {
        let mut signer = Self::new(chain_id);

        for var in vars {
            let key = std::env::var(var).map_err(|_| {
                SubmitterError::Signing(format!("Environment variable {} is not set", var))
            })?;
            let address = signer.add_key(&key)?;
            info!("Loaded signing key for {:?} from {}", address, var);
        }

        if signer.wallets.is_empty() {
            return Err(SubmitterError::Signing(
                "No wallet configured. Set wallet.private_key_envs".to_string(),
            ));
        }

        Ok(signer)
    }

    /// Register a hex-encoded private key, returning its address
    pub fn add_key(&mut self, key: &str) -> SubmitterResult<Address> {
        let wallet = key
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| SubmitterError::Signing(format!("Invalid private key: {}", e)))?
            .with_chain_id(self.chain_id);
        let address = wallet.address();
        self.wallets.insert(address, wallet);
        Ok(address)
    }
}

#[async_trait]
impl TransactionSigner for WalletSigner {
    fn owns(&self, address: Address) -> bool {
        self.wallets.contains_key(&address)
    }

    fn accounts(&self) -> Vec<Address> {
        self.wallets.keys().copied().collect()
    }

    async fn sign(&self, tx: &TypedTransaction, account: Address) -> SubmitterResult<Bytes> {
        let wallet = self
            .wallets
            .get(&account)
            .ok_or_else(|| SubmitterError::Signing(format!("No key for {:?}", account)))?;

        let signature = wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| SubmitterError::Signing(e.to_string()))?;

        Ok(tx.rlp_signed(&signature))
    }
}
