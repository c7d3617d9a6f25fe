// Conduit - Chain Reader/Writer Contracts
//
// The on-chain multisig/adjudicator is an external collaborator. The core
// only needs to read deposit records and balances and to submit signed
// transactions; contract semantics live elsewhere. `MockChainService`
// stands in for a provider in the node wiring and tests.

use crate::types::{Address, ChannelState, Hash32};
use async_trait::async_trait;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("No provider configured for chain {0}")]
    ProviderNotConfigured(u64),

    #[error("Insufficient sender funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Transaction reverted: {0}")]
    TxReverted(String),

    #[error("No deposit record for channel {channel} asset {asset}")]
    NoDepositRecord { channel: Address, asset: Address },
}

/// On-chain deposit record for (channel, asset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DepositRecord {
    /// Strictly increasing deposit index for the (channel, asset) pair.
    pub nonce: u64,
    /// Cumulative amount deposited for the asset.
    pub total_deposited: u64,
}

/// Receipt for a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: Hash32,
    pub confirmed: bool,
}

/// A pre-built transaction ready for submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimalTransaction {
    pub to: Address,
    pub value: u64,
    pub data: Vec<u8>,
}

/// Read-side chain access needed by the protocol engine.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Latest deposit record for an asset in a channel's multisig.
    async fn get_latest_deposit(
        &self,
        channel: Address,
        chain_id: u64,
        asset_id: Address,
    ) -> Result<DepositRecord, ChainError>;

    /// Current on-chain balance held by the channel multisig.
    async fn get_onchain_balance(
        &self,
        channel: Address,
        chain_id: u64,
        asset_id: Address,
    ) -> Result<u64, ChainError>;

    /// Deployed bytecode of the channel factory; empty when undeployed.
    async fn get_channel_factory_bytecode(&self, chain_id: u64) -> Result<Vec<u8>, ChainError>;
}

/// Write-side chain access: submitting signed multisig transactions.
#[async_trait]
pub trait ChainWriter: Send + Sync {
    async fn send_deposit_tx(
        &self,
        channel: &ChannelState,
        sender: Address,
        amount: u64,
        asset_id: Address,
    ) -> Result<TxReceipt, ChainError>;

    async fn send_withdraw_tx(
        &self,
        channel: &ChannelState,
        tx: MinimalTransaction,
    ) -> Result<TxReceipt, ChainError>;

    async fn send_tx(&self, tx: MinimalTransaction, chain_id: u64) -> Result<TxReceipt, ChainError>;
}

/// Combined read/write chain access, for collaborators needing both.
pub trait ChainService: ChainReader + ChainWriter {}

impl<T: ChainReader + ChainWriter> ChainService for T {}

fn random_receipt() -> TxReceipt {
    let mut tx_hash = [0u8; 32];
    thread_rng().fill(&mut tx_hash);
    TxReceipt {
        tx_hash,
        confirmed: true,
    }
}

/// In-memory chain double: a flat ledger of deposit records per
/// (channel, asset). Deposits confirm immediately.
#[derive(Default)]
pub struct MockChainService {
    deposits: RwLock<HashMap<(Address, Address), DepositRecord>>,
    factory_bytecode: Vec<u8>,
}

impl MockChainService {
    pub fn new() -> Self {
        Self {
            deposits: RwLock::new(HashMap::new()),
            // Non-empty stand-in so setup's deployment check passes.
            factory_bytecode: vec![0x60, 0x80, 0x60, 0x40],
        }
    }

    /// Record a deposit directly, as an external funder would.
    pub fn fund(&self, channel: Address, asset_id: Address, amount: u64) -> DepositRecord {
        let mut deposits = self.deposits.write().expect("deposit lock poisoned");
        let record = deposits.entry((channel, asset_id)).or_default();
        record.nonce += 1;
        record.total_deposited += amount;
        debug!(
            channel = %channel,
            asset = %asset_id,
            amount,
            deposit_nonce = record.nonce,
            "mock chain deposit recorded"
        );
        *record
    }
}

#[async_trait]
impl ChainReader for MockChainService {
    async fn get_latest_deposit(
        &self,
        channel: Address,
        _chain_id: u64,
        asset_id: Address,
    ) -> Result<DepositRecord, ChainError> {
        let deposits = self.deposits.read().expect("deposit lock poisoned");
        Ok(deposits.get(&(channel, asset_id)).copied().unwrap_or_default())
    }

    async fn get_onchain_balance(
        &self,
        channel: Address,
        _chain_id: u64,
        asset_id: Address,
    ) -> Result<u64, ChainError> {
        let deposits = self.deposits.read().expect("deposit lock poisoned");
        Ok(deposits
            .get(&(channel, asset_id))
            .map(|r| r.total_deposited)
            .unwrap_or(0))
    }

    async fn get_channel_factory_bytecode(&self, _chain_id: u64) -> Result<Vec<u8>, ChainError> {
        Ok(self.factory_bytecode.clone())
    }
}

#[async_trait]
impl ChainWriter for MockChainService {
    async fn send_deposit_tx(
        &self,
        channel: &ChannelState,
        sender: Address,
        amount: u64,
        asset_id: Address,
    ) -> Result<TxReceipt, ChainError> {
        let record = self.fund(channel.channel_address, asset_id, amount);
        info!(
            channel = %channel.channel_address,
            sender = %sender,
            amount,
            deposit_nonce = record.nonce,
            "deposit transaction confirmed"
        );
        Ok(random_receipt())
    }

    async fn send_withdraw_tx(
        &self,
        channel: &ChannelState,
        tx: MinimalTransaction,
    ) -> Result<TxReceipt, ChainError> {
        info!(
            channel = %channel.channel_address,
            to = %tx.to,
            value = tx.value,
            "withdraw transaction confirmed"
        );
        Ok(random_receipt())
    }

    async fn send_tx(
        &self,
        _tx: MinimalTransaction,
        _chain_id: u64,
    ) -> Result<TxReceipt, ChainError> {
        Ok(random_receipt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deposits_accumulate_with_increasing_nonce() {
        let chain = MockChainService::new();
        let channel = Address::zero();
        let asset = Address::zero();

        chain.fund(channel, asset, 100);
        chain.fund(channel, asset, 50);

        let record = chain.get_latest_deposit(channel, 1337, asset).await.unwrap();
        assert_eq!(record.nonce, 2);
        assert_eq!(record.total_deposited, 150);
        assert_eq!(chain.get_onchain_balance(channel, 1337, asset).await.unwrap(), 150);
    }

    #[tokio::test]
    async fn unfunded_channel_reads_zero() {
        let chain = MockChainService::new();
        let record = chain
            .get_latest_deposit(Address::zero(), 1, Address::zero())
            .await
            .unwrap();
        assert_eq!(record, DepositRecord::default());
    }
}
