// Conduit - Conditional Transfer Types
//
// A transfer locks part of a channel balance under a condition until it is
// resolved with satisfying data. Transfers are immutable between creation
// and resolution.

use super::routing::TransferMeta;
use super::{Address, Hash32, TypeError};
use crate::chain::MinimalTransaction;
use rand::{thread_rng, Rng};
use secp256k1::ecdsa::Signature;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier of a conditional transfer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct TransferId(pub [u8; 32]);

impl TransferId {
    /// Generate a fresh random transfer id.
    pub fn new_random() -> Self {
        let mut id = [0u8; 32];
        thread_rng().fill(&mut id);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for TransferId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes =
            hex::decode(s).map_err(|e| TypeError::InvalidTransferId(format!("{}: {}", s, e)))?;
        if bytes.len() != 32 {
            return Err(TypeError::InvalidTransferId(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

/// Condition type under which a transfer's funds are locked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDefinition {
    /// Locked under a sha256 hashlock; resolved by the preimage.
    Hashlock { lock_hash: Hash32 },
    /// An in-channel withdrawal; resolved by the recipient's signature
    /// over the withdrawal commitment digest.
    Withdraw { commitment: Hash32 },
}

/// Satisfying data that resolves a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransferResolver {
    Preimage([u8; 32]),
    WithdrawSignature(Signature),
}

/// Durable record of a single conditional transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferState {
    pub transfer_id: TransferId,
    pub channel_address: Address,
    pub asset_id: Address,
    /// Amount locked for the transfer's lifetime.
    pub amount: u64,
    /// Party credited when the transfer resolves.
    pub recipient: Address,
    /// Party whose balance funded the transfer.
    pub initiator: Address,
    pub definition: TransferDefinition,
    pub timeout_secs: u64,
    /// Channel nonce at which the transfer was created.
    pub channel_nonce: u64,
    /// Absent until the transfer is resolved; a transfer is "active"
    /// (counted in the channel's locked value) exactly while this is None.
    pub resolver: Option<TransferResolver>,
    pub meta: TransferMeta,
}

impl TransferState {
    pub fn is_active(&self) -> bool {
        self.resolver.is_none()
    }
}

/// A withdrawal commitment retained for later on-chain submission, keyed
/// by the withdraw transfer's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalCommitment {
    pub channel_address: Address,
    pub transfer_id: TransferId,
    pub asset_id: Address,
    pub amount: u64,
    pub recipient: Address,
    pub tx: MinimalTransaction,
    pub signatures: [Option<Signature>; 2],
}
