// Conduit - Routing Metadata and Store-and-Forward Queue Entries

use super::transfer::{TransferDefinition, TransferId, TransferResolver};
use super::{Address, PublicIdentifier};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque-to-the-engine metadata carried by a transfer. The router reads
/// it to correlate the sender-side and receiver-side legs of a payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TransferMeta {
    /// Correlation id linking both legs of a routed payment.
    pub routing_id: Option<Uuid>,
    /// Final recipient of a routed payment.
    pub recipient_identifier: Option<PublicIdentifier>,
    /// Chain the recipient leg should live on; defaults to the sender's.
    pub recipient_chain_id: Option<u64>,
    /// Asset the recipient leg should be denominated in; defaults to the
    /// sender-side asset.
    pub recipient_asset_id: Option<Address>,
    /// When true, a forwarding failure must surface to the sender instead
    /// of being queued for store-and-forward delivery.
    pub require_online: bool,
}

/// Collateralization policy for a router-operated channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceProfile {
    /// Extra collateral deposited beyond the immediate shortfall.
    pub target: u64,
    /// Balance above which reclaiming collateral becomes worthwhile.
    pub reclaim_threshold: u64,
}

impl Default for RebalanceProfile {
    fn default() -> Self {
        Self {
            target: 0,
            reclaim_threshold: u64::MAX,
        }
    }
}

/// A queued forwarding action, replayed in FIFO order per channel when the
/// counterparty checks in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RouterQueueEntry {
    TransferCreation {
        channel_address: Address,
        asset_id: Address,
        amount: u64,
        recipient: Address,
        routing_id: Uuid,
        definition: TransferDefinition,
        timeout_secs: u64,
        meta: TransferMeta,
    },
    TransferResolution {
        channel_address: Address,
        transfer_id: TransferId,
        resolver: TransferResolver,
    },
}

impl RouterQueueEntry {
    /// Channel whose FIFO queue this entry belongs to.
    pub fn channel_address(&self) -> Address {
        match self {
            RouterQueueEntry::TransferCreation { channel_address, .. } => *channel_address,
            RouterQueueEntry::TransferResolution { channel_address, .. } => *channel_address,
        }
    }
}
