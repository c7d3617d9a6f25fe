// Conduit - Channel Store Contract
//
// Durable storage of channel states, transfers and withdrawal commitments.
// A persistence engine (SQL or similar) is an external collaborator; the
// contract here guarantees that a channel-state write together with its
// optional transfer write commits atomically, and that the protocol engine
// is the only writer while it holds the channel lock.

use crate::types::{
    Address, ChannelState, PublicIdentifier, RouterQueueEntry, TransferId, TransferState,
    WithdrawalCommitment,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::RwLock;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Channel not found: {0}")]
    ChannelNotFound(Address),

    #[error("Transfer not found: {0}")]
    TransferNotFound(TransferId),

    #[error("Storage failure: {0}")]
    Storage(String),
}

/// Durable channel/transfer storage consumed by the protocol engine.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_channel_state(
        &self,
        channel: Address,
    ) -> Result<Option<ChannelState>, StoreError>;

    /// Lookup by participant pair (either order) and chain.
    async fn get_channel_state_by_participants(
        &self,
        a: &PublicIdentifier,
        b: &PublicIdentifier,
        chain_id: u64,
    ) -> Result<Option<ChannelState>, StoreError>;

    /// All channel states, used by periodic check-in sweeps.
    async fn get_channel_states(&self) -> Result<Vec<ChannelState>, StoreError>;

    async fn get_transfer_state(
        &self,
        transfer_id: TransferId,
    ) -> Result<Option<TransferState>, StoreError>;

    /// Active (unresolved) transfers for a channel.
    async fn get_active_transfers(
        &self,
        channel: Address,
    ) -> Result<Vec<TransferState>, StoreError>;

    /// Transfers carrying a routing id, across all channels. Used by the
    /// router to correlate the two legs of a payment and to make forwarded
    /// creation idempotent.
    async fn get_transfers_by_routing_id(
        &self,
        routing_id: Uuid,
    ) -> Result<Vec<TransferState>, StoreError>;

    /// Persist a new channel head, atomically with the transfer the update
    /// created or resolved, if any.
    async fn save_channel_state(
        &self,
        channel: ChannelState,
        transfer: Option<TransferState>,
    ) -> Result<(), StoreError>;

    async fn get_withdrawal_commitment(
        &self,
        transfer_id: TransferId,
    ) -> Result<Option<WithdrawalCommitment>, StoreError>;

    async fn save_withdrawal_commitment(
        &self,
        commitment: WithdrawalCommitment,
    ) -> Result<(), StoreError>;
}

/// Store-and-forward queue persistence for the router. Entries for one
/// channel form a FIFO queue drained on check-in.
#[async_trait]
pub trait RouterStore: Send + Sync {
    /// Append an entry to its channel's queue, returning the entry id.
    async fn queue_entry(&self, entry: RouterQueueEntry) -> Result<u64, StoreError>;

    /// Entries for a channel in FIFO order.
    async fn queued_entries(
        &self,
        channel: Address,
    ) -> Result<Vec<(u64, RouterQueueEntry)>, StoreError>;

    async fn remove_entry(&self, entry_id: u64) -> Result<(), StoreError>;
}

#[derive(Default)]
struct StoreInner {
    channels: HashMap<Address, ChannelState>,
    transfers: HashMap<TransferId, TransferState>,
    active: HashMap<Address, BTreeSet<TransferId>>,
    routing: HashMap<Uuid, Vec<TransferId>>,
    commitments: HashMap<TransferId, WithdrawalCommitment>,
    queues: HashMap<Address, VecDeque<(u64, RouterQueueEntry)>>,
    next_queue_id: u64,
}

/// In-memory store implementing both contracts. Interior locking gives
/// each call the required per-call atomicity; cross-update exclusion is
/// the channel lock's job, not the store's.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_channel_state(
        &self,
        channel: Address,
    ) -> Result<Option<ChannelState>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.channels.get(&channel).cloned())
    }

    async fn get_channel_state_by_participants(
        &self,
        a: &PublicIdentifier,
        b: &PublicIdentifier,
        chain_id: u64,
    ) -> Result<Option<ChannelState>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner
            .channels
            .values()
            .find(|c| {
                c.network.chain_id == chain_id
                    && ((c.public_identifiers[0] == *a && c.public_identifiers[1] == *b)
                        || (c.public_identifiers[0] == *b && c.public_identifiers[1] == *a))
            })
            .cloned())
    }

    async fn get_channel_states(&self) -> Result<Vec<ChannelState>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.channels.values().cloned().collect())
    }

    async fn get_transfer_state(
        &self,
        transfer_id: TransferId,
    ) -> Result<Option<TransferState>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.transfers.get(&transfer_id).cloned())
    }

    async fn get_active_transfers(
        &self,
        channel: Address,
    ) -> Result<Vec<TransferState>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        let ids = match inner.active.get(&channel) {
            Some(ids) => ids,
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|id| inner.transfers.get(id).cloned())
            .collect())
    }

    async fn get_transfers_by_routing_id(
        &self,
        routing_id: Uuid,
    ) -> Result<Vec<TransferState>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        let ids = match inner.routing.get(&routing_id) {
            Some(ids) => ids,
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|id| inner.transfers.get(id).cloned())
            .collect())
    }

    async fn save_channel_state(
        &self,
        channel: ChannelState,
        transfer: Option<TransferState>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let channel_address = channel.channel_address;
        inner.channels.insert(channel_address, channel);

        if let Some(transfer) = transfer {
            let entry = inner.active.entry(channel_address).or_default();
            if transfer.is_active() {
                entry.insert(transfer.transfer_id);
            } else {
                entry.remove(&transfer.transfer_id);
            }
            if let Some(routing_id) = transfer.meta.routing_id {
                let ids = inner.routing.entry(routing_id).or_default();
                if !ids.contains(&transfer.transfer_id) {
                    ids.push(transfer.transfer_id);
                }
            }
            inner.transfers.insert(transfer.transfer_id, transfer);
        }
        Ok(())
    }

    async fn get_withdrawal_commitment(
        &self,
        transfer_id: TransferId,
    ) -> Result<Option<WithdrawalCommitment>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.commitments.get(&transfer_id).cloned())
    }

    async fn save_withdrawal_commitment(
        &self,
        commitment: WithdrawalCommitment,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.commitments.insert(commitment.transfer_id, commitment);
        Ok(())
    }
}

#[async_trait]
impl RouterStore for MemoryStore {
    async fn queue_entry(&self, entry: RouterQueueEntry) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.next_queue_id += 1;
        let id = inner.next_queue_id;
        inner
            .queues
            .entry(entry.channel_address())
            .or_default()
            .push_back((id, entry));
        Ok(id)
    }

    async fn queued_entries(
        &self,
        channel: Address,
    ) -> Result<Vec<(u64, RouterQueueEntry)>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner
            .queues
            .get(&channel)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_entry(&self, entry_id: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        for queue in inner.queues.values_mut() {
            queue.retain(|(id, _)| *id != entry_id);
        }
        Ok(())
    }
}
