// Conduit - Forwarding Service
//
// Bridges the two legs of a routed payment: when a counterparty creates a
// conditional transfer toward this node carrying routing metadata, the
// router re-creates it in the channel to the final recipient, depositing
// collateral first when its balance there is short. Resolutions flow the
// opposite way. Unreachable recipients get store-and-forward delivery,
// drained when they check in.

use crate::chain::{ChainError, ChainService};
use crate::encoding::withdrawal_commitment_digest;
use crate::engine::{
    CreateTransferParams, Engine, EngineError, EngineEvent, IsAliveMessage,
    MINIMUM_TRANSFER_TIMEOUT,
};
use crate::messaging::{Delivery, MessagingService, SubscriptionHandler};
use crate::store::{RouterStore, Store, StoreError};
use crate::types::{
    Address, ChannelState, PublicIdentifier, RebalanceProfile, RouterQueueEntry,
    TransferDefinition, TransferMeta, TransferResolver, TransferState,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("No channel to recipient {0}")]
    NoChannelToRecipient(PublicIdentifier),

    #[error("Transfer is missing routing metadata: {0}")]
    MissingMeta(String),

    #[error("Only hashlock transfers are routable")]
    UnroutableDefinition,

    #[error("No swap rate for {from_asset} on chain {from_chain} to {to_asset} on chain {to_chain}")]
    NoSwapRate {
        from_asset: Address,
        from_chain: u64,
        to_asset: Address,
        to_chain: u64,
    },

    #[error("Forwarding failed: {0}")]
    ForwardFailed(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Pricing collaborator translating an amount between asset/chain pairs.
#[async_trait]
pub trait SwapProvider: Send + Sync {
    async fn swap_amount(
        &self,
        amount: u64,
        from_asset: Address,
        from_chain: u64,
        to_asset: Address,
        to_chain: u64,
    ) -> Result<u64, RouterError>;
}

/// 1:1 swap for same-asset routing; rejects cross-asset pairs.
pub struct IdentitySwap;

#[async_trait]
impl SwapProvider for IdentitySwap {
    async fn swap_amount(
        &self,
        amount: u64,
        from_asset: Address,
        from_chain: u64,
        to_asset: Address,
        to_chain: u64,
    ) -> Result<u64, RouterError> {
        if from_asset != to_asset {
            return Err(RouterError::NoSwapRate {
                from_asset,
                from_chain,
                to_asset,
                to_chain,
            });
        }
        Ok(amount)
    }
}

/// The forwarding service for one router node.
pub struct Router {
    engine: Arc<Engine>,
    store: Arc<dyn Store>,
    queue_store: Arc<dyn RouterStore>,
    chain: Arc<dyn ChainService>,
    messaging: Arc<dyn MessagingService>,
    swap: Arc<dyn SwapProvider>,
    rebalance: RebalanceProfile,
    /// Single-concurrency creation queue per recipient channel. The
    /// channel lock alone cannot order the deposit + create pair, so a
    /// second transfer could spend freshly deposited collateral between
    /// the first transfer's deposit and its create. This fair mutex closes
    /// that window within the router process.
    creation_queues: DashMap<Address, Arc<Mutex<()>>>,
    /// Single-consumer guard per channel queue: two near-simultaneous
    /// check-ins must not interleave their drains.
    drain_queues: DashMap<Address, Arc<Mutex<()>>>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<Engine>,
        store: Arc<dyn Store>,
        queue_store: Arc<dyn RouterStore>,
        chain: Arc<dyn ChainService>,
        messaging: Arc<dyn MessagingService>,
        swap: Arc<dyn SwapProvider>,
        rebalance: RebalanceProfile,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            store,
            queue_store,
            chain,
            messaging,
            swap,
            rebalance,
            creation_queues: DashMap::new(),
            drain_queues: DashMap::new(),
        })
    }

    /// Wire the router into the engine's event stream and the check-in
    /// subject, then return. Forwarding happens on background tasks.
    pub async fn start(self: &Arc<Self>) -> Result<(), RouterError> {
        let me = self.engine.public_identifier().clone();
        let filter_id = me.clone();
        let mut events = self.engine.events().subscribe(move |event| match event {
            // Own-originated resolutions feed the reclaim check; own
            // creations are this router's forwards and never re-forward.
            EngineEvent::TransferCreated { initiator, .. } => *initiator != filter_id,
            EngineEvent::TransferResolved { .. } => true,
            _ => false,
        });

        let router = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    EngineEvent::TransferCreated { channel, transfer, .. } => {
                        if transfer.meta.routing_id.is_none() {
                            continue;
                        }
                        if let Err(e) = router.forward_transfer_creation(&channel, &transfer).await
                        {
                            warn!(
                                transfer = %transfer.transfer_id,
                                error = %e,
                                "transfer creation forwarding failed"
                            );
                        }
                    }
                    EngineEvent::TransferResolved { channel, transfer, initiator } => {
                        if initiator == me {
                            // This node just collected funds; check the
                            // channel for excess collateral off the
                            // forwarding path.
                            let router = Arc::clone(&router);
                            tokio::spawn(async move {
                                let channel_address = channel.channel_address;
                                if let Err(e) =
                                    router.maybe_reclaim(channel_address, transfer.asset_id).await
                                {
                                    warn!(
                                        channel = %channel_address,
                                        error = %e,
                                        "collateral reclaim failed"
                                    );
                                }
                            });
                            continue;
                        }
                        if transfer.meta.routing_id.is_none() {
                            continue;
                        }
                        if let Err(e) = router.forward_transfer_resolution(&channel, &transfer).await
                        {
                            warn!(
                                transfer = %transfer.transfer_id,
                                error = %e,
                                "transfer resolution forwarding failed"
                            );
                        }
                    }
                    _ => {}
                }
            }
        });

        let router = Arc::clone(self);
        let pattern = format!("{}.*.isalive", self.engine.public_identifier());
        let handler: SubscriptionHandler = Arc::new(move |delivery: Delivery| {
            let router = Arc::clone(&router);
            Box::pin(async move {
                let message: IsAliveMessage = match serde_json::from_slice(&delivery.payload) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(subject = %delivery.subject, error = %e, "malformed check-in");
                        return;
                    }
                };
                router.handle_is_alive(message.channel_address).await;
            })
        });
        self.messaging
            .subscribe(&pattern, handler)
            .await
            .map_err(|e| RouterError::ForwardFailed(e.to_string()))?;
        info!(identifier = %self.engine.public_identifier(), "router started");
        Ok(())
    }

    /// Forward a sender-side transfer creation into the recipient channel.
    pub async fn forward_transfer_creation(
        &self,
        sender_channel: &ChannelState,
        transfer: &TransferState,
    ) -> Result<(), RouterError> {
        let routing_id = transfer
            .meta
            .routing_id
            .ok_or_else(|| RouterError::MissingMeta("routing_id".into()))?;
        let recipient = transfer
            .meta
            .recipient_identifier
            .clone()
            .ok_or_else(|| RouterError::MissingMeta("recipient_identifier".into()))?;
        if !matches!(transfer.definition, TransferDefinition::Hashlock { .. }) {
            return Err(RouterError::UnroutableDefinition);
        }

        let sender_chain = sender_channel.network.chain_id;
        let recipient_chain = transfer.meta.recipient_chain_id.unwrap_or(sender_chain);
        let recipient_asset = transfer.meta.recipient_asset_id.unwrap_or(transfer.asset_id);
        let amount = self
            .swap
            .swap_amount(
                transfer.amount,
                transfer.asset_id,
                sender_chain,
                recipient_asset,
                recipient_chain,
            )
            .await?;

        let recipient_channel = self
            .store
            .get_channel_state_by_participants(
                self.engine.public_identifier(),
                &recipient,
                recipient_chain,
            )
            .await?
            .ok_or(RouterError::NoChannelToRecipient(recipient))?;
        let recipient_address = self.counterparty_address(&recipient_channel)?;

        // The receiver leg keeps the correlation id but sheds the routing
        // target, which only made sense on the sender leg.
        let meta = TransferMeta {
            routing_id: Some(routing_id),
            require_online: transfer.meta.require_online,
            ..TransferMeta::default()
        };

        let entry = RouterQueueEntry::TransferCreation {
            channel_address: recipient_channel.channel_address,
            asset_id: recipient_asset,
            amount,
            recipient: recipient_address,
            routing_id,
            definition: transfer.definition.clone(),
            timeout_secs: transfer.timeout_secs,
            meta,
        };
        match self.apply_creation(&entry).await {
            Ok(()) => Ok(()),
            Err(RouterError::Engine(EngineError::CounterpartyUnresponsive(_)))
                if !transfer.meta.require_online =>
            {
                info!(
                    routing_id = %routing_id,
                    channel = %recipient_channel.channel_address,
                    "recipient unreachable; queueing creation for check-in"
                );
                self.queue_store.queue_entry(entry).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Forward a receiver-side resolution back to the sender leg. Failures
    /// are always queued: the sender-side funds stay locked until this
    /// resolution lands.
    pub async fn forward_transfer_resolution(
        &self,
        receiver_channel: &ChannelState,
        transfer: &TransferState,
    ) -> Result<(), RouterError> {
        let routing_id = transfer
            .meta
            .routing_id
            .ok_or_else(|| RouterError::MissingMeta("routing_id".into()))?;
        let resolver = transfer
            .resolver
            .clone()
            .ok_or_else(|| RouterError::MissingMeta("resolver".into()))?;

        let legs = self.store.get_transfers_by_routing_id(routing_id).await?;
        let sender_leg = match legs
            .iter()
            .find(|t| t.channel_address != receiver_channel.channel_address && t.is_active())
        {
            Some(leg) => leg,
            None => {
                debug!(routing_id = %routing_id, "no active sender leg; nothing to resolve");
                return Ok(());
            }
        };

        let entry = RouterQueueEntry::TransferResolution {
            channel_address: sender_leg.channel_address,
            transfer_id: sender_leg.transfer_id,
            resolver: resolver.clone(),
        };
        match self
            .engine
            .resolve(sender_leg.channel_address, sender_leg.transfer_id, resolver)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(
                    routing_id = %routing_id,
                    transfer = %sender_leg.transfer_id,
                    error = %e,
                    "sender-side resolve failed; queueing retry"
                );
                self.queue_store.queue_entry(entry).await?;
                Ok(())
            }
        }
    }

    /// Drain a channel's store-and-forward queue in FIFO order. Replay
    /// stops at the first failure so ordering is preserved for the next
    /// check-in.
    pub async fn handle_is_alive(&self, channel_address: Address) {
        let drain = self
            .drain_queues
            .entry(channel_address)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _draining = drain.lock().await;

        let entries = match self.queue_store.queued_entries(channel_address).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(channel = %channel_address, error = %e, "failed to read forwarding queue");
                return;
            }
        };
        if entries.is_empty() {
            return;
        }
        info!(
            channel = %channel_address,
            pending = entries.len(),
            "draining forwarding queue"
        );
        for (entry_id, entry) in entries {
            if let Err(e) = self.replay_entry(&entry).await {
                warn!(
                    channel = %channel_address,
                    entry_id,
                    error = %e,
                    "queue replay failed; stopping drain"
                );
                return;
            }
            if let Err(e) = self.queue_store.remove_entry(entry_id).await {
                warn!(entry_id, error = %e, "failed to remove replayed entry");
                return;
            }
        }
    }

    async fn replay_entry(&self, entry: &RouterQueueEntry) -> Result<(), RouterError> {
        match entry {
            RouterQueueEntry::TransferCreation { .. } => self.apply_creation(entry).await,
            RouterQueueEntry::TransferResolution {
                channel_address,
                transfer_id,
                resolver,
            } => {
                // Resolving twice is an idempotent no-op in the engine.
                self.engine
                    .resolve(*channel_address, *transfer_id, resolver.clone())
                    .await?;
                Ok(())
            }
        }
    }

    /// Collateralize if short, then create, serialized per recipient
    /// channel. Idempotent by routing id.
    async fn apply_creation(&self, entry: &RouterQueueEntry) -> Result<(), RouterError> {
        let (channel_address, asset_id, amount, recipient, routing_id, definition, timeout_secs, meta) =
            match entry {
                RouterQueueEntry::TransferCreation {
                    channel_address,
                    asset_id,
                    amount,
                    recipient,
                    routing_id,
                    definition,
                    timeout_secs,
                    meta,
                } => (
                    *channel_address,
                    *asset_id,
                    *amount,
                    *recipient,
                    *routing_id,
                    definition.clone(),
                    *timeout_secs,
                    meta.clone(),
                ),
                RouterQueueEntry::TransferResolution { .. } => {
                    return Err(RouterError::ForwardFailed(
                        "resolution entry in creation path".into(),
                    ))
                }
            };

        let queue = self
            .creation_queues
            .entry(channel_address)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _serialized = queue.lock().await;

        // A previous attempt may already have landed this leg.
        let existing = self.store.get_transfers_by_routing_id(routing_id).await?;
        if existing.iter().any(|t| t.channel_address == channel_address) {
            debug!(routing_id = %routing_id, "receiver leg already created; no-op");
            return Ok(());
        }

        self.ensure_collateral(channel_address, asset_id, amount).await?;

        self.engine
            .create(CreateTransferParams {
                channel_address,
                asset_id,
                amount,
                recipient,
                definition,
                timeout_secs,
                meta,
            })
            .await?;
        Ok(())
    }

    /// Deposit and reconcile when this node's balance in the channel is
    /// short of `amount`, topping up to `amount + rebalance.target`.
    async fn ensure_collateral(
        &self,
        channel_address: Address,
        asset_id: Address,
        amount: u64,
    ) -> Result<(), RouterError> {
        let channel = self
            .store
            .get_channel_state(channel_address)
            .await?
            .ok_or(EngineError::ChannelNotFound(channel_address))?;
        let my_index = channel
            .identifier_index(self.engine.public_identifier())
            .ok_or(EngineError::ChannelNotFound(channel_address))?;

        let available = channel.available_balance(&asset_id, my_index);
        if available >= amount {
            return Ok(());
        }

        // An earlier attempt may have deposited without managing to
        // reconcile (the counterparty was offline). Count those funds
        // before topping up.
        let record = self
            .chain
            .get_latest_deposit(channel_address, channel.network.chain_id, asset_id)
            .await?;
        let unreconciled = record
            .total_deposited
            .saturating_sub(channel.total_offchain(&asset_id));
        let covered = available + unreconciled;
        if covered < amount {
            let deposit = (amount - covered) + self.rebalance.target;
            info!(
                channel = %channel_address,
                asset = %asset_id,
                available,
                required = amount,
                deposit,
                "collateralizing recipient channel"
            );
            self.chain
                .send_deposit_tx(&channel, self.engine.address(), deposit, asset_id)
                .await?;
        }
        self.engine.reconcile_deposit(channel_address, asset_id).await?;
        Ok(())
    }

    /// Pull collateral above `reclaim_threshold` back on-chain, leaving
    /// `rebalance.target` behind. Runs after this node collects on a
    /// sender leg; the default profile (threshold `u64::MAX`) never
    /// triggers it.
    async fn maybe_reclaim(
        &self,
        channel_address: Address,
        asset_id: Address,
    ) -> Result<(), RouterError> {
        if self.rebalance.reclaim_threshold == u64::MAX {
            return Ok(());
        }
        let channel = self
            .store
            .get_channel_state(channel_address)
            .await?
            .ok_or(EngineError::ChannelNotFound(channel_address))?;
        let my_index = channel
            .identifier_index(self.engine.public_identifier())
            .ok_or(EngineError::ChannelNotFound(channel_address))?;

        let balance = channel.available_balance(&asset_id, my_index);
        if balance <= self.rebalance.reclaim_threshold {
            return Ok(());
        }
        let amount = balance.saturating_sub(self.rebalance.target);
        if amount == 0 {
            return Ok(());
        }

        let me = self.engine.address();
        let commitment = withdrawal_commitment_digest(
            &channel_address,
            &me,
            &asset_id,
            amount,
            channel.nonce + 1,
        );
        let (_, transfer) = self
            .engine
            .create(CreateTransferParams {
                channel_address,
                asset_id,
                amount,
                recipient: me,
                definition: TransferDefinition::Withdraw { commitment },
                timeout_secs: MINIMUM_TRANSFER_TIMEOUT,
                meta: TransferMeta::default(),
            })
            .await?;
        self.engine
            .resolve(
                channel_address,
                transfer.transfer_id,
                TransferResolver::WithdrawSignature(self.engine.sign_digest(&commitment)),
            )
            .await?;

        if let Some(stored) = self
            .store
            .get_withdrawal_commitment(transfer.transfer_id)
            .await?
        {
            self.chain.send_withdraw_tx(&channel, stored.tx).await?;
        }
        info!(
            channel = %channel_address,
            asset = %asset_id,
            amount,
            remaining = self.rebalance.target,
            "reclaimed excess collateral"
        );
        Ok(())
    }

    fn counterparty_address(&self, channel: &ChannelState) -> Result<Address, RouterError> {
        let my_index = channel
            .identifier_index(self.engine.public_identifier())
            .ok_or(EngineError::ChannelNotFound(channel.channel_address))?;
        Ok(channel.participants[1 - my_index])
    }
}
