// Conduit - Protocol Engine
//
// Drives the co-signed update protocol over a channel: setup, deposit
// reconciliation, conditional transfer creation and resolution. Every
// mutating operation runs under the channel lock for its whole duration;
// the responder path re-derives each proposed transition independently and
// countersigns only what it can reproduce.

pub mod apply;
pub mod events;

pub use apply::apply_update;
pub use events::{EngineEvent, EventBus};

use crate::chain::{ChainError, ChainReader, MinimalTransaction};
use crate::crypto::{
    verify_update_signature, verify_update_signatures, ChannelSigner, SignatureError,
};
use crate::encoding::{update_digest, withdrawal_commitment_digest, EncodingError};
use crate::lock::{LockError, LockService};
use crate::messaging::{
    is_alive_subject, protocol_subject, Delivery, MessagingError, MessagingService,
    SubscriptionHandler,
};
use crate::store::{Store, StoreError};
use crate::types::{
    Address, Balance, ChannelState, ChannelUpdate, Hash32, NetworkContext, PublicIdentifier,
    TransferDefinition, TransferId, TransferMeta, TransferResolver, TransferState, UpdateDetails,
    WithdrawalCommitment,
};
use secp256k1::ecdsa::Signature;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Channel dispute timeout bounds, in seconds.
pub const MINIMUM_CHANNEL_TIMEOUT: u64 = 3_600;
pub const MAXIMUM_CHANNEL_TIMEOUT: u64 = 864_000;

/// Transfer timeout bounds, in seconds.
pub const MINIMUM_TRANSFER_TIMEOUT: u64 = 600;
pub const MAXIMUM_TRANSFER_TIMEOUT: u64 = 259_200;

/// How long a proposer waits for the counterparty to countersign.
pub const PROTOCOL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Channel already exists: {0}")]
    ChannelExists(Address),

    #[error("Channel not found: {0}")]
    ChannelNotFound(Address),

    #[error("Transfer not found: {0}")]
    TransferNotFound(TransferId),

    #[error("Asset not tracked by channel: {0}")]
    AssetNotFound(Address),

    #[error("Invalid update nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },

    #[error("Invalid transfer amount: {0}")]
    InvalidAmount(u64),

    #[error("Timeout {value}s outside [{min}s, {max}s]")]
    InvalidTimeout { value: u64, min: u64, max: u64 },

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: u64, available: u64 },

    #[error("Channel setup failed: {0}")]
    SetupFailed(String),

    #[error("Channel factory not deployed on chain {0}")]
    FactoryNotDeployed(u64),

    #[error("Resolver does not satisfy the transfer condition: {0}")]
    ResolverInvalid(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Counterparty rejected update: {0}")]
    CounterpartyRejected(String),

    #[error("Counterparty unresponsive on {0}")]
    CounterpartyUnresponsive(String),

    #[error("Countersigned reply does not match the proposed update")]
    ReplyMismatch,

    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Messaging error: {0}")]
    Messaging(MessagingError),
}

impl From<MessagingError> for EngineError {
    fn from(err: MessagingError) -> Self {
        if err.is_unresponsive() {
            EngineError::CounterpartyUnresponsive(err.to_string())
        } else {
            EngineError::Messaging(err)
        }
    }
}

/// Parameters for creating a conditional transfer.
#[derive(Debug, Clone)]
pub struct CreateTransferParams {
    pub channel_address: Address,
    pub asset_id: Address,
    pub amount: u64,
    pub recipient: Address,
    pub definition: TransferDefinition,
    pub timeout_secs: u64,
    pub meta: TransferMeta,
}

/// Reply to a proposed update.
#[derive(Debug, Serialize, Deserialize)]
enum ProtocolReply {
    /// The countersigned update, both slots filled.
    Accepted { update: ChannelUpdate },
    Rejected { reason: String },
}

/// Check-in payload published on the is-alive subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsAliveMessage {
    pub channel_address: Address,
}

/// The protocol engine for one node. Shared behind an `Arc`; `start` wires
/// the responder subscription.
pub struct Engine {
    signer: ChannelSigner,
    store: Arc<dyn Store>,
    messaging: Arc<dyn MessagingService>,
    lock: Arc<LockService>,
    chain: Arc<dyn ChainReader>,
    events: EventBus,
}

impl Engine {
    pub fn new(
        signer: ChannelSigner,
        store: Arc<dyn Store>,
        messaging: Arc<dyn MessagingService>,
        lock: Arc<LockService>,
        chain: Arc<dyn ChainReader>,
    ) -> Arc<Self> {
        Arc::new(Self {
            signer,
            store,
            messaging,
            lock,
            chain,
            events: EventBus::new(),
        })
    }

    pub fn public_identifier(&self) -> &PublicIdentifier {
        self.signer.public_identifier()
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Sign an arbitrary protocol digest with this node's channel key,
    /// e.g. a withdrawal commitment.
    pub fn sign_digest(&self, digest: &Hash32) -> Signature {
        self.signer.sign_digest(digest)
    }

    /// Subscribe to inbound update proposals. Must be called once before
    /// the node can respond to counterparties.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let engine = Arc::clone(self);
        let pattern = format!("{}.*.protocol", self.public_identifier());
        let handler: SubscriptionHandler = Arc::new(move |delivery: Delivery| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                engine.handle_protocol_delivery(delivery).await;
            })
        });
        self.messaging.subscribe(&pattern, handler).await.map_err(EngineError::Messaging)?;
        info!(identifier = %self.public_identifier(), "protocol engine started");
        Ok(())
    }

    // ---- reads ----

    pub async fn get_channel_state(
        &self,
        channel: Address,
    ) -> Result<Option<ChannelState>, EngineError> {
        Ok(self.store.get_channel_state(channel).await?)
    }

    pub async fn get_transfer_state(
        &self,
        transfer_id: TransferId,
    ) -> Result<Option<TransferState>, EngineError> {
        Ok(self.store.get_transfer_state(transfer_id).await?)
    }

    pub async fn get_active_transfers(
        &self,
        channel: Address,
    ) -> Result<Vec<TransferState>, EngineError> {
        Ok(self.store.get_active_transfers(channel).await?)
    }

    // ---- mutating operations ----

    /// Establish a new channel with `counterparty`. The proposer becomes
    /// alice and hosts the channel lock.
    pub async fn setup(
        &self,
        counterparty: &PublicIdentifier,
        network: NetworkContext,
        timeout_secs: u64,
    ) -> Result<ChannelState, EngineError> {
        if !(MINIMUM_CHANNEL_TIMEOUT..=MAXIMUM_CHANNEL_TIMEOUT).contains(&timeout_secs) {
            return Err(EngineError::InvalidTimeout {
                value: timeout_secs,
                min: MINIMUM_CHANNEL_TIMEOUT,
                max: MAXIMUM_CHANNEL_TIMEOUT,
            });
        }
        if counterparty == self.public_identifier() {
            return Err(EngineError::SetupFailed(
                "cannot open a channel with yourself".into(),
            ));
        }
        let bytecode = self.chain.get_channel_factory_bytecode(network.chain_id).await?;
        if bytecode.is_empty() {
            return Err(EngineError::FactoryNotDeployed(network.chain_id));
        }
        if let Some(existing) = self
            .store
            .get_channel_state_by_participants(self.public_identifier(), counterparty, network.chain_id)
            .await?
        {
            return Err(EngineError::ChannelExists(existing.channel_address));
        }

        let alice = self.address();
        let bob = counterparty
            .address()
            .map_err(|e| EngineError::SetupFailed(e.to_string()))?;
        let channel_address =
            crate::encoding::channel_address(&alice, &bob, network.chain_id, &network.channel_factory);

        let update = ChannelUpdate {
            channel_address,
            from_identifier: self.public_identifier().clone(),
            to_identifier: counterparty.clone(),
            nonce: 1,
            balance: Balance::empty([alice, bob]),
            asset_id: Address::zero(),
            details: UpdateDetails::Setup {
                timeout_secs,
                network,
            },
            signatures: [None, None],
        };

        // As setup proposer this node is the lock host.
        let (state, _) = self.locked_proposal(channel_address, true, counterparty, update).await?;
        Ok(state)
    }

    /// Reconcile on-chain deposits for `asset_id` into off-chain balances,
    /// crediting this node with the un-reconciled delta. A no-op when the
    /// chain record has nothing new.
    pub async fn reconcile_deposit(
        &self,
        channel_address: Address,
        asset_id: Address,
    ) -> Result<ChannelState, EngineError> {
        let head = self
            .store
            .get_channel_state(channel_address)
            .await?
            .ok_or(EngineError::ChannelNotFound(channel_address))?;
        let my_index = self
            .identifier_index(&head)
            .ok_or(EngineError::ChannelNotFound(channel_address))?;
        let is_host = my_index == 0;
        let counterparty = head.public_identifiers[1 - my_index].clone();

        let secret = self
            .lock
            .acquire(&channel_address.to_string(), is_host, Some(&counterparty))
            .await?;
        let result = self
            .reconcile_deposit_locked(channel_address, asset_id, my_index, &counterparty)
            .await;
        self.release_lock(channel_address, &secret, is_host, &counterparty).await;
        result
    }

    async fn reconcile_deposit_locked(
        &self,
        channel_address: Address,
        asset_id: Address,
        my_index: usize,
        counterparty: &PublicIdentifier,
    ) -> Result<ChannelState, EngineError> {
        // Reload under the lock: a concurrent reconciliation may have
        // advanced the head while this call waited.
        let head = self
            .store
            .get_channel_state(channel_address)
            .await?
            .ok_or(EngineError::ChannelNotFound(channel_address))?;

        let record = self
            .chain
            .get_latest_deposit(channel_address, head.network.chain_id, asset_id)
            .await?;
        if record.nonce <= head.latest_deposit_nonce(&asset_id) {
            debug!(channel = %channel_address, asset = %asset_id, "no new deposits to reconcile");
            return Ok(head);
        }
        let reconciled = head.reconciled_funds(&asset_id);
        let delta = record.total_deposited.saturating_sub(reconciled);
        if delta == 0 {
            debug!(channel = %channel_address, "deposit record advanced without new value");
            return Ok(head);
        }

        let mut balance = match head.asset_index(&asset_id) {
            Some(i) => head.balances[i].clone(),
            None => Balance::empty(head.participants),
        };
        balance.amount[my_index] = balance.amount[my_index].checked_add(delta).ok_or_else(|| {
            EngineError::ProtocolViolation("reconciled deposit overflows the balance".into())
        })?;

        let update = ChannelUpdate {
            channel_address,
            from_identifier: self.public_identifier().clone(),
            to_identifier: counterparty.clone(),
            nonce: head.nonce + 1,
            balance,
            asset_id,
            details: UpdateDetails::Deposit {
                deposit_nonce: record.nonce,
            },
            signatures: [None, None],
        };
        let (state, _) = self.propose(Some(head), update).await?;
        Ok(state)
    }

    /// Lock `amount` of the proposer's balance under a condition as a new
    /// transfer.
    pub async fn create(
        &self,
        params: CreateTransferParams,
    ) -> Result<(ChannelState, TransferState), EngineError> {
        if !(MINIMUM_TRANSFER_TIMEOUT..=MAXIMUM_TRANSFER_TIMEOUT).contains(&params.timeout_secs) {
            return Err(EngineError::InvalidTimeout {
                value: params.timeout_secs,
                min: MINIMUM_TRANSFER_TIMEOUT,
                max: MAXIMUM_TRANSFER_TIMEOUT,
            });
        }
        if params.amount == 0 {
            return Err(EngineError::InvalidAmount(0));
        }

        let channel_address = params.channel_address;
        let (is_host, counterparty) = self.lock_role(channel_address).await?;
        let secret = self
            .lock
            .acquire(&channel_address.to_string(), is_host, Some(&counterparty))
            .await?;
        let result = self.create_locked(params, &counterparty).await;
        self.release_lock(channel_address, &secret, is_host, &counterparty).await;
        result
    }

    async fn create_locked(
        &self,
        params: CreateTransferParams,
        counterparty: &PublicIdentifier,
    ) -> Result<(ChannelState, TransferState), EngineError> {
        let head = self
            .store
            .get_channel_state(params.channel_address)
            .await?
            .ok_or(EngineError::ChannelNotFound(params.channel_address))?;
        let my_index = self
            .identifier_index(&head)
            .ok_or(EngineError::ChannelNotFound(params.channel_address))?;

        let asset_idx = head
            .asset_index(&params.asset_id)
            .ok_or(EngineError::AssetNotFound(params.asset_id))?;
        let available = head.balances[asset_idx].amount[my_index];
        if available < params.amount {
            return Err(EngineError::InsufficientBalance {
                required: params.amount,
                available,
            });
        }

        // Deterministic by (channel, nonce, condition): a retry after a
        // lost reply reproduces the exact prior proposal, which the
        // responder answers from its applied head instead of rejecting.
        let transfer_id = crate::encoding::derive_transfer_id(
            &head.channel_address,
            head.nonce + 1,
            &params.definition,
        )?;
        let candidate = TransferState {
            transfer_id,
            channel_address: head.channel_address,
            asset_id: params.asset_id,
            amount: params.amount,
            recipient: params.recipient,
            initiator: head.participants[my_index],
            definition: params.definition.clone(),
            timeout_secs: params.timeout_secs,
            channel_nonce: head.nonce + 1,
            resolver: None,
            meta: params.meta.clone(),
        };
        let mut active = self.store.get_active_transfers(head.channel_address).await?;
        active.push(candidate);
        let merkle_root = crate::merkle::active_transfer_root(&active)?;

        let mut balance = head.balances[asset_idx].clone();
        balance.amount[my_index] -= params.amount;

        let update = ChannelUpdate {
            channel_address: head.channel_address,
            from_identifier: self.public_identifier().clone(),
            to_identifier: counterparty.clone(),
            nonce: head.nonce + 1,
            balance,
            asset_id: params.asset_id,
            details: UpdateDetails::Create {
                transfer_id,
                definition: params.definition,
                amount: params.amount,
                recipient: params.recipient,
                transfer_timeout_secs: params.timeout_secs,
                merkle_root,
                meta: params.meta,
            },
            signatures: [None, None],
        };
        let (state, transfer) = self.propose(Some(head), update).await?;
        let transfer = transfer.ok_or_else(|| {
            EngineError::ProtocolViolation("create update produced no transfer".into())
        })?;
        Ok((state, transfer))
    }

    /// Resolve an active transfer. Resolving an already-resolved transfer
    /// is an idempotent success returning the stored final state.
    pub async fn resolve(
        &self,
        channel_address: Address,
        transfer_id: TransferId,
        resolver: TransferResolver,
    ) -> Result<(ChannelState, TransferState), EngineError> {
        let (is_host, counterparty) = self.lock_role(channel_address).await?;
        let secret = self
            .lock
            .acquire(&channel_address.to_string(), is_host, Some(&counterparty))
            .await?;
        let result = self
            .resolve_locked(channel_address, transfer_id, resolver, &counterparty)
            .await;
        self.release_lock(channel_address, &secret, is_host, &counterparty).await;
        result
    }

    async fn resolve_locked(
        &self,
        channel_address: Address,
        transfer_id: TransferId,
        resolver: TransferResolver,
        counterparty: &PublicIdentifier,
    ) -> Result<(ChannelState, TransferState), EngineError> {
        let head = self
            .store
            .get_channel_state(channel_address)
            .await?
            .ok_or(EngineError::ChannelNotFound(channel_address))?;

        let stored = self
            .store
            .get_transfer_state(transfer_id)
            .await?
            .ok_or(EngineError::TransferNotFound(transfer_id))?;
        if !stored.is_active() {
            debug!(transfer = %transfer_id, "transfer already resolved; idempotent return");
            return Ok((head, stored));
        }

        let active = self.store.get_active_transfers(channel_address).await?;
        let asset_idx = head
            .asset_index(&stored.asset_id)
            .ok_or(EngineError::AssetNotFound(stored.asset_id))?;
        let recipient_idx = head.participant_index(&stored.recipient).ok_or_else(|| {
            EngineError::ProtocolViolation("transfer recipient is not a participant".into())
        })?;

        let remaining: Vec<TransferState> = active
            .iter()
            .filter(|t| t.transfer_id != transfer_id)
            .cloned()
            .collect();
        let merkle_root = crate::merkle::active_transfer_root(&remaining)?;

        // Hashlock resolutions credit the recipient; withdraw resolutions
        // leave the balance alone, the value exits on-chain.
        let mut balance = head.balances[asset_idx].clone();
        if matches!(stored.definition, TransferDefinition::Hashlock { .. }) {
            balance.amount[recipient_idx] =
                balance.amount[recipient_idx].checked_add(stored.amount).ok_or_else(|| {
                    EngineError::ProtocolViolation("balance overflow on resolve".into())
                })?;
        }

        let update = ChannelUpdate {
            channel_address,
            from_identifier: self.public_identifier().clone(),
            to_identifier: counterparty.clone(),
            nonce: head.nonce + 1,
            balance,
            asset_id: stored.asset_id,
            details: UpdateDetails::Resolve {
                transfer_id,
                resolver,
                merkle_root,
            },
            signatures: [None, None],
        };
        let (state, transfer) = self.propose(Some(head), update).await?;
        let transfer = transfer.ok_or_else(|| {
            EngineError::ProtocolViolation("resolve update produced no transfer".into())
        })?;
        Ok((state, transfer))
    }

    /// Publish a check-in to every channel counterparty, signalling this
    /// node is reachable again.
    pub async fn announce_alive(&self) -> Result<(), EngineError> {
        for channel in self.store.get_channel_states().await? {
            let my_index = match self.identifier_index(&channel) {
                Some(i) => i,
                None => continue,
            };
            let counterparty = &channel.public_identifiers[1 - my_index];
            let message = IsAliveMessage {
                channel_address: channel.channel_address,
            };
            let payload = serde_json::to_vec(&message)
                .map_err(|e| EngineError::ProtocolViolation(e.to_string()))?;
            let subject = is_alive_subject(counterparty, self.public_identifier());
            if let Err(e) = self.messaging.publish(&subject, payload).await {
                warn!(subject = %subject, error = %e, "check-in publish failed");
            }
        }
        Ok(())
    }

    // ---- proposer internals ----

    fn identifier_index(&self, channel: &ChannelState) -> Option<usize> {
        channel.identifier_index(self.public_identifier())
    }

    async fn lock_role(
        &self,
        channel_address: Address,
    ) -> Result<(bool, PublicIdentifier), EngineError> {
        let head = self
            .store
            .get_channel_state(channel_address)
            .await?
            .ok_or(EngineError::ChannelNotFound(channel_address))?;
        let my_index = self
            .identifier_index(&head)
            .ok_or(EngineError::ChannelNotFound(channel_address))?;
        Ok((my_index == 0, head.public_identifiers[1 - my_index].clone()))
    }

    async fn release_lock(
        &self,
        channel_address: Address,
        secret: &str,
        is_host: bool,
        counterparty: &PublicIdentifier,
    ) {
        if let Err(e) = self
            .lock
            .release(&channel_address.to_string(), secret, is_host, Some(counterparty))
            .await
        {
            warn!(channel = %channel_address, error = %e, "channel lock release failed");
        }
    }

    async fn locked_proposal(
        &self,
        channel_address: Address,
        is_host: bool,
        counterparty: &PublicIdentifier,
        update: ChannelUpdate,
    ) -> Result<(ChannelState, Option<TransferState>), EngineError> {
        let secret = self
            .lock
            .acquire(&channel_address.to_string(), is_host, Some(counterparty))
            .await?;
        let prior = self.store.get_channel_state(channel_address).await?;
        let result = self.propose(prior, update).await;
        self.release_lock(channel_address, &secret, is_host, counterparty).await;
        result
    }

    /// Run the proposer half of an update exchange: validate locally, sign
    /// this node's slot, request a countersignature, verify the reply and
    /// persist the new head. Must be called with the channel lock held.
    async fn propose(
        &self,
        prior: Option<ChannelState>,
        mut update: ChannelUpdate,
    ) -> Result<(ChannelState, Option<TransferState>), EngineError> {
        let active = match &prior {
            Some(p) => self.store.get_active_transfers(p.channel_address).await?,
            None => Vec::new(),
        };
        let (mut next, transfer) = apply_update(prior.as_ref(), &update, &active)?;

        let my_slot = next
            .identifier_index(self.public_identifier())
            .ok_or_else(|| {
                EngineError::ProtocolViolation("proposer is not a channel participant".into())
            })?;
        update.signatures[my_slot] = Some(self.signer.sign_update(&update)?);

        let sent_digest = update_digest(&update)?;
        let subject = protocol_subject(&update.to_identifier, self.public_identifier());
        let payload = serde_json::to_vec(&update)
            .map_err(|e| EngineError::ProtocolViolation(e.to_string()))?;
        debug!(
            channel = %update.channel_address,
            nonce = update.nonce,
            update_type = %update.update_type(),
            "proposing update"
        );
        let reply_bytes = self
            .messaging
            .request(&subject, PROTOCOL_REQUEST_TIMEOUT, payload)
            .await?;
        let reply: ProtocolReply = serde_json::from_slice(&reply_bytes)
            .map_err(|e| EngineError::ProtocolViolation(format!("malformed reply: {e}")))?;

        let countersigned = match reply {
            ProtocolReply::Accepted { update } => update,
            ProtocolReply::Rejected { reason } => {
                return Err(EngineError::CounterpartyRejected(reason))
            }
        };

        // The digest covers everything except signatures; any semantic
        // tampering in the reply shows up here.
        if update_digest(&countersigned)? != sent_digest {
            return Err(EngineError::ReplyMismatch);
        }
        verify_update_signatures(&countersigned, &next.public_identifiers)?;

        next.latest_update = Some(countersigned);
        self.finalize(next.clone(), transfer.clone(), update.from_identifier.clone())
            .await?;
        Ok((next, transfer))
    }

    /// Persist an applied head and emit its event. Shared by the proposer
    /// and responder paths.
    async fn finalize(
        &self,
        next: ChannelState,
        transfer: Option<TransferState>,
        initiator: PublicIdentifier,
    ) -> Result<(), EngineError> {
        self.store
            .save_channel_state(next.clone(), transfer.clone())
            .await?;

        if let Some(transfer) = &transfer {
            self.record_withdrawal_commitment(&next, transfer).await?;
        }

        let update_type = next
            .latest_update
            .as_ref()
            .map(|u| u.update_type())
            .ok_or_else(|| EngineError::ProtocolViolation("finalized head has no update".into()))?;
        info!(
            channel = %next.channel_address,
            nonce = next.nonce,
            update_type = %update_type,
            "update applied"
        );

        let event = match (update_type, transfer) {
            (crate::types::UpdateType::Setup, _) => EngineEvent::ChannelSetup { channel: next },
            (crate::types::UpdateType::Deposit, _) => {
                let asset_id = next
                    .latest_update
                    .as_ref()
                    .map(|u| u.asset_id)
                    .unwrap_or_else(Address::zero);
                EngineEvent::DepositReconciled {
                    channel: next,
                    asset_id,
                    initiator,
                }
            }
            (crate::types::UpdateType::Create, Some(transfer)) => EngineEvent::TransferCreated {
                channel: next,
                transfer,
                initiator,
            },
            (crate::types::UpdateType::Resolve, Some(transfer)) => EngineEvent::TransferResolved {
                channel: next,
                transfer,
                initiator,
            },
            _ => {
                return Err(EngineError::ProtocolViolation(
                    "transfer update finalized without a transfer".into(),
                ))
            }
        };
        self.events.emit(event);
        Ok(())
    }

    /// When a withdraw transfer resolves, store the double-signable
    /// commitment so the withdrawal transaction can be (re)submitted later.
    async fn record_withdrawal_commitment(
        &self,
        channel: &ChannelState,
        transfer: &TransferState,
    ) -> Result<(), EngineError> {
        let signature = match (&transfer.definition, &transfer.resolver) {
            (TransferDefinition::Withdraw { .. }, Some(TransferResolver::WithdrawSignature(sig))) => {
                *sig
            }
            _ => return Ok(()),
        };
        let recipient_idx = channel.participant_index(&transfer.recipient).ok_or_else(|| {
            EngineError::ProtocolViolation("withdrawal recipient is not a participant".into())
        })?;
        let my_idx = self.identifier_index(channel).ok_or_else(|| {
            EngineError::ProtocolViolation("node is not a participant of the channel".into())
        })?;
        let digest = withdrawal_commitment_digest(
            &channel.channel_address,
            &transfer.recipient,
            &transfer.asset_id,
            transfer.amount,
            transfer.channel_nonce,
        );

        let mut signatures = [None, None];
        signatures[recipient_idx] = Some(signature);
        signatures[my_idx] = Some(self.signer.sign_digest(&digest));

        self.store
            .save_withdrawal_commitment(WithdrawalCommitment {
                channel_address: channel.channel_address,
                transfer_id: transfer.transfer_id,
                asset_id: transfer.asset_id,
                amount: transfer.amount,
                recipient: transfer.recipient,
                tx: MinimalTransaction {
                    to: transfer.recipient,
                    value: transfer.amount,
                    data: Vec::new(),
                },
                signatures,
            })
            .await?;
        Ok(())
    }

    // ---- responder internals ----

    async fn handle_protocol_delivery(self: Arc<Self>, delivery: Delivery) {
        let reply_handle = match delivery.reply {
            Some(handle) => handle,
            None => {
                warn!(subject = %delivery.subject, "protocol message without reply handle dropped");
                return;
            }
        };
        let update: ChannelUpdate = match serde_json::from_slice(&delivery.payload) {
            Ok(u) => u,
            Err(e) => {
                warn!(subject = %delivery.subject, error = %e, "malformed update proposal");
                return;
            }
        };

        let reply = match self.handle_proposed_update(update).await {
            Ok(countersigned) => ProtocolReply::Accepted {
                update: countersigned,
            },
            Err(e) => {
                warn!(error = %e, "rejecting proposed update");
                ProtocolReply::Rejected {
                    reason: e.to_string(),
                }
            }
        };
        match serde_json::to_vec(&reply) {
            Ok(bytes) => reply_handle.send(bytes),
            Err(e) => warn!(error = %e, "failed to encode protocol reply"),
        }
    }

    /// Responder half of an update exchange: validate the proposal against
    /// the current head, re-derive the transition, countersign and persist.
    /// Any failure leaves the prior head untouched.
    async fn handle_proposed_update(
        &self,
        update: ChannelUpdate,
    ) -> Result<ChannelUpdate, EngineError> {
        if update.to_identifier != *self.public_identifier() {
            return Err(EngineError::ProtocolViolation(
                "update addressed to a different node".into(),
            ));
        }

        let prior = self.store.get_channel_state(update.channel_address).await?;

        // Idempotent retry: the proposer may have missed our reply. If the
        // proposal matches the already-applied head, re-send that head's
        // fully signed update without re-applying anything.
        if let Some(prior) = &prior {
            if update.nonce == prior.nonce {
                if let Some(applied) = &prior.latest_update {
                    if update_digest(applied)? == update_digest(&update)? {
                        debug!(
                            channel = %update.channel_address,
                            nonce = update.nonce,
                            "duplicate proposal; replaying applied update"
                        );
                        return Ok(applied.clone());
                    }
                }
                return Err(EngineError::InvalidNonce {
                    expected: prior.nonce + 1,
                    got: update.nonce,
                });
            }
        }

        let participants = match &prior {
            Some(p) => p.public_identifiers.clone(),
            // For setup the proposer becomes alice.
            None => [update.from_identifier.clone(), update.to_identifier.clone()],
        };
        let proposer_slot = participants
            .iter()
            .position(|p| p == &update.from_identifier)
            .ok_or_else(|| {
                EngineError::ProtocolViolation("proposer is not a channel participant".into())
            })?;
        verify_update_signature(&update, &participants, proposer_slot)?;

        // A deposit claim is only as good as the chain record behind it;
        // countersigning one unchecked would let the proposer mint funds.
        if let (UpdateDetails::Deposit { deposit_nonce }, Some(prior)) = (&update.details, &prior) {
            self.verify_deposit_claim(prior, &update, proposer_slot, *deposit_nonce).await?;
        }

        let active = match &prior {
            Some(p) => self.store.get_active_transfers(p.channel_address).await?,
            None => Vec::new(),
        };
        let (mut next, transfer) = apply_update(prior.as_ref(), &update, &active)?;

        let my_slot = 1 - proposer_slot;
        let mut countersigned = update.clone();
        countersigned.signatures[my_slot] = Some(self.signer.sign_update(&countersigned)?);
        next.latest_update = Some(countersigned.clone());

        self.finalize(next, transfer, update.from_identifier).await?;
        Ok(countersigned)
    }

    /// Re-derive a proposed deposit from this node's own view of the
    /// chain. The claimed nonce must exist on-chain and the credited delta
    /// must be covered by deposits not yet reconciled into the channel.
    async fn verify_deposit_claim(
        &self,
        prior: &ChannelState,
        update: &ChannelUpdate,
        proposer_slot: usize,
        deposit_nonce: u64,
    ) -> Result<(), EngineError> {
        let record = self
            .chain
            .get_latest_deposit(update.channel_address, prior.network.chain_id, update.asset_id)
            .await?;
        if deposit_nonce > record.nonce {
            return Err(EngineError::ProtocolViolation(format!(
                "deposit nonce {} is ahead of the on-chain record {}",
                deposit_nonce, record.nonce
            )));
        }
        let before = match prior.asset_index(&update.asset_id) {
            Some(i) => prior.balances[i].amount[proposer_slot],
            None => 0,
        };
        let claimed = update.balance.amount[proposer_slot].saturating_sub(before);
        let unreconciled = record
            .total_deposited
            .saturating_sub(prior.reconciled_funds(&update.asset_id));
        if claimed > unreconciled {
            return Err(EngineError::ProtocolViolation(format!(
                "deposit claims {} but the on-chain record backs only {}",
                claimed, unreconciled
            )));
        }
        Ok(())
    }
}
