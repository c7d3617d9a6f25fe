// Conduit - Channel State and Update Envelopes
//
// The durable per-channel record and the co-signed update envelope that
// transitions it. A channel is never deleted, only superseded by the next
// two-signed update.

use super::routing::TransferMeta;
use super::transfer::{TransferDefinition, TransferId, TransferResolver};
use super::{Address, Balance, Hash32, NetworkContext, PublicIdentifier};
use secp256k1::ecdsa::Signature;
use serde::{Deserialize, Serialize};

/// Kind of a channel update. Derived from the typed details payload; kept
/// as a separate enum for logging and store queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateType {
    Setup,
    Deposit,
    Create,
    Resolve,
}

impl std::fmt::Display for UpdateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdateType::Setup => "setup",
            UpdateType::Deposit => "deposit",
            UpdateType::Create => "create",
            UpdateType::Resolve => "resolve",
        };
        f.write_str(s)
    }
}

/// Type-specific payload of a channel update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateDetails {
    /// First update of a channel: establishes participants and parameters.
    Setup {
        timeout_secs: u64,
        network: NetworkContext,
    },
    /// Reconciles an on-chain deposit into off-chain balances.
    Deposit {
        /// On-chain deposit nonce this update reconciles up to.
        deposit_nonce: u64,
    },
    /// Locks funds under a condition as a new transfer.
    Create {
        transfer_id: TransferId,
        definition: TransferDefinition,
        amount: u64,
        recipient: Address,
        transfer_timeout_secs: u64,
        merkle_root: Hash32,
        meta: TransferMeta,
    },
    /// Resolves an active transfer with satisfying data.
    Resolve {
        transfer_id: TransferId,
        resolver: TransferResolver,
        merkle_root: Hash32,
    },
}

impl UpdateDetails {
    pub fn update_type(&self) -> UpdateType {
        match self {
            UpdateDetails::Setup { .. } => UpdateType::Setup,
            UpdateDetails::Deposit { .. } => UpdateType::Deposit,
            UpdateDetails::Create { .. } => UpdateType::Create,
            UpdateDetails::Resolve { .. } => UpdateType::Resolve,
        }
    }
}

/// The signed envelope exchanged between participants to transition a
/// channel. An update with both signature slots filled is "applied";
/// with one it is merely "pending" and not part of channel state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelUpdate {
    pub channel_address: Address,
    pub from_identifier: PublicIdentifier,
    pub to_identifier: PublicIdentifier,
    /// Proposed new nonce, always exactly the current channel nonce + 1.
    pub nonce: u64,
    /// Post-update balance for `asset_id`.
    pub balance: Balance,
    pub asset_id: Address,
    pub details: UpdateDetails,
    /// [alice signature, bob signature] over the canonical update digest.
    pub signatures: [Option<Signature>; 2],
}

impl ChannelUpdate {
    pub fn update_type(&self) -> UpdateType {
        self.details.update_type()
    }

    pub fn is_fully_signed(&self) -> bool {
        self.signatures.iter().all(|s| s.is_some())
    }
}

/// Durable state of a single channel, keyed by its deterministic address.
///
/// Invariants maintained by the protocol engine:
/// - `nonce` equals `latest_update.nonce`; a fresh channel has nonce 0.
/// - for every asset index `i`:
///   `balances[i].total() + locked_value[i] + withdrawn[i]` equals the
///   reconciled on-chain deposits for that asset.
/// - `locked_value[i]` equals the sum of active transfer amounts for
///   `asset_ids[i]`.
/// - `merkle_root` commits to the active transfer set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub channel_address: Address,
    /// Ordered pair [alice, bob]; alice hosts the channel lock.
    pub participants: [Address; 2],
    pub public_identifiers: [PublicIdentifier; 2],
    pub network: NetworkContext,
    /// Insertion order correlates indices with the other per-asset vectors.
    pub asset_ids: Vec<Address>,
    pub balances: Vec<Balance>,
    pub locked_value: Vec<u64>,
    pub nonce: u64,
    /// Highest reconciled on-chain deposit nonce, per asset. On-chain
    /// deposit records are kept per (channel, asset), so each asset
    /// advances its own nonce.
    pub latest_deposit_nonces: Vec<u64>,
    /// Cumulative value withdrawn back on-chain, per asset.
    pub withdrawn: Vec<u64>,
    pub merkle_root: Hash32,
    pub latest_update: Option<ChannelUpdate>,
    /// Dispute timeout window agreed at setup, in seconds.
    pub timeout_secs: u64,
}

impl ChannelState {
    pub fn alice(&self) -> Address {
        self.participants[0]
    }

    pub fn bob(&self) -> Address {
        self.participants[1]
    }

    /// Index of a participant address, if it is one of the two parties.
    pub fn participant_index(&self, address: &Address) -> Option<usize> {
        self.participants.iter().position(|p| p == address)
    }

    /// Index of a participant by public identifier.
    pub fn identifier_index(&self, identifier: &PublicIdentifier) -> Option<usize> {
        self.public_identifiers.iter().position(|p| p == identifier)
    }

    /// Index of an asset in the tracked set.
    pub fn asset_index(&self, asset_id: &Address) -> Option<usize> {
        self.asset_ids.iter().position(|a| a == asset_id)
    }

    /// Off-chain balance a participant can still commit to new transfers.
    /// Locked value is already excluded: it was moved out of the balance
    /// slots when the corresponding transfers were created.
    pub fn available_balance(&self, asset_id: &Address, participant_idx: usize) -> u64 {
        match self.asset_index(asset_id) {
            Some(i) => self.balances[i].amount[participant_idx],
            None => 0,
        }
    }

    /// Total off-chain value tracked for an asset: both balances plus the
    /// value locked in active transfers.
    pub fn total_offchain(&self, asset_id: &Address) -> u64 {
        match self.asset_index(asset_id) {
            Some(i) => self.balances[i].total().saturating_add(self.locked_value[i]),
            None => 0,
        }
    }

    /// Highest on-chain deposit nonce reconciled for an asset; zero when
    /// the asset has never been deposited.
    pub fn latest_deposit_nonce(&self, asset_id: &Address) -> u64 {
        match self.asset_index(asset_id) {
            Some(i) => self.latest_deposit_nonces[i],
            None => 0,
        }
    }

    /// Everything ever reconciled into the channel for an asset: the live
    /// off-chain value plus what has since been withdrawn back on-chain.
    /// Equals the cumulative on-chain deposits once reconciliation has
    /// caught up.
    pub fn reconciled_funds(&self, asset_id: &Address) -> u64 {
        match self.asset_index(asset_id) {
            Some(i) => self.balances[i]
                .total()
                .saturating_add(self.locked_value[i])
                .saturating_add(self.withdrawn[i]),
            None => 0,
        }
    }
}
