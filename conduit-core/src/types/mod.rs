// Conduit - Core Data Model
//
// Shared primitive types for the channel protocol: addresses, public
// identifiers, balances and the per-channel network context.

pub mod channel;
pub mod routing;
pub mod transfer;

pub use channel::{ChannelState, ChannelUpdate, UpdateDetails, UpdateType};
pub use routing::{RebalanceProfile, RouterQueueEntry, TransferMeta};
pub use transfer::{
    TransferDefinition, TransferId, TransferResolver, TransferState, WithdrawalCommitment,
};

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 32-byte digest used throughout the protocol (update digests,
/// merkle roots, hashlocks).
pub type Hash32 = [u8; 32];

/// Prefix carried by every public identifier. The remainder of the
/// identifier is the hex encoding of the party's compressed public key,
/// so any node can verify signatures from the identifier alone.
pub const IDENTIFIER_PREFIX: &str = "cndt";

/// Error types for primitive type parsing
#[derive(Debug, Error)]
pub enum TypeError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid public identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid transfer id: {0}")]
    InvalidTransferId(String),
}

/// A 20-byte account or contract address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// The all-zero address, conventionally the native asset id.
    pub fn zero() -> Self {
        Self([0u8; 20])
    }

    /// Derive the address for a public key: the trailing 20 bytes of the
    /// sha256 digest of the compressed key.
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = Sha256::digest(key.serialize());
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[12..32]);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes =
            hex::decode(raw).map_err(|e| TypeError::InvalidAddress(format!("{}: {}", s, e)))?;
        if bytes.len() != 20 {
            return Err(TypeError::InvalidAddress(format!(
                "expected 20 bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

/// Public identifier of a node on the messaging layer.
///
/// Encodes the compressed secp256k1 public key, so the identifier is both
/// a stable messaging address and enough material to verify signatures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicIdentifier(String);

impl PublicIdentifier {
    pub fn from_public_key(key: &PublicKey) -> Self {
        Self(format!("{}{}", IDENTIFIER_PREFIX, hex::encode(key.serialize())))
    }

    /// Recover the public key embedded in the identifier.
    pub fn public_key(&self) -> Result<PublicKey, TypeError> {
        let raw = self
            .0
            .strip_prefix(IDENTIFIER_PREFIX)
            .ok_or_else(|| TypeError::InvalidIdentifier(self.0.clone()))?;
        let bytes =
            hex::decode(raw).map_err(|e| TypeError::InvalidIdentifier(format!("{}", e)))?;
        PublicKey::from_slice(&bytes)
            .map_err(|e| TypeError::InvalidIdentifier(format!("{}", e)))
    }

    /// The on-chain address corresponding to this identifier.
    pub fn address(&self) -> Result<Address, TypeError> {
        Ok(Address::from_public_key(&self.public_key()?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublicIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PublicIdentifier {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Self(s.to_string());
        // Round-trip through the embedded key so malformed identifiers are
        // rejected at the boundary instead of deep inside the engine.
        id.public_key()?;
        Ok(id)
    }
}

/// Off-chain balance of a single asset, one slot per participant.
///
/// Index 0 is alice (the channel's lock host), index 1 is bob, matching
/// `ChannelState::participants`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub to: [Address; 2],
    pub amount: [u64; 2],
}

impl Balance {
    pub fn empty(to: [Address; 2]) -> Self {
        Self { to, amount: [0, 0] }
    }

    /// Sum of both slots. Updates whose totals would overflow are rejected
    /// before they apply, so saturation here only guards reads of
    /// adversarial intermediate values.
    pub fn total(&self) -> u64 {
        self.amount[0].saturating_add(self.amount[1])
    }

    /// Sum of both slots, or `None` when it does not fit a `u64`.
    pub fn checked_total(&self) -> Option<u64> {
        self.amount[0].checked_add(self.amount[1])
    }
}

/// On-chain anchoring parameters agreed at channel setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkContext {
    pub chain_id: u64,
    pub adjudicator: Address,
    pub channel_factory: Address,
    pub mastercopy: Address,
    pub provider_url: String,
}
