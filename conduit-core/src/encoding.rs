// Conduit - Canonical Encodings
//
// Deterministic byte encodings for everything that gets signed or hashed:
// the channel update digest both parties sign, the deterministic channel
// address, transfer leaf hashes and withdrawal commitment digests.

use crate::types::{Address, ChannelUpdate, Hash32, TransferDefinition, TransferId, TransferState};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("Serialization failed: {0}")]
    Serialize(String),
}

/// Canonical digest of a channel update.
///
/// Covers every state-affecting field except the signature slots, so both
/// parties sign the exact same bytes regardless of which slots are filled.
pub fn update_digest(update: &ChannelUpdate) -> Result<Hash32, EncodingError> {
    let signable = (
        &update.channel_address,
        &update.from_identifier,
        &update.to_identifier,
        update.nonce,
        &update.balance,
        &update.asset_id,
        &update.details,
    );
    let bytes =
        bincode::serialize(&signable).map_err(|e| EncodingError::Serialize(e.to_string()))?;
    Ok(Sha256::digest(&bytes).into())
}

/// Deterministic channel address for an (alice, bob, chain, factory)
/// tuple: the trailing 20 bytes of a sha256 digest over the tuple. Both
/// parties derive the same address independently; a mismatch at setup is a
/// protocol violation.
pub fn channel_address(alice: &Address, bob: &Address, chain_id: u64, factory: &Address) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(alice.as_bytes());
    hasher.update(bob.as_bytes());
    hasher.update(chain_id.to_be_bytes());
    hasher.update(factory.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[12..32]);
    Address(out)
}

/// Hash of a transfer's initial state, used as its merkle leaf. Only the
/// creation-time fields participate; the resolver never does.
pub fn transfer_leaf_hash(transfer: &TransferState) -> Result<Hash32, EncodingError> {
    let initial = (
        &transfer.transfer_id,
        &transfer.channel_address,
        &transfer.asset_id,
        transfer.amount,
        &transfer.recipient,
        &transfer.initiator,
        &transfer.definition,
        transfer.timeout_secs,
        transfer.channel_nonce,
    );
    let bytes =
        bincode::serialize(&initial).map_err(|e| EncodingError::Serialize(e.to_string()))?;
    Ok(Sha256::digest(&bytes).into())
}

/// Deterministic transfer id for a create at a given channel nonce.
///
/// A proposer retrying a create after a lost countersignature reproduces
/// the exact update it sent before, byte for byte, so the responder can
/// recognize the retry as a duplicate of its applied head instead of a
/// conflicting proposal at the same nonce.
pub fn derive_transfer_id(
    channel_address: &Address,
    channel_nonce: u64,
    definition: &TransferDefinition,
) -> Result<TransferId, EncodingError> {
    let definition_bytes =
        bincode::serialize(definition).map_err(|e| EncodingError::Serialize(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(channel_address.as_bytes());
    hasher.update(channel_nonce.to_be_bytes());
    hasher.update(&definition_bytes);
    Ok(TransferId(hasher.finalize().into()))
}

/// Digest a withdrawal commitment's economic content for counter-signing.
pub fn withdrawal_commitment_digest(
    channel_address: &Address,
    recipient: &Address,
    asset_id: &Address,
    amount: u64,
    channel_nonce: u64,
) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(channel_address.as_bytes());
    hasher.update(recipient.as_bytes());
    hasher.update(asset_id.as_bytes());
    hasher.update(amount.to_be_bytes());
    hasher.update(channel_nonce.to_be_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ChannelSigner;
    use crate::types::{Balance, NetworkContext, UpdateDetails};

    fn test_update(nonce: u64) -> ChannelUpdate {
        let alice = ChannelSigner::random();
        let bob = ChannelSigner::random();
        ChannelUpdate {
            channel_address: Address::zero(),
            from_identifier: alice.public_identifier().clone(),
            to_identifier: bob.public_identifier().clone(),
            nonce,
            balance: Balance::empty([alice.address(), bob.address()]),
            asset_id: Address::zero(),
            details: UpdateDetails::Setup {
                timeout_secs: 3600,
                network: NetworkContext {
                    chain_id: 1337,
                    adjudicator: Address::zero(),
                    channel_factory: Address::zero(),
                    mastercopy: Address::zero(),
                    provider_url: String::new(),
                },
            },
            signatures: [None, None],
        }
    }

    #[test]
    fn digest_ignores_signature_slots() {
        let mut update = test_update(1);
        let unsigned = update_digest(&update).unwrap();
        let signer = ChannelSigner::random();
        update.signatures[0] = Some(signer.sign_digest(&unsigned));
        assert_eq!(update_digest(&update).unwrap(), unsigned);
    }

    #[test]
    fn digest_changes_with_content() {
        let a = update_digest(&test_update(1)).unwrap();
        let mut update = test_update(1);
        update.nonce = 2;
        assert_ne!(update_digest(&update).unwrap(), a);
    }

    #[test]
    fn transfer_id_derivation_is_stable() {
        let channel: Address = "0x3333333333333333333333333333333333333333".parse().unwrap();
        let lock = TransferDefinition::Hashlock { lock_hash: [9u8; 32] };
        let a = derive_transfer_id(&channel, 4, &lock).unwrap();
        assert_eq!(a, derive_transfer_id(&channel, 4, &lock).unwrap());
        // Different nonce or condition produces a different id.
        assert_ne!(a, derive_transfer_id(&channel, 5, &lock).unwrap());
        let other = TransferDefinition::Hashlock { lock_hash: [8u8; 32] };
        assert_ne!(a, derive_transfer_id(&channel, 4, &other).unwrap());
    }

    #[test]
    fn channel_address_is_deterministic_and_order_sensitive() {
        let a: Address = "0x1111111111111111111111111111111111111111".parse().unwrap();
        let b: Address = "0x2222222222222222222222222222222222222222".parse().unwrap();
        let f = Address::zero();
        assert_eq!(channel_address(&a, &b, 1337, &f), channel_address(&a, &b, 1337, &f));
        assert_ne!(channel_address(&a, &b, 1337, &f), channel_address(&b, &a, 1337, &f));
        assert_ne!(channel_address(&a, &b, 1337, &f), channel_address(&a, &b, 1, &f));
    }
}
