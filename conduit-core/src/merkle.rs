// Conduit - Active Transfer Merkle Accumulator
//
// Every create/resolve update commits to the set of active transfers via a
// merkle root over their initial-state hashes. Leaves are ordered by
// transfer id so both parties compute the same root from the same set.

use crate::encoding::{transfer_leaf_hash, EncodingError};
use crate::types::{Hash32, TransferState};
use sha2::{Digest, Sha256};

/// Root committed by a channel with no active transfers.
pub const EMPTY_ROOT: Hash32 = [0u8; 32];

/// Compute the merkle root over a set of active transfers.
///
/// Canonical ordering is by transfer id; an odd node at any level is
/// paired with itself.
pub fn active_transfer_root(transfers: &[TransferState]) -> Result<Hash32, EncodingError> {
    let mut ordered: Vec<&TransferState> = transfers.iter().collect();
    ordered.sort_by_key(|t| t.transfer_id);

    let mut level: Vec<Hash32> = ordered
        .iter()
        .map(|t| transfer_leaf_hash(t))
        .collect::<Result<_, _>>()?;

    if level.is_empty() {
        return Ok(EMPTY_ROOT);
    }

    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            let mut hasher = Sha256::new();
            hasher.update(pair[0]);
            hasher.update(right);
            next.push(hasher.finalize().into());
        }
        level = next;
    }

    Ok(level[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, TransferDefinition, TransferId, TransferMeta};

    fn transfer(seed: u8) -> TransferState {
        TransferState {
            transfer_id: TransferId([seed; 32]),
            channel_address: Address::zero(),
            asset_id: Address::zero(),
            amount: seed as u64,
            recipient: Address::zero(),
            initiator: Address::zero(),
            definition: TransferDefinition::Hashlock { lock_hash: [seed; 32] },
            timeout_secs: 3600,
            channel_nonce: 1,
            resolver: None,
            meta: TransferMeta::default(),
        }
    }

    #[test]
    fn empty_set_has_zero_root() {
        assert_eq!(active_transfer_root(&[]).unwrap(), EMPTY_ROOT);
    }

    #[test]
    fn root_is_insertion_order_independent() {
        let a = transfer(1);
        let b = transfer(2);
        let c = transfer(3);
        let forward = active_transfer_root(&[a.clone(), b.clone(), c.clone()]).unwrap();
        let shuffled = active_transfer_root(&[c, a, b]).unwrap();
        assert_eq!(forward, shuffled);
    }

    #[test]
    fn root_changes_when_set_changes() {
        let a = transfer(1);
        let b = transfer(2);
        let one = active_transfer_root(std::slice::from_ref(&a)).unwrap();
        let two = active_transfer_root(&[a, b]).unwrap();
        assert_ne!(one, two);
        assert_ne!(one, EMPTY_ROOT);
    }

    #[test]
    fn resolver_does_not_affect_root() {
        let mut a = transfer(1);
        let before = active_transfer_root(std::slice::from_ref(&a)).unwrap();
        a.resolver = Some(crate::types::TransferResolver::Preimage([9u8; 32]));
        let after = active_transfer_root(std::slice::from_ref(&a)).unwrap();
        assert_eq!(before, after);
    }
}
