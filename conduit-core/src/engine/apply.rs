// Conduit - Pure Update Transitions
//
// Validation and application of a channel update against the current head.
// This function is pure and runs on both sides of an exchange: the
// proposer checks its own update before signing, the responder re-derives
// the transition independently and rejects anything that does not match.
// No persisted mutation happens here; all-or-nothing is the caller's
// contract.

use super::EngineError;
use crate::encoding::withdrawal_commitment_digest;
use crate::merkle::active_transfer_root;
use crate::types::{
    Balance, ChannelState, ChannelUpdate, TransferDefinition, TransferResolver, TransferState,
    UpdateDetails,
};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Apply an update to the channel head, yielding the next state and the
/// transfer the update created or resolved, if any.
///
/// `prior` is `None` only for setup. `active_transfers` is the channel's
/// current active set, needed to recompute the merkle commitment.
pub fn apply_update(
    prior: Option<&ChannelState>,
    update: &ChannelUpdate,
    active_transfers: &[TransferState],
) -> Result<(ChannelState, Option<TransferState>), EngineError> {
    match (&update.details, prior) {
        (UpdateDetails::Setup { .. }, None) => apply_setup(update),
        (UpdateDetails::Setup { .. }, Some(prior)) => Err(EngineError::ChannelExists(
            prior.channel_address,
        )),
        (_, None) => Err(EngineError::ChannelNotFound(update.channel_address)),
        (_, Some(prior)) => {
            if update.nonce != prior.nonce + 1 {
                return Err(EngineError::InvalidNonce {
                    expected: prior.nonce + 1,
                    got: update.nonce,
                });
            }
            if update.channel_address != prior.channel_address {
                return Err(EngineError::ProtocolViolation(
                    "update addressed to a different channel".into(),
                ));
            }
            match &update.details {
                UpdateDetails::Deposit { deposit_nonce } => {
                    apply_deposit(prior, update, *deposit_nonce)
                }
                UpdateDetails::Create { .. } => apply_create(prior, update, active_transfers),
                UpdateDetails::Resolve { .. } => apply_resolve(prior, update, active_transfers),
                UpdateDetails::Setup { .. } => unreachable!("setup handled above"),
            }
        }
    }
}

fn proposer_index(prior: &ChannelState, update: &ChannelUpdate) -> Result<usize, EngineError> {
    prior
        .identifier_index(&update.from_identifier)
        .ok_or_else(|| {
            EngineError::ProtocolViolation(format!(
                "proposer {} is not a channel participant",
                update.from_identifier
            ))
        })
}

fn apply_setup(update: &ChannelUpdate) -> Result<(ChannelState, Option<TransferState>), EngineError> {
    let (timeout_secs, network) = match &update.details {
        UpdateDetails::Setup { timeout_secs, network } => (*timeout_secs, network.clone()),
        _ => unreachable!(),
    };
    if update.nonce != 1 {
        return Err(EngineError::InvalidNonce {
            expected: 1,
            got: update.nonce,
        });
    }

    // The proposer of a setup becomes alice, the channel's lock host.
    let alice = update
        .from_identifier
        .address()
        .map_err(|e| EngineError::ProtocolViolation(e.to_string()))?;
    let bob = update
        .to_identifier
        .address()
        .map_err(|e| EngineError::ProtocolViolation(e.to_string()))?;
    if alice == bob {
        return Err(EngineError::ProtocolViolation(
            "channel participants must differ".into(),
        ));
    }

    let expected = crate::encoding::channel_address(
        &alice,
        &bob,
        network.chain_id,
        &network.channel_factory,
    );
    if update.channel_address != expected {
        return Err(EngineError::SetupFailed(format!(
            "deterministic channel address mismatch: expected {}, got {}",
            expected, update.channel_address
        )));
    }

    if update.balance.amount != [0, 0] {
        return Err(EngineError::ProtocolViolation(
            "setup update must carry an empty balance".into(),
        ));
    }

    let state = ChannelState {
        channel_address: expected,
        participants: [alice, bob],
        public_identifiers: [update.from_identifier.clone(), update.to_identifier.clone()],
        network,
        asset_ids: Vec::new(),
        balances: Vec::new(),
        locked_value: Vec::new(),
        nonce: 1,
        latest_deposit_nonces: Vec::new(),
        withdrawn: Vec::new(),
        merkle_root: crate::merkle::EMPTY_ROOT,
        latest_update: Some(update.clone()),
        timeout_secs,
    };
    Ok((state, None))
}

fn apply_deposit(
    prior: &ChannelState,
    update: &ChannelUpdate,
    deposit_nonce: u64,
) -> Result<(ChannelState, Option<TransferState>), EngineError> {
    // Deposit records live per (channel, asset); each asset advances its
    // own nonce.
    if deposit_nonce <= prior.latest_deposit_nonce(&update.asset_id) {
        return Err(EngineError::ProtocolViolation(format!(
            "deposit nonce {} does not advance past {} for asset {}",
            deposit_nonce,
            prior.latest_deposit_nonce(&update.asset_id),
            update.asset_id
        )));
    }
    let proposer = proposer_index(prior, update)?;
    if update.balance.to != prior.participants {
        return Err(EngineError::ProtocolViolation(
            "deposit balance recipients must match channel participants".into(),
        ));
    }

    let mut next = prior.clone();
    let asset_idx = match next.asset_index(&update.asset_id) {
        Some(i) => i,
        None => {
            next.asset_ids.push(update.asset_id);
            next.balances.push(Balance::empty(prior.participants));
            next.locked_value.push(0);
            next.latest_deposit_nonces.push(0);
            next.withdrawn.push(0);
            next.asset_ids.len() - 1
        }
    };

    let before = next.balances[asset_idx].clone();
    let counterparty = 1 - proposer;
    if update.balance.amount[counterparty] != before.amount[counterparty] {
        return Err(EngineError::ProtocolViolation(
            "deposit update may only credit the reconciling party".into(),
        ));
    }
    if update.balance.amount[proposer] <= before.amount[proposer] {
        return Err(EngineError::ProtocolViolation(
            "deposit update must credit a positive delta".into(),
        ));
    }
    // Deposits are the only way value enters a channel, so gating the
    // asset total here keeps every later balance addition in range.
    update
        .balance
        .checked_total()
        .and_then(|t| t.checked_add(next.locked_value[asset_idx]))
        .ok_or_else(|| {
            EngineError::ProtocolViolation("deposit overflows the asset total".into())
        })?;

    next.balances[asset_idx] = update.balance.clone();
    next.latest_deposit_nonces[asset_idx] = deposit_nonce;
    next.nonce = update.nonce;
    next.latest_update = Some(update.clone());
    Ok((next, None))
}

fn apply_create(
    prior: &ChannelState,
    update: &ChannelUpdate,
    active_transfers: &[TransferState],
) -> Result<(ChannelState, Option<TransferState>), EngineError> {
    let (transfer_id, definition, amount, recipient, transfer_timeout_secs, merkle_root, meta) =
        match &update.details {
            UpdateDetails::Create {
                transfer_id,
                definition,
                amount,
                recipient,
                transfer_timeout_secs,
                merkle_root,
                meta,
            } => (
                *transfer_id,
                definition.clone(),
                *amount,
                *recipient,
                *transfer_timeout_secs,
                *merkle_root,
                meta.clone(),
            ),
            _ => unreachable!(),
        };

    if amount == 0 {
        return Err(EngineError::InvalidAmount(amount));
    }
    let proposer = proposer_index(prior, update)?;
    let asset_idx = prior
        .asset_index(&update.asset_id)
        .ok_or(EngineError::AssetNotFound(update.asset_id))?;
    if prior.participant_index(&recipient).is_none() {
        return Err(EngineError::ProtocolViolation(
            "transfer recipient is not a channel participant".into(),
        ));
    }
    if active_transfers.iter().any(|t| t.transfer_id == transfer_id) {
        return Err(EngineError::ProtocolViolation(format!(
            "transfer {} already active",
            transfer_id
        )));
    }

    let before = &prior.balances[asset_idx];
    let available = before.amount[proposer];
    if available < amount {
        return Err(EngineError::InsufficientBalance {
            required: amount,
            available,
        });
    }

    // The declared post-update balance must move exactly `amount` out of
    // the proposer's slot and nothing else.
    let mut expected = before.clone();
    expected.amount[proposer] -= amount;
    if update.balance != expected {
        return Err(EngineError::ProtocolViolation(
            "create update balance does not match the declared delta".into(),
        ));
    }

    let transfer = TransferState {
        transfer_id,
        channel_address: prior.channel_address,
        asset_id: update.asset_id,
        amount,
        recipient,
        initiator: prior.participants[proposer],
        definition,
        timeout_secs: transfer_timeout_secs,
        channel_nonce: update.nonce,
        resolver: None,
        meta,
    };

    let mut with_new: Vec<TransferState> = active_transfers.to_vec();
    with_new.push(transfer.clone());
    let expected_root = active_transfer_root(&with_new)?;
    if merkle_root != expected_root {
        return Err(EngineError::ProtocolViolation(
            "create update merkle root does not commit to the active set".into(),
        ));
    }

    let mut next = prior.clone();
    next.balances[asset_idx] = update.balance.clone();
    next.locked_value[asset_idx] = next.locked_value[asset_idx]
        .checked_add(amount)
        .ok_or_else(|| EngineError::ProtocolViolation("locked value overflow on create".into()))?;
    next.merkle_root = expected_root;
    next.nonce = update.nonce;
    next.latest_update = Some(update.clone());
    Ok((next, Some(transfer)))
}

fn apply_resolve(
    prior: &ChannelState,
    update: &ChannelUpdate,
    active_transfers: &[TransferState],
) -> Result<(ChannelState, Option<TransferState>), EngineError> {
    let (transfer_id, resolver, merkle_root) = match &update.details {
        UpdateDetails::Resolve {
            transfer_id,
            resolver,
            merkle_root,
        } => (*transfer_id, resolver.clone(), *merkle_root),
        _ => unreachable!(),
    };

    proposer_index(prior, update)?;
    let transfer = active_transfers
        .iter()
        .find(|t| t.transfer_id == transfer_id)
        .ok_or(EngineError::TransferNotFound(transfer_id))?;
    if update.asset_id != transfer.asset_id {
        return Err(EngineError::ProtocolViolation(
            "resolve update asset does not match the transfer".into(),
        ));
    }

    validate_resolver(prior, transfer, &resolver)?;

    let asset_idx = prior
        .asset_index(&transfer.asset_id)
        .ok_or(EngineError::AssetNotFound(transfer.asset_id))?;
    let recipient_idx = prior
        .participant_index(&transfer.recipient)
        .ok_or_else(|| EngineError::ProtocolViolation("transfer recipient left channel".into()))?;

    if prior.locked_value[asset_idx] < transfer.amount {
        return Err(EngineError::ProtocolViolation(
            "locked value underflow on resolve".into(),
        ));
    }

    // A hashlock resolution credits the recipient off-chain. A withdraw
    // resolution does not: the value leaves the channel through the
    // on-chain withdrawal transaction instead.
    let credits_recipient = matches!(transfer.definition, TransferDefinition::Hashlock { .. });
    let mut expected = prior.balances[asset_idx].clone();
    if credits_recipient {
        expected.amount[recipient_idx] = expected.amount[recipient_idx]
            .checked_add(transfer.amount)
            .ok_or_else(|| {
                EngineError::ProtocolViolation("balance overflow on resolve".into())
            })?;
    }
    if update.balance != expected {
        return Err(EngineError::ProtocolViolation(
            "resolve update balance does not match the transfer outcome".into(),
        ));
    }

    let remaining: Vec<TransferState> = active_transfers
        .iter()
        .filter(|t| t.transfer_id != transfer_id)
        .cloned()
        .collect();
    let expected_root = active_transfer_root(&remaining)?;
    if merkle_root != expected_root {
        return Err(EngineError::ProtocolViolation(
            "resolve update merkle root does not commit to the remaining set".into(),
        ));
    }

    let mut resolved = transfer.clone();
    resolved.resolver = Some(resolver);

    let mut next = prior.clone();
    next.balances[asset_idx] = update.balance.clone();
    next.locked_value[asset_idx] -= transfer.amount;
    if !credits_recipient {
        next.withdrawn[asset_idx] = next.withdrawn[asset_idx]
            .checked_add(transfer.amount)
            .ok_or_else(|| {
                EngineError::ProtocolViolation("withdrawn total overflow on resolve".into())
            })?;
    }
    next.merkle_root = expected_root;
    next.nonce = update.nonce;
    next.latest_update = Some(update.clone());
    Ok((next, Some(resolved)))
}

/// Check that a resolver satisfies its transfer's condition.
fn validate_resolver(
    prior: &ChannelState,
    transfer: &TransferState,
    resolver: &TransferResolver,
) -> Result<(), EngineError> {
    match (&transfer.definition, resolver) {
        (TransferDefinition::Hashlock { lock_hash }, TransferResolver::Preimage(preimage)) => {
            let hashed: [u8; 32] = Sha256::digest(preimage).into();
            if hashed.ct_eq(lock_hash).into() {
                Ok(())
            } else {
                Err(EngineError::ResolverInvalid(
                    "preimage does not hash to the lock".into(),
                ))
            }
        }
        (
            TransferDefinition::Withdraw { commitment },
            TransferResolver::WithdrawSignature(signature),
        ) => {
            let recipient_idx = prior
                .participant_index(&transfer.recipient)
                .ok_or_else(|| EngineError::ResolverInvalid("unknown recipient".into()))?;
            let expected = withdrawal_commitment_digest(
                &transfer.channel_address,
                &transfer.recipient,
                &transfer.asset_id,
                transfer.amount,
                transfer.channel_nonce,
            );
            if expected != *commitment {
                return Err(EngineError::ResolverInvalid(
                    "withdrawal commitment digest mismatch".into(),
                ));
            }
            crate::crypto::verify_digest(
                &prior.public_identifiers[recipient_idx],
                commitment,
                signature,
            )
            .map_err(|_| {
                EngineError::ResolverInvalid("withdrawal signature does not verify".into())
            })
        }
        _ => Err(EngineError::ResolverInvalid(
            "resolver type does not match the transfer condition".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ChannelSigner;
    use crate::types::{Address, NetworkContext, PublicIdentifier, TransferId, TransferMeta};

    struct Fixture {
        alice: ChannelSigner,
        bob: ChannelSigner,
        network: NetworkContext,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                alice: ChannelSigner::random(),
                bob: ChannelSigner::random(),
                network: NetworkContext {
                    chain_id: 1337,
                    adjudicator: Address::zero(),
                    channel_factory: Address::zero(),
                    mastercopy: Address::zero(),
                    provider_url: String::new(),
                },
            }
        }

        fn ids(&self) -> (PublicIdentifier, PublicIdentifier) {
            (
                self.alice.public_identifier().clone(),
                self.bob.public_identifier().clone(),
            )
        }

        fn setup_update(&self) -> ChannelUpdate {
            let (alice_id, bob_id) = self.ids();
            let channel = crate::encoding::channel_address(
                &self.alice.address(),
                &self.bob.address(),
                self.network.chain_id,
                &self.network.channel_factory,
            );
            ChannelUpdate {
                channel_address: channel,
                from_identifier: alice_id,
                to_identifier: bob_id,
                nonce: 1,
                balance: Balance::empty([self.alice.address(), self.bob.address()]),
                asset_id: Address::zero(),
                details: UpdateDetails::Setup {
                    timeout_secs: 3600,
                    network: self.network.clone(),
                },
                signatures: [None, None],
            }
        }

        fn setup_state(&self) -> ChannelState {
            apply_update(None, &self.setup_update(), &[]).unwrap().0
        }

        fn deposit_update(&self, prior: &ChannelState, amount: u64) -> ChannelUpdate {
            let (alice_id, bob_id) = self.ids();
            let mut balance = Balance::empty(prior.participants);
            balance.amount[0] = amount;
            ChannelUpdate {
                channel_address: prior.channel_address,
                from_identifier: alice_id,
                to_identifier: bob_id,
                nonce: prior.nonce + 1,
                balance,
                asset_id: Address::zero(),
                details: UpdateDetails::Deposit { deposit_nonce: 1 },
                signatures: [None, None],
            }
        }
    }

    #[test]
    fn setup_produces_fresh_channel() {
        let fx = Fixture::new();
        let (state, transfer) = apply_update(None, &fx.setup_update(), &[]).unwrap();
        assert!(transfer.is_none());
        assert_eq!(state.nonce, 1);
        assert!(state.asset_ids.is_empty());
        assert_eq!(state.participants, [fx.alice.address(), fx.bob.address()]);
        assert_eq!(state.merkle_root, crate::merkle::EMPTY_ROOT);
    }

    #[test]
    fn setup_rejects_wrong_channel_address() {
        let fx = Fixture::new();
        let mut update = fx.setup_update();
        update.channel_address = Address::zero();
        assert!(matches!(
            apply_update(None, &update, &[]),
            Err(EngineError::SetupFailed(_))
        ));
    }

    #[test]
    fn nonce_gaps_are_rejected() {
        let fx = Fixture::new();
        let state = fx.setup_state();
        let mut update = fx.deposit_update(&state, 100);
        update.nonce = state.nonce + 2;
        assert!(matches!(
            apply_update(Some(&state), &update, &[]),
            Err(EngineError::InvalidNonce { expected: 2, got: 3 })
        ));
        let mut update = fx.deposit_update(&state, 100);
        update.nonce = state.nonce;
        assert!(matches!(
            apply_update(Some(&state), &update, &[]),
            Err(EngineError::InvalidNonce { .. })
        ));
    }

    #[test]
    fn deposit_credits_only_the_proposer() {
        let fx = Fixture::new();
        let state = fx.setup_state();
        let update = fx.deposit_update(&state, 100);
        let (next, _) = apply_update(Some(&state), &update, &[]).unwrap();
        assert_eq!(next.balances[0].amount, [100, 0]);
        assert_eq!(next.latest_deposit_nonce(&Address::zero()), 1);
        assert_eq!(next.nonce, 2);

        // A deposit touching the counterparty slot is a violation.
        let mut bad = fx.deposit_update(&state, 100);
        bad.balance.amount[1] = 5;
        assert!(matches!(
            apply_update(Some(&state), &bad, &[]),
            Err(EngineError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn deposit_nonces_advance_per_asset() {
        let fx = Fixture::new();
        let funded = funded_state(&fx);
        assert_eq!(funded.latest_deposit_nonce(&Address::zero()), 1);

        // A second asset's first deposit also carries record nonce 1; the
        // base asset's nonce must not shadow it.
        let other: Address = "0x1111111111111111111111111111111111111111".parse().unwrap();
        let mut update = fx.deposit_update(&funded, 77);
        update.asset_id = other;
        update.balance.amount = [77, 0];
        let (next, _) = apply_update(Some(&funded), &update, &[]).unwrap();
        assert_eq!(next.total_offchain(&other), 77);
        assert_eq!(next.total_offchain(&Address::zero()), 100);
        assert_eq!(next.latest_deposit_nonce(&other), 1);

        // Replaying the same record nonce for the same asset is rejected.
        let mut replay = fx.deposit_update(&next, 200);
        assert!(matches!(
            apply_update(Some(&next), &replay, &[]),
            Err(EngineError::ProtocolViolation(_))
        ));
        replay.details = UpdateDetails::Deposit { deposit_nonce: 2 };
        replay.balance.amount = [200, 0];
        assert!(apply_update(Some(&next), &replay, &[]).is_ok());
    }

    #[test]
    fn overflowing_deposit_total_is_rejected() {
        let fx = Fixture::new();
        let funded = funded_state(&fx);
        let (alice_id, bob_id) = fx.ids();

        let mut balance = funded.balances[0].clone();
        balance.amount[1] = u64::MAX;
        let update = ChannelUpdate {
            channel_address: funded.channel_address,
            from_identifier: bob_id,
            to_identifier: alice_id,
            nonce: funded.nonce + 1,
            balance,
            asset_id: Address::zero(),
            details: UpdateDetails::Deposit { deposit_nonce: 2 },
            signatures: [None, None],
        };
        assert!(matches!(
            apply_update(Some(&funded), &update, &[]),
            Err(EngineError::ProtocolViolation(_))
        ));
    }

    fn funded_state(fx: &Fixture) -> ChannelState {
        let state = fx.setup_state();
        let update = fx.deposit_update(&state, 100);
        apply_update(Some(&state), &update, &[]).unwrap().0
    }

    fn create_update(
        fx: &Fixture,
        prior: &ChannelState,
        amount: u64,
        lock_hash: [u8; 32],
    ) -> (ChannelUpdate, TransferId) {
        let (alice_id, bob_id) = fx.ids();
        let transfer_id = TransferId::new_random();
        let mut balance = prior.balances[0].clone();
        balance.amount[0] -= amount;
        let candidate = TransferState {
            transfer_id,
            channel_address: prior.channel_address,
            asset_id: Address::zero(),
            amount,
            recipient: fx.bob.address(),
            initiator: fx.alice.address(),
            definition: TransferDefinition::Hashlock { lock_hash },
            timeout_secs: 3600,
            channel_nonce: prior.nonce + 1,
            resolver: None,
            meta: TransferMeta::default(),
        };
        let root = active_transfer_root(std::slice::from_ref(&candidate)).unwrap();
        let update = ChannelUpdate {
            channel_address: prior.channel_address,
            from_identifier: alice_id,
            to_identifier: bob_id,
            nonce: prior.nonce + 1,
            balance,
            asset_id: Address::zero(),
            details: UpdateDetails::Create {
                transfer_id,
                definition: TransferDefinition::Hashlock { lock_hash },
                amount,
                recipient: fx.bob.address(),
                transfer_timeout_secs: 3600,
                merkle_root: root,
                meta: TransferMeta::default(),
            },
            signatures: [None, None],
        };
        (update, transfer_id)
    }

    #[test]
    fn create_then_resolve_conserves_balance() {
        let fx = Fixture::new();
        let funded = funded_state(&fx);
        let preimage = [7u8; 32];
        let lock_hash: [u8; 32] = Sha256::digest(preimage).into();

        let (create, _) = create_update(&fx, &funded, 7, lock_hash);
        let (after_create, transfer) = apply_update(Some(&funded), &create, &[]).unwrap();
        let transfer = transfer.unwrap();
        assert_eq!(after_create.balances[0].amount, [93, 0]);
        assert_eq!(after_create.locked_value[0], 7);
        assert_eq!(after_create.total_offchain(&Address::zero()), 100);

        let (alice_id, bob_id) = fx.ids();
        let mut balance = after_create.balances[0].clone();
        balance.amount[1] += 7;
        let resolve = ChannelUpdate {
            channel_address: funded.channel_address,
            from_identifier: bob_id,
            to_identifier: alice_id,
            nonce: after_create.nonce + 1,
            balance,
            asset_id: Address::zero(),
            details: UpdateDetails::Resolve {
                transfer_id: transfer.transfer_id,
                resolver: TransferResolver::Preimage(preimage),
                merkle_root: crate::merkle::EMPTY_ROOT,
            },
            signatures: [None, None],
        };
        let (after_resolve, resolved) =
            apply_update(Some(&after_create), &resolve, std::slice::from_ref(&transfer)).unwrap();
        assert_eq!(after_resolve.balances[0].amount, [93, 7]);
        assert_eq!(after_resolve.locked_value[0], 0);
        assert_eq!(after_resolve.total_offchain(&Address::zero()), 100);
        assert!(resolved.unwrap().resolver.is_some());
    }

    #[test]
    fn create_rejects_overdraft_and_zero_amount() {
        let fx = Fixture::new();
        let funded = funded_state(&fx);
        let (mut update, _) = create_update(&fx, &funded, 7, [1u8; 32]);
        if let UpdateDetails::Create { amount, .. } = &mut update.details {
            *amount = 0;
        }
        assert!(matches!(
            apply_update(Some(&funded), &update, &[]),
            Err(EngineError::InvalidAmount(0))
        ));

        // More than the proposer's whole balance.
        let mut balance = funded.balances[0].clone();
        balance.amount[0] = 0;
        let (mut update, _) = create_update(&fx, &funded, 100, [1u8; 32]);
        update.balance = balance;
        if let UpdateDetails::Create { amount, .. } = &mut update.details {
            *amount = 101;
        }
        assert!(matches!(
            apply_update(Some(&funded), &update, &[]),
            Err(EngineError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn resolve_rejects_bad_preimage() {
        let fx = Fixture::new();
        let funded = funded_state(&fx);
        let lock_hash: [u8; 32] = Sha256::digest([7u8; 32]).into();
        let (create, _) = create_update(&fx, &funded, 7, lock_hash);
        let (after_create, transfer) = apply_update(Some(&funded), &create, &[]).unwrap();
        let transfer = transfer.unwrap();

        let (alice_id, bob_id) = fx.ids();
        let mut balance = after_create.balances[0].clone();
        balance.amount[1] += 7;
        let resolve = ChannelUpdate {
            channel_address: funded.channel_address,
            from_identifier: bob_id,
            to_identifier: alice_id,
            nonce: after_create.nonce + 1,
            balance,
            asset_id: Address::zero(),
            details: UpdateDetails::Resolve {
                transfer_id: transfer.transfer_id,
                resolver: TransferResolver::Preimage([8u8; 32]),
                merkle_root: crate::merkle::EMPTY_ROOT,
            },
            signatures: [None, None],
        };
        assert!(matches!(
            apply_update(Some(&after_create), &resolve, std::slice::from_ref(&transfer)),
            Err(EngineError::ResolverInvalid(_))
        ));
    }

    #[test]
    fn withdraw_transfer_resolves_with_recipient_signature() {
        let fx = Fixture::new();
        let funded = funded_state(&fx);
        let (alice_id, bob_id) = fx.ids();

        let transfer_id = TransferId::new_random();
        let commitment = withdrawal_commitment_digest(
            &funded.channel_address,
            &fx.bob.address(),
            &Address::zero(),
            10,
            funded.nonce + 1,
        );
        let mut balance = funded.balances[0].clone();
        balance.amount[0] -= 10;
        let candidate = TransferState {
            transfer_id,
            channel_address: funded.channel_address,
            asset_id: Address::zero(),
            amount: 10,
            recipient: fx.bob.address(),
            initiator: fx.alice.address(),
            definition: TransferDefinition::Withdraw { commitment },
            timeout_secs: 3600,
            channel_nonce: funded.nonce + 1,
            resolver: None,
            meta: TransferMeta::default(),
        };
        let root = active_transfer_root(std::slice::from_ref(&candidate)).unwrap();
        let create = ChannelUpdate {
            channel_address: funded.channel_address,
            from_identifier: alice_id.clone(),
            to_identifier: bob_id.clone(),
            nonce: funded.nonce + 1,
            balance,
            asset_id: Address::zero(),
            details: UpdateDetails::Create {
                transfer_id,
                definition: TransferDefinition::Withdraw { commitment },
                amount: 10,
                recipient: fx.bob.address(),
                transfer_timeout_secs: 3600,
                merkle_root: root,
                meta: TransferMeta::default(),
            },
            signatures: [None, None],
        };
        let (after_create, transfer) = apply_update(Some(&funded), &create, &[]).unwrap();
        let transfer = transfer.unwrap();

        // A withdraw resolution burns the locked value off-chain; the
        // funds leave through the on-chain withdrawal transaction.
        let balance = after_create.balances[0].clone();
        let resolve = ChannelUpdate {
            channel_address: funded.channel_address,
            from_identifier: bob_id,
            to_identifier: alice_id,
            nonce: after_create.nonce + 1,
            balance,
            asset_id: Address::zero(),
            details: UpdateDetails::Resolve {
                transfer_id,
                resolver: TransferResolver::WithdrawSignature(fx.bob.sign_digest(&commitment)),
                merkle_root: crate::merkle::EMPTY_ROOT,
            },
            signatures: [None, None],
        };
        let (after_resolve, _) =
            apply_update(Some(&after_create), &resolve, std::slice::from_ref(&transfer)).unwrap();
        assert_eq!(after_resolve.balances[0].amount, [90, 0]);
        assert_eq!(after_resolve.locked_value[0], 0);
        assert_eq!(after_resolve.withdrawn[0], 10);
        assert_eq!(after_resolve.total_offchain(&Address::zero()), 90);
        assert_eq!(after_resolve.reconciled_funds(&Address::zero()), 100);

        // A signature from the wrong party must not resolve it.
        let mut bad = resolve;
        bad.details = UpdateDetails::Resolve {
            transfer_id,
            resolver: TransferResolver::WithdrawSignature(fx.alice.sign_digest(&commitment)),
            merkle_root: crate::merkle::EMPTY_ROOT,
        };
        assert!(matches!(
            apply_update(Some(&after_create), &bad, std::slice::from_ref(&transfer)),
            Err(EngineError::ResolverInvalid(_))
        ));
    }
}
