// Router forwarding tests: sender -> router -> receiver payments across
// two channels, including collateralization, store-and-forward delivery
// for offline recipients, and the serialized deposit + create pair.

use conduit_core::chain::{ChainReader, MockChainService};
use conduit_core::crypto::ChannelSigner;
use conduit_core::encoding;
use conduit_core::engine::{CreateTransferParams, Engine};
use conduit_core::lock::{LockService, DEFAULT_LOCK_TTL};
use conduit_core::messaging::InMemoryMessaging;
use conduit_core::router::{IdentitySwap, Router};
use conduit_core::store::{MemoryStore, RouterStore, Store};
use conduit_core::types::{
    Address, ChannelState, NetworkContext, RebalanceProfile, TransferDefinition, TransferMeta,
    TransferResolver,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Node {
    engine: Arc<Engine>,
    store: Arc<MemoryStore>,
}

async fn spawn_node(
    bus: Arc<InMemoryMessaging>,
    chain: Arc<MockChainService>,
    start: bool,
) -> Node {
    let signer = ChannelSigner::random();
    let store = Arc::new(MemoryStore::new());
    let lock = LockService::new(
        signer.public_identifier().clone(),
        bus.clone(),
        DEFAULT_LOCK_TTL,
    );
    lock.serve().await.unwrap();
    let engine = Engine::new(signer, store.clone(), bus, lock, chain);
    if start {
        engine.start().await.unwrap();
    }
    Node { engine, store }
}

struct Harness {
    chain: Arc<MockChainService>,
    sender: Node,
    router_node: Node,
    receiver: Node,
    router: Arc<Router>,
}

async fn harness(receiver_online: bool) -> Harness {
    harness_with(receiver_online, RebalanceProfile::default()).await
}

async fn harness_with(receiver_online: bool, rebalance: RebalanceProfile) -> Harness {
    let bus = InMemoryMessaging::new();
    let chain = Arc::new(MockChainService::new());
    let sender = spawn_node(bus.clone(), chain.clone(), true).await;
    let router_node = spawn_node(bus.clone(), chain.clone(), true).await;
    let receiver = spawn_node(bus.clone(), chain.clone(), receiver_online).await;

    let router = Router::new(
        router_node.engine.clone(),
        router_node.store.clone() as Arc<dyn Store>,
        router_node.store.clone() as Arc<dyn RouterStore>,
        chain.clone(),
        bus,
        Arc::new(IdentitySwap),
        rebalance,
    );
    router.start().await.unwrap();

    Harness {
        chain,
        sender,
        router_node,
        receiver,
        router,
    }
}

fn network() -> NetworkContext {
    NetworkContext {
        chain_id: 1337,
        adjudicator: Address::zero(),
        channel_factory: Address::zero(),
        mastercopy: Address::zero(),
        provider_url: String::new(),
    }
}

/// Open sender->router, funded by the sender.
async fn open_sender_channel(h: &Harness, amount: u64) -> Address {
    let state = h
        .sender
        .engine
        .setup(h.router_node.engine.public_identifier(), network(), 3600)
        .await
        .unwrap();
    h.chain.fund(state.channel_address, Address::zero(), amount);
    h.sender
        .engine
        .reconcile_deposit(state.channel_address, Address::zero())
        .await
        .unwrap();
    state.channel_address
}

/// Open router->receiver via the protocol (receiver must be online).
async fn open_receiver_channel(h: &Harness) -> Address {
    let state = h
        .router_node
        .engine
        .setup(h.receiver.engine.public_identifier(), network(), 3600)
        .await
        .unwrap();
    state.channel_address
}

/// Seed an already-established router->receiver channel into both stores,
/// for tests where the receiver starts offline.
async fn seed_receiver_channel(h: &Harness) -> Address {
    let router_addr = h.router_node.engine.address();
    let receiver_addr = h.receiver.engine.address();
    let channel_address =
        encoding::channel_address(&router_addr, &receiver_addr, 1337, &Address::zero());
    let state = ChannelState {
        channel_address,
        participants: [router_addr, receiver_addr],
        public_identifiers: [
            h.router_node.engine.public_identifier().clone(),
            h.receiver.engine.public_identifier().clone(),
        ],
        network: network(),
        asset_ids: vec![],
        balances: vec![],
        locked_value: vec![],
        nonce: 1,
        latest_deposit_nonces: vec![],
        withdrawn: vec![],
        merkle_root: [0u8; 32],
        latest_update: None,
        timeout_secs: 3600,
    };
    h.router_node
        .store
        .save_channel_state(state.clone(), None)
        .await
        .unwrap();
    h.receiver.store.save_channel_state(state, None).await.unwrap();
    channel_address
}

fn routed_meta(h: &Harness, routing_id: Uuid, require_online: bool) -> TransferMeta {
    TransferMeta {
        routing_id: Some(routing_id),
        recipient_identifier: Some(h.receiver.engine.public_identifier().clone()),
        recipient_chain_id: None,
        recipient_asset_id: None,
        require_online,
    }
}

async fn send_payment(
    h: &Harness,
    sender_channel: Address,
    amount: u64,
    lock_hash: [u8; 32],
    routing_id: Uuid,
) {
    h.sender
        .engine
        .create(CreateTransferParams {
            channel_address: sender_channel,
            asset_id: Address::zero(),
            amount,
            recipient: h.router_node.engine.address(),
            definition: TransferDefinition::Hashlock { lock_hash },
            timeout_secs: 3600,
            meta: routed_meta(h, routing_id, false),
        })
        .await
        .unwrap();
}

/// Poll until `check` passes or the deadline hits. Forwarding runs on
/// background tasks, so tests wait for effects rather than calls.
async fn wait_for<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within deadline");
}

#[tokio::test]
async fn routed_payment_end_to_end() {
    let h = harness(true).await;
    let sender_channel = open_sender_channel(&h, 100).await;
    let receiver_channel = open_receiver_channel(&h).await;

    let preimage = [3u8; 32];
    let lock_hash: [u8; 32] = Sha256::digest(preimage).into();
    let routing_id = Uuid::new_v4();
    send_payment(&h, sender_channel, 7, lock_hash, routing_id).await;

    // The router collateralizes the receiver channel and re-creates the
    // transfer there.
    wait_for(|| async {
        h.receiver
            .engine
            .get_active_transfers(receiver_channel)
            .await
            .unwrap()
            .len()
            == 1
    })
    .await;

    let leg = h
        .receiver
        .engine
        .get_active_transfers(receiver_channel)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(leg.amount, 7);
    assert_eq!(leg.meta.routing_id, Some(routing_id));
    assert_eq!(leg.definition, TransferDefinition::Hashlock { lock_hash });
    assert_eq!(leg.recipient, h.receiver.engine.address());

    // The receiver reveals the preimage; the router propagates the
    // resolution back to the sender leg.
    h.receiver
        .engine
        .resolve(receiver_channel, leg.transfer_id, TransferResolver::Preimage(preimage))
        .await
        .unwrap();

    wait_for(|| async {
        h.sender
            .engine
            .get_active_transfers(sender_channel)
            .await
            .unwrap()
            .is_empty()
    })
    .await;

    let sender_head = h
        .sender
        .engine
        .get_channel_state(sender_channel)
        .await
        .unwrap()
        .unwrap();
    // Sender paid 7, the router collected it.
    assert_eq!(sender_head.balances[0].amount, [93, 7]);

    let receiver_head = h
        .receiver
        .engine
        .get_channel_state(receiver_channel)
        .await
        .unwrap()
        .unwrap();
    // The router's collateral moved to the receiver.
    assert_eq!(receiver_head.balances[0].amount, [0, 7]);
    assert_eq!(receiver_head.locked_value[0], 0);
}

#[tokio::test]
async fn offline_receiver_gets_payment_on_check_in() {
    let h = harness(false).await;
    let sender_channel = open_sender_channel(&h, 100).await;
    let receiver_channel = seed_receiver_channel(&h).await;

    let lock_hash: [u8; 32] = Sha256::digest([5u8; 32]).into();
    let routing_id = Uuid::new_v4();
    send_payment(&h, sender_channel, 7, lock_hash, routing_id).await;

    // The receiver never answers, so the creation lands in the queue.
    wait_for(|| async {
        !h.router_node
            .store
            .queued_entries(receiver_channel)
            .await
            .unwrap()
            .is_empty()
    })
    .await;
    assert!(h
        .receiver
        .engine
        .get_active_transfers(receiver_channel)
        .await
        .unwrap()
        .is_empty());

    // The receiver comes online and checks in.
    h.receiver.engine.start().await.unwrap();
    h.receiver.engine.announce_alive().await.unwrap();

    wait_for(|| async {
        h.receiver
            .engine
            .get_active_transfers(receiver_channel)
            .await
            .unwrap()
            .len()
            == 1
    })
    .await;
    wait_for(|| async {
        h.router_node
            .store
            .queued_entries(receiver_channel)
            .await
            .unwrap()
            .is_empty()
    })
    .await;

    // The queued replay reused the collateral deposited before the
    // receiver went unreachable instead of depositing again.
    let record = h
        .chain
        .get_latest_deposit(receiver_channel, 1337, Address::zero())
        .await
        .unwrap();
    assert_eq!(record.total_deposited, 7);

    // A second check-in replays nothing.
    h.receiver.engine.announce_alive().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        h.receiver
            .engine
            .get_active_transfers(receiver_channel)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn concurrent_forwards_cannot_steal_collateral() {
    let h = harness(true).await;
    let sender_channel = open_sender_channel(&h, 100).await;
    let receiver_channel = open_receiver_channel(&h).await;

    // Two payments race for the same uncollateralized receiver channel.
    let first_id = Uuid::new_v4();
    let second_id = Uuid::new_v4();
    send_payment(&h, sender_channel, 7, Sha256::digest([1u8; 32]).into(), first_id).await;
    send_payment(&h, sender_channel, 5, Sha256::digest([2u8; 32]).into(), second_id).await;

    let sender_head = h
        .sender
        .engine
        .get_channel_state(sender_channel)
        .await
        .unwrap()
        .unwrap();
    let first = h
        .router_node
        .store
        .get_transfers_by_routing_id(first_id)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.channel_address == sender_channel)
        .unwrap();
    let second = h
        .router_node
        .store
        .get_transfers_by_routing_id(second_id)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.channel_address == sender_channel)
        .unwrap();

    let a = {
        let router = h.router.clone();
        let head = sender_head.clone();
        tokio::spawn(async move { router.forward_transfer_creation(&head, &first).await })
    };
    let b = {
        let router = h.router.clone();
        let head = sender_head;
        tokio::spawn(async move { router.forward_transfer_creation(&head, &second).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    // Both legs landed, and each one paid for its own collateral: the
    // second forward must not have spent the first one's deposit.
    let active = h
        .receiver
        .engine
        .get_active_transfers(receiver_channel)
        .await
        .unwrap();
    assert_eq!(active.len(), 2);

    let record = h
        .chain
        .get_latest_deposit(receiver_channel, 1337, Address::zero())
        .await
        .unwrap();
    assert_eq!(record.total_deposited, 12);

    let head = h
        .router_node
        .engine
        .get_channel_state(receiver_channel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.locked_value[0], 12);
    assert_eq!(head.total_offchain(&Address::zero()), 12);
}

#[tokio::test]
async fn concurrent_check_ins_drain_once() {
    let h = harness(false).await;
    let sender_channel = open_sender_channel(&h, 100).await;
    let receiver_channel = seed_receiver_channel(&h).await;

    let lock_hash: [u8; 32] = Sha256::digest([8u8; 32]).into();
    send_payment(&h, sender_channel, 7, lock_hash, Uuid::new_v4()).await;
    wait_for(|| async {
        !h.router_node
            .store
            .queued_entries(receiver_channel)
            .await
            .unwrap()
            .is_empty()
    })
    .await;

    // The receiver comes back and its check-in is delivered twice, near
    // simultaneously. Both drains must not interleave over the queue.
    h.receiver.engine.start().await.unwrap();
    let a = {
        let router = h.router.clone();
        tokio::spawn(async move { router.handle_is_alive(receiver_channel).await })
    };
    let b = {
        let router = h.router.clone();
        tokio::spawn(async move { router.handle_is_alive(receiver_channel).await })
    };
    a.await.unwrap();
    b.await.unwrap();

    assert_eq!(
        h.receiver
            .engine
            .get_active_transfers(receiver_channel)
            .await
            .unwrap()
            .len(),
        1
    );
    let record = h
        .chain
        .get_latest_deposit(receiver_channel, 1337, Address::zero())
        .await
        .unwrap();
    assert_eq!(record.total_deposited, 7);
    assert!(h
        .router_node
        .store
        .queued_entries(receiver_channel)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn excess_collateral_is_reclaimed_after_collection() {
    let h = harness_with(
        true,
        RebalanceProfile {
            target: 0,
            reclaim_threshold: 5,
        },
    )
    .await;
    let sender_channel = open_sender_channel(&h, 100).await;
    let receiver_channel = open_receiver_channel(&h).await;

    let preimage = [9u8; 32];
    let lock_hash: [u8; 32] = Sha256::digest(preimage).into();
    send_payment(&h, sender_channel, 7, lock_hash, Uuid::new_v4()).await;

    wait_for(|| async {
        h.receiver
            .engine
            .get_active_transfers(receiver_channel)
            .await
            .unwrap()
            .len()
            == 1
    })
    .await;
    let leg = h
        .receiver
        .engine
        .get_active_transfers(receiver_channel)
        .await
        .unwrap()
        .remove(0);
    h.receiver
        .engine
        .resolve(receiver_channel, leg.transfer_id, TransferResolver::Preimage(preimage))
        .await
        .unwrap();

    // Collecting 7 in the sender channel puts the router over its reclaim
    // threshold; it withdraws the whole balance back on-chain.
    wait_for(|| async {
        let head = h
            .sender
            .engine
            .get_channel_state(sender_channel)
            .await
            .unwrap()
            .unwrap();
        head.balances[0].amount == [93, 0] && head.locked_value[0] == 0
    })
    .await;

    let head = h
        .sender
        .engine
        .get_channel_state(sender_channel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.withdrawn[0], 7);
    assert_eq!(head.total_offchain(&Address::zero()), 93);
}
