// Conduit - Typed Engine Events
//
// Every applied update is announced as a typed event. Subscribers attach a
// strongly-typed predicate instead of stringly-typed event names, so the
// router (and tests) filter at subscription time.

use crate::types::{ChannelState, PublicIdentifier, TransferState};
use std::sync::RwLock;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Event emitted after an update is fully co-signed and persisted.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ChannelSetup {
        channel: ChannelState,
    },
    DepositReconciled {
        channel: ChannelState,
        /// Asset whose balance the deposit update credited.
        asset_id: crate::types::Address,
        initiator: PublicIdentifier,
    },
    TransferCreated {
        channel: ChannelState,
        transfer: TransferState,
        /// Proposer of the create update.
        initiator: PublicIdentifier,
    },
    TransferResolved {
        channel: ChannelState,
        transfer: TransferState,
        initiator: PublicIdentifier,
    },
}

impl EngineEvent {
    pub fn channel(&self) -> &ChannelState {
        match self {
            EngineEvent::ChannelSetup { channel } => channel,
            EngineEvent::DepositReconciled { channel, .. } => channel,
            EngineEvent::TransferCreated { channel, .. } => channel,
            EngineEvent::TransferResolved { channel, .. } => channel,
        }
    }
}

type EventFilter = Box<dyn Fn(&EngineEvent) -> bool + Send + Sync + 'static>;

struct Subscriber {
    filter: EventFilter,
    tx: UnboundedSender<EngineEvent>,
}

/// Owned publish/subscribe fan-out for engine events. Constructed once per
/// engine; dropped subscribers are pruned on the next emit.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe with a predicate; only matching events are delivered.
    pub fn subscribe<F>(&self, filter: F) -> UnboundedReceiver<EngineEvent>
    where
        F: Fn(&EngineEvent) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = unbounded_channel();
        self.subscribers
            .write()
            .expect("event bus lock poisoned")
            .push(Subscriber {
                filter: Box::new(filter),
                tx,
            });
        rx
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        let mut subscribers = self.subscribers.write().expect("event bus lock poisoned");
        subscribers.retain(|s| {
            if !(s.filter)(&event) {
                return !s.tx.is_closed();
            }
            match s.tx.send(event.clone()) {
                Ok(()) => true,
                Err(_) => {
                    debug!("dropping closed event subscriber");
                    false
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ChannelSigner;
    use crate::types::{Address, NetworkContext};

    fn test_channel() -> ChannelState {
        let alice = ChannelSigner::random();
        let bob = ChannelSigner::random();
        ChannelState {
            channel_address: Address::zero(),
            participants: [alice.address(), bob.address()],
            public_identifiers: [
                alice.public_identifier().clone(),
                bob.public_identifier().clone(),
            ],
            network: NetworkContext {
                chain_id: 1337,
                adjudicator: Address::zero(),
                channel_factory: Address::zero(),
                mastercopy: Address::zero(),
                provider_url: String::new(),
            },
            asset_ids: vec![],
            balances: vec![],
            locked_value: vec![],
            nonce: 1,
            latest_deposit_nonces: vec![],
            withdrawn: vec![],
            merkle_root: [0u8; 32],
            latest_update: None,
            timeout_secs: 3600,
        }
    }

    #[tokio::test]
    async fn filter_selects_matching_events() {
        let bus = EventBus::new();
        let mut setups =
            bus.subscribe(|e| matches!(e, EngineEvent::ChannelSetup { .. }));
        let mut everything = bus.subscribe(|_| true);

        bus.emit(EngineEvent::ChannelSetup {
            channel: test_channel(),
        });

        assert!(matches!(
            setups.try_recv().unwrap(),
            EngineEvent::ChannelSetup { .. }
        ));
        assert!(everything.try_recv().is_ok());
        assert!(setups.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe(|_| true);
        drop(rx);
        bus.emit(EngineEvent::ChannelSetup {
            channel: test_channel(),
        });
        assert!(bus.subscribers.read().unwrap().is_empty());
    }
}
