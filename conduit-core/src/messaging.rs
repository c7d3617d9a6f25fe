// Conduit - Messaging Contract
//
// Request/reply and pub/sub primitives addressed by
// `<to_identifier>.<from_identifier>.<topic>` subjects. The transport
// itself (NATS or similar, including its bearer-token auth) is an
// external collaborator; this module defines the contract the core
// consumes plus an in-memory broker used by the node wiring and tests.

use crate::types::PublicIdentifier;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Request timed out on subject {0}")]
    Timeout(String),

    #[error("No subscribers for subject {0}")]
    NoSubscribers(String),

    #[error("Malformed payload: {0}")]
    BadPayload(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl MessagingError {
    /// True when the counterparty simply never answered, as opposed to a
    /// malformed exchange.
    pub fn is_unresponsive(&self) -> bool {
        matches!(self, MessagingError::Timeout(_) | MessagingError::NoSubscribers(_))
    }
}

/// One-shot reply channel attached to a request delivery.
pub struct ReplyHandle(oneshot::Sender<Vec<u8>>);

impl ReplyHandle {
    pub fn send(self, payload: Vec<u8>) {
        // The requester may have timed out and dropped the receiver.
        if self.0.send(payload).is_err() {
            debug!("reply receiver dropped before reply was sent");
        }
    }
}

/// A message delivered to a subscription handler.
pub struct Delivery {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Present only for request deliveries.
    pub reply: Option<ReplyHandle>,
}

pub type SubscriptionHandler =
    Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync + 'static>;

/// Messaging primitives consumed by the protocol engine, lock service and
/// router.
#[async_trait]
pub trait MessagingService: Send + Sync {
    /// Fire-and-forget delivery to every matching subscriber.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), MessagingError>;

    /// Deliver to one matching subscriber and await its reply.
    async fn request(
        &self,
        subject: &str,
        timeout: Duration,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, MessagingError>;

    /// Register a handler for a subject pattern. `*` matches exactly one
    /// token, a trailing `>` matches the rest of the subject.
    async fn subscribe(
        &self,
        pattern: &str,
        handler: SubscriptionHandler,
    ) -> Result<(), MessagingError>;
}

/// Subject for protocol update proposals sent to `to`.
pub fn protocol_subject(to: &PublicIdentifier, from: &PublicIdentifier) -> String {
    format!("{}.{}.protocol", to, from)
}

/// Subject for lock requests served by the lock host `to`.
pub fn lock_subject(to: &PublicIdentifier, from: &PublicIdentifier) -> String {
    format!("{}.{}.lock", to, from)
}

/// Subject for check-in signals notifying `to` that `from` is reachable.
pub fn is_alive_subject(to: &PublicIdentifier, from: &PublicIdentifier) -> String {
    format!("{}.{}.isalive", to, from)
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Subscription {
    pattern: String,
    handler: SubscriptionHandler,
}

/// In-process broker with the same delivery semantics the core expects
/// from the real transport: pattern subscriptions, fan-out publish, and
/// request/reply where exactly one subscriber answers.
#[derive(Default)]
pub struct InMemoryMessaging {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl InMemoryMessaging {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn matching(&self, subject: &str) -> Vec<SubscriptionHandler> {
        self.subscriptions
            .read()
            .expect("subscription lock poisoned")
            .iter()
            .filter(|s| subject_matches(&s.pattern, subject))
            .map(|s| Arc::clone(&s.handler))
            .collect()
    }
}

#[async_trait]
impl MessagingService for InMemoryMessaging {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), MessagingError> {
        let handlers = self.matching(subject);
        if handlers.is_empty() {
            debug!(subject, "publish with no subscribers");
        }
        for handler in handlers {
            let delivery = Delivery {
                subject: subject.to_string(),
                payload: payload.clone(),
                reply: None,
            };
            tokio::spawn(handler(delivery));
        }
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        timeout: Duration,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, MessagingError> {
        let handlers = self.matching(subject);
        let handler = match handlers.into_iter().next() {
            Some(h) => h,
            None => return Err(MessagingError::NoSubscribers(subject.to_string())),
        };
        let (tx, rx) = oneshot::channel();
        let delivery = Delivery {
            subject: subject.to_string(),
            payload,
            reply: Some(ReplyHandle(tx)),
        };
        tokio::spawn(handler(delivery));
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                warn!(subject, "responder dropped the reply handle");
                Err(MessagingError::Timeout(subject.to_string()))
            }
            Err(_) => Err(MessagingError::Timeout(subject.to_string())),
        }
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: SubscriptionHandler,
    ) -> Result<(), MessagingError> {
        self.subscriptions
            .write()
            .expect("subscription lock poisoned")
            .push(Subscription {
                pattern: pattern.to_string(),
                handler,
            });
        Ok(())
    }
}
