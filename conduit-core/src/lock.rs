// Conduit - Per-Channel Lock Service
//
// Exclusive, named, TTL-bounded locks. The channel's designated host
// (alice) holds the lock table locally; the counterparty acquires and
// releases over messaging. Acquisition is FIFO per name, and a crashed
// holder is evicted when its TTL expires so a channel can never deadlock
// permanently.

use crate::messaging::{lock_subject, Delivery, MessagingService, SubscriptionHandler};
use crate::types::PublicIdentifier;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

/// Default TTL after which an abandoned lock is force-released.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Timed out acquiring lock {0}")]
    AcquireTimeout(String),

    #[error("Lock value mismatch for {0}")]
    Mismatch(String),

    #[error("Lock {0} is not held")]
    NotHeld(String),

    #[error("Lock host rejected request: {0}")]
    HostError(String),

    #[error("Messaging error: {0}")]
    Messaging(#[from] crate::messaging::MessagingError),

    #[error("Malformed lock message: {0}")]
    BadMessage(String),
}

/// Wire format for counterparty lock requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub kind: LockRequestKind,
    pub lock_name: String,
    pub lock_value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockRequestKind {
    Acquire,
    Release,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockReply {
    pub lock_name: String,
    pub lock_value: Option<String>,
    pub error: Option<String>,
}

struct Holder {
    secret: String,
    _guard: OwnedMutexGuard<()>,
}

/// Named-lock provider for one node. Owns its lock table; constructed once
/// per process and shared behind an `Arc`.
pub struct LockService {
    identifier: PublicIdentifier,
    messaging: Arc<dyn MessagingService>,
    ttl: Duration,
    locks: DashMap<String, Arc<Mutex<()>>>,
    holders: Arc<DashMap<String, Holder>>,
}

impl LockService {
    pub fn new(
        identifier: PublicIdentifier,
        messaging: Arc<dyn MessagingService>,
        ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            identifier,
            messaging,
            ttl,
            locks: DashMap::new(),
            holders: Arc::new(DashMap::new()),
        })
    }

    /// Acquire a named lock. When `is_host` the lock is taken locally;
    /// otherwise an acquire request is sent to the host identified by
    /// `counterparty`. Returns the opaque secret required to release.
    pub async fn acquire(
        &self,
        lock_name: &str,
        is_host: bool,
        counterparty: Option<&PublicIdentifier>,
    ) -> Result<String, LockError> {
        if is_host {
            self.acquire_local(lock_name).await
        } else {
            let host = counterparty
                .ok_or_else(|| LockError::BadMessage("remote acquire needs a host".into()))?;
            self.remote_call(host, LockRequestKind::Acquire, lock_name, None)
                .await?
                .ok_or_else(|| LockError::HostError("host returned no lock value".into()))
        }
    }

    /// Release a named lock previously acquired with `acquire`.
    pub async fn release(
        &self,
        lock_name: &str,
        lock_value: &str,
        is_host: bool,
        counterparty: Option<&PublicIdentifier>,
    ) -> Result<(), LockError> {
        if is_host {
            self.release_local(lock_name, lock_value)
        } else {
            let host = counterparty
                .ok_or_else(|| LockError::BadMessage("remote release needs a host".into()))?;
            self.remote_call(
                host,
                LockRequestKind::Release,
                lock_name,
                Some(lock_value.to_string()),
            )
            .await?;
            Ok(())
        }
    }

    async fn acquire_local(&self, lock_name: &str) -> Result<String, LockError> {
        let mutex = self
            .locks
            .entry(lock_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        // The tokio mutex hands the lock to waiters in FIFO order. A live
        // holder releases well inside the TTL; an abandoned one is evicted
        // by its watchdog, so waiting twice the TTL means something is
        // genuinely wedged.
        let guard = tokio::time::timeout(self.ttl * 2, mutex.lock_owned())
            .await
            .map_err(|_| LockError::AcquireTimeout(lock_name.to_string()))?;

        let secret = Uuid::new_v4().to_string();
        self.holders.insert(
            lock_name.to_string(),
            Holder {
                secret: secret.clone(),
                _guard: guard,
            },
        );
        debug!(lock = lock_name, "lock acquired");

        self.spawn_ttl_watchdog(lock_name.to_string(), secret.clone());
        Ok(secret)
    }

    fn release_local(&self, lock_name: &str, lock_value: &str) -> Result<(), LockError> {
        // Secret check and removal must be one atomic step: between a
        // `get` and a `remove` the TTL watchdog could evict the entry and
        // a new holder take its place. Dropping the removed holder drops
        // the owned guard, waking the next waiter in FIFO order.
        if self
            .holders
            .remove_if(lock_name, |_, holder| holder.secret == lock_value)
            .is_some()
        {
            debug!(lock = lock_name, "lock released");
            return Ok(());
        }
        if self.holders.contains_key(lock_name) {
            Err(LockError::Mismatch(lock_name.to_string()))
        } else {
            Err(LockError::NotHeld(lock_name.to_string()))
        }
    }

    fn spawn_ttl_watchdog(&self, lock_name: String, secret: String) {
        let holders = Arc::clone(&self.holders);
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if holders
                .remove_if(&lock_name, |_, holder| holder.secret == secret)
                .is_some()
            {
                warn!(
                    lock = %lock_name,
                    ttl_secs = ttl.as_secs(),
                    "lock TTL expired; force-releasing abandoned holder"
                );
            }
        });
    }

    async fn remote_call(
        &self,
        host: &PublicIdentifier,
        kind: LockRequestKind,
        lock_name: &str,
        lock_value: Option<String>,
    ) -> Result<Option<String>, LockError> {
        let request = LockRequest {
            kind,
            lock_name: lock_name.to_string(),
            lock_value,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| LockError::BadMessage(e.to_string()))?;
        let subject = lock_subject(host, &self.identifier);
        // The host may itself wait out a previous holder's TTL before it
        // can answer an acquire.
        let reply_bytes = self
            .messaging
            .request(&subject, self.ttl * 2 + Duration::from_secs(1), payload)
            .await?;
        let reply: LockReply = serde_json::from_slice(&reply_bytes)
            .map_err(|e| LockError::BadMessage(e.to_string()))?;
        if let Some(error) = reply.error {
            return Err(LockError::HostError(error));
        }
        Ok(reply.lock_value)
    }

    /// Serve counterparty lock requests addressed to this node.
    pub async fn serve(self: &Arc<Self>) -> Result<(), LockError> {
        let service = Arc::clone(self);
        let pattern = format!("{}.*.lock", self.identifier);
        let handler: SubscriptionHandler = Arc::new(move |delivery: Delivery| {
            let service = Arc::clone(&service);
            Box::pin(async move {
                service.handle_request(delivery).await;
            })
        });
        self.messaging.subscribe(&pattern, handler).await?;
        Ok(())
    }

    async fn handle_request(self: Arc<Self>, delivery: Delivery) {
        let reply_handle = match delivery.reply {
            Some(handle) => handle,
            None => {
                warn!(subject = %delivery.subject, "lock message without reply handle dropped");
                return;
            }
        };
        let request: LockRequest = match serde_json::from_slice(&delivery.payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(subject = %delivery.subject, error = %e, "malformed lock request");
                return;
            }
        };

        let reply = match request.kind {
            LockRequestKind::Acquire => match self.acquire_local(&request.lock_name).await {
                Ok(secret) => LockReply {
                    lock_name: request.lock_name,
                    lock_value: Some(secret),
                    error: None,
                },
                Err(e) => LockReply {
                    lock_name: request.lock_name,
                    lock_value: None,
                    error: Some(e.to_string()),
                },
            },
            LockRequestKind::Release => {
                let value = request.lock_value.unwrap_or_default();
                match self.release_local(&request.lock_name, &value) {
                    Ok(()) => LockReply {
                        lock_name: request.lock_name,
                        lock_value: None,
                        error: None,
                    },
                    Err(e) => LockReply {
                        lock_name: request.lock_name,
                        lock_value: None,
                        error: Some(e.to_string()),
                    },
                }
            }
        };

        match serde_json::to_vec(&reply) {
            Ok(bytes) => reply_handle.send(bytes),
            Err(e) => warn!(error = %e, "failed to encode lock reply"),
        }
    }
}
