// Conduit State Channel Library
// Core implementation of the Conduit payment channel protocol

// Public modules
pub mod chain;
pub mod crypto;
pub mod encoding;
pub mod engine;
pub mod lock;
pub mod merkle;
pub mod messaging;
pub mod router;
pub mod store;
pub mod types;

// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export commonly used types
pub use crate::crypto::ChannelSigner;
pub use crate::engine::{Engine, EngineError, EngineEvent};
pub use crate::lock::LockService;
pub use crate::messaging::{InMemoryMessaging, MessagingService};
pub use crate::router::{Router, RouterError};
pub use crate::store::{MemoryStore, RouterStore, Store};
pub use crate::types::{
    Address, Balance, ChannelState, ChannelUpdate, NetworkContext, PublicIdentifier, TransferState,
};
