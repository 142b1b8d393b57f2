//! chainevents-core — channel event hub for permissioned ledgers.
//!
//! Subscribe to block, transaction and chaincode events streamed by a peer's
//! deliver service, and replay historical ranges with the same listeners.
//!
//! # Architecture
//!
//! ```text
//! EventHubBuilder → ChannelEventHub (connection state machine)
//!                      ├── DeliverTransport  (memory / WebSocket)
//!                      ├── BlockDecoder      (filtered / full view)
//!                      ├── Dispatcher        (block → tx → chaincode order)
//!                      └── RegistrationRegistry (block / tx / chaincode listeners)
//! ```

pub mod builder;
pub mod config;
pub mod decoder;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod listener;
pub mod memory;
pub mod options;
pub mod registry;
pub mod transport;
pub mod types;

pub use builder::EventHubBuilder;
pub use config::{EventHubConfig, LogConfig, PeerConfig};
pub use decoder::{BlockDecoder, JsonBlockDecoder, LedgerBlock};
pub use error::{Completion, DecodeError, EventHubError, TransportError};
pub use hub::{ChannelEventHub, ConnectCallback};
pub use listener::{ChaincodeNotice, Notification, Subscription, TxStatus};
pub use memory::MemoryLedger;
pub use options::{ConnectOptions, RegistrationOptions};
pub use registry::{BlockHandle, ChaincodeHandle, Lifetime, ALL_TRANSACTIONS};
pub use transport::{
    DeliverRequest, DeliverResponse, DeliverStatus, DeliverStream, DeliverTransport, RawBlock,
    SigningIdentity, UnsignedIdentity,
};
pub use types::{
    BlockMode, ChaincodeEvent, ConnectionState, DecodedBlock, EndBlock, PeerTarget, SeekPosition,
    StartBlock, TransactionSummary, ValidationCode,
};
