//! Fluent builder for [`ChannelEventHub`].
//!
//! # Example
//!
//! ```rust,no_run
//! use chainevents_core::{EventHubBuilder, MemoryLedger, PeerTarget, UnsignedIdentity};
//!
//! # fn main() -> Result<(), chainevents_core::EventHubError> {
//! let ledger = MemoryLedger::new("mychannel");
//! let hub = EventHubBuilder::new("mychannel", PeerTarget::new("grpcs://localhost:7051")?)
//!     .transport(ledger)
//!     .identity(UnsignedIdentity::new("Org1MSP"))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::decoder::{BlockDecoder, JsonBlockDecoder};
use crate::error::EventHubError;
use crate::hub::ChannelEventHub;
use crate::transport::{DeliverTransport, SigningIdentity};
use crate::types::PeerTarget;

/// Fluent builder for [`ChannelEventHub`].
pub struct EventHubBuilder {
    channel_id: String,
    target: PeerTarget,
    transport: Option<Arc<dyn DeliverTransport>>,
    decoder: Option<Arc<dyn BlockDecoder>>,
    identity: Option<Arc<dyn SigningIdentity>>,
}

impl EventHubBuilder {
    pub fn new(channel_id: impl Into<String>, target: PeerTarget) -> Self {
        Self {
            channel_id: channel_id.into(),
            target,
            transport: None,
            decoder: None,
            identity: None,
        }
    }

    /// Set the deliver transport (required).
    pub fn transport(mut self, transport: impl DeliverTransport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Set a shared deliver transport.
    pub fn shared_transport(mut self, transport: Arc<dyn DeliverTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the block decoder. Defaults to [`JsonBlockDecoder`].
    pub fn decoder(mut self, decoder: impl BlockDecoder + 'static) -> Self {
        self.decoder = Some(Arc::new(decoder));
        self
    }

    /// Set the identity that signs seek requests.
    pub fn identity(mut self, identity: impl SigningIdentity + 'static) -> Self {
        self.identity = Some(Arc::new(identity));
        self
    }

    pub fn build(self) -> Result<ChannelEventHub, EventHubError> {
        if self.channel_id.is_empty() {
            return Err(EventHubError::config("Missing channel id"));
        }
        let transport = self
            .transport
            .ok_or_else(|| EventHubError::config("Missing deliver transport"))?;
        let decoder = self
            .decoder
            .unwrap_or_else(|| Arc::new(JsonBlockDecoder::new()));
        Ok(ChannelEventHub::from_parts(
            self.channel_id,
            self.target,
            transport,
            decoder,
            self.identity,
        ))
    }
}
