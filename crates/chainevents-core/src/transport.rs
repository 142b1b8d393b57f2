//! The `DeliverTransport` trait, the seam between the hub and whatever
//! carries block messages from a peer.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::types::{PeerTarget, SeekPosition};

/// An undecoded block message as received from the deliver service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock(pub Bytes);

impl RawBlock {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for RawBlock {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

/// Terminal status sent by the deliver service at the end of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliverStatus {
    /// The requested range has been fully delivered.
    Success,
    BadRequest,
    Forbidden,
    NotFound,
    ServiceUnavailable,
    InternalServerError,
}

impl std::fmt::Display for DeliverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::BadRequest => write!(f, "BAD_REQUEST"),
            Self::Forbidden => write!(f, "FORBIDDEN"),
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::ServiceUnavailable => write!(f, "SERVICE_UNAVAILABLE"),
            Self::InternalServerError => write!(f, "INTERNAL_SERVER_ERROR"),
        }
    }
}

/// One item of a deliver stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliverResponse {
    Block(RawBlock),
    Status(DeliverStatus),
}

/// A stream of deliver responses for one session. Dropping it closes the
/// session.
pub type DeliverStream =
    Pin<Box<dyn Stream<Item = Result<DeliverResponse, TransportError>> + Send>>;

/// The identity that authenticates a deliver session.
pub trait SigningIdentity: Send + Sync {
    /// Membership service provider id of the identity.
    fn msp_id(&self) -> &str;

    /// Sign `message` (the serialized seek request).
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// Identity for gateways that authenticate at the connection layer (mutual
/// TLS, API key). Produces an empty signature.
#[derive(Debug, Clone)]
pub struct UnsignedIdentity {
    msp_id: String,
}

impl UnsignedIdentity {
    pub fn new(msp_id: impl Into<String>) -> Self {
        Self { msp_id: msp_id.into() }
    }
}

impl SigningIdentity for UnsignedIdentity {
    fn msp_id(&self) -> &str {
        &self.msp_id
    }

    fn sign(&self, _message: &[u8]) -> Result<Vec<u8>, TransportError> {
        Ok(Vec::new())
    }
}

/// Everything a transport needs to open one session.
#[derive(Clone)]
pub struct DeliverRequest {
    pub channel_id: String,
    pub target: PeerTarget,
    pub full_block: bool,
    pub start: SeekPosition,
    /// `None` keeps the session open for live blocks.
    pub stop: Option<SeekPosition>,
    pub identity: Arc<dyn SigningIdentity>,
}

impl std::fmt::Debug for DeliverRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliverRequest")
            .field("channel_id", &self.channel_id)
            .field("target", &self.target.addr())
            .field("full_block", &self.full_block)
            .field("start", &self.start)
            .field("stop", &self.stop)
            .field("msp_id", &self.identity.msp_id())
            .finish()
    }
}

/// Opens server-streaming deliver sessions to a peer.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Object Safety
/// The trait is object-safe and can be stored as `Arc<dyn DeliverTransport>`.
#[async_trait]
pub trait DeliverTransport: Send + Sync + 'static {
    /// Open a session. Returning `Ok` means the session is ready.
    async fn open(&self, request: DeliverRequest) -> Result<DeliverStream, TransportError>;

    /// Short name used in logs.
    fn kind(&self) -> &str {
        "deliver"
    }
}
