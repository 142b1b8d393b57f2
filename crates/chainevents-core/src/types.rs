//! Shared types for the event hub: block views, validation codes, replay
//! positions and peer targets.

use serde::{Deserialize, Serialize};

use crate::error::EventHubError;

// ─── ValidationCode ──────────────────────────────────────────────────────────

/// Per-transaction outcome assigned by the committing peer.
///
/// Only [`ValidationCode::Valid`] means the transaction was accepted; every
/// other code is a terminal failure and is delivered to listeners exactly
/// like a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    Valid,
    NilEnvelope,
    BadPayload,
    BadCommonHeader,
    BadCreatorSignature,
    InvalidEndorserTransaction,
    InvalidConfigTransaction,
    UnsupportedTxPayload,
    BadProposalTxid,
    DuplicateTxid,
    EndorsementPolicyFailure,
    MvccReadConflict,
    PhantomReadConflict,
    UnknownTxType,
    TargetChainNotFound,
    MarshalTxError,
    NilTxaction,
    ExpiredChaincode,
    ChaincodeVersionConflict,
    BadHeaderExtension,
    BadChannelHeader,
    BadResponsePayload,
    BadRwset,
    IllegalWriteset,
    InvalidWriteset,
    NotValidated,
    InvalidOtherReason,
}

impl ValidationCode {
    const TABLE: [(ValidationCode, u8, &'static str); 27] = [
        (Self::Valid, 0, "VALID"),
        (Self::NilEnvelope, 1, "NIL_ENVELOPE"),
        (Self::BadPayload, 2, "BAD_PAYLOAD"),
        (Self::BadCommonHeader, 3, "BAD_COMMON_HEADER"),
        (Self::BadCreatorSignature, 4, "BAD_CREATOR_SIGNATURE"),
        (Self::InvalidEndorserTransaction, 5, "INVALID_ENDORSER_TRANSACTION"),
        (Self::InvalidConfigTransaction, 6, "INVALID_CONFIG_TRANSACTION"),
        (Self::UnsupportedTxPayload, 7, "UNSUPPORTED_TX_PAYLOAD"),
        (Self::BadProposalTxid, 8, "BAD_PROPOSAL_TXID"),
        (Self::DuplicateTxid, 9, "DUPLICATE_TXID"),
        (Self::EndorsementPolicyFailure, 10, "ENDORSEMENT_POLICY_FAILURE"),
        (Self::MvccReadConflict, 11, "MVCC_READ_CONFLICT"),
        (Self::PhantomReadConflict, 12, "PHANTOM_READ_CONFLICT"),
        (Self::UnknownTxType, 13, "UNKNOWN_TX_TYPE"),
        (Self::TargetChainNotFound, 14, "TARGET_CHAIN_NOT_FOUND"),
        (Self::MarshalTxError, 15, "MARSHAL_TX_ERROR"),
        (Self::NilTxaction, 16, "NIL_TXACTION"),
        (Self::ExpiredChaincode, 17, "EXPIRED_CHAINCODE"),
        (Self::ChaincodeVersionConflict, 18, "CHAINCODE_VERSION_CONFLICT"),
        (Self::BadHeaderExtension, 19, "BAD_HEADER_EXTENSION"),
        (Self::BadChannelHeader, 20, "BAD_CHANNEL_HEADER"),
        (Self::BadResponsePayload, 21, "BAD_RESPONSE_PAYLOAD"),
        (Self::BadRwset, 22, "BAD_RWSET"),
        (Self::IllegalWriteset, 23, "ILLEGAL_WRITESET"),
        (Self::InvalidWriteset, 24, "INVALID_WRITESET"),
        (Self::NotValidated, 254, "NOT_VALIDATED"),
        (Self::InvalidOtherReason, 255, "INVALID_OTHER_REASON"),
    ];

    /// Returns `true` only for a committed-and-accepted transaction.
    pub fn is_valid(self) -> bool {
        self == Self::Valid
    }

    /// Numeric code as stored in the block metadata.
    pub fn code(self) -> u8 {
        Self::TABLE
            .iter()
            .find(|(v, _, _)| *v == self)
            .map(|(_, c, _)| *c)
            .unwrap_or(255)
    }

    /// Look up a validation code by its numeric value.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::TABLE.iter().find(|(_, c, _)| *c == code).map(|(v, _, _)| *v)
    }

    /// The canonical upper-case name, e.g. `"MVCC_READ_CONFLICT"`.
    pub fn as_str(self) -> &'static str {
        Self::TABLE
            .iter()
            .find(|(v, _, _)| *v == self)
            .map(|(_, _, name)| *name)
            .unwrap_or("INVALID_OTHER_REASON")
    }
}

impl std::fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Decoded blocks ──────────────────────────────────────────────────────────

/// Which block view a session delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockMode {
    /// Transaction ids, validation codes and chaincode event names only.
    #[default]
    Filtered,
    /// Adds chaincode event payloads and transaction envelopes.
    Full,
}

impl BlockMode {
    pub fn from_full_block(full_block: bool) -> Self {
        if full_block {
            Self::Full
        } else {
            Self::Filtered
        }
    }

    pub fn is_full(self) -> bool {
        self == Self::Full
    }
}

/// An event emitted by chaincode inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChaincodeEvent {
    pub chaincode_id: String,
    pub tx_id: String,
    pub event_name: String,
    /// Raw payload; always `None` in filtered blocks.
    pub payload: Option<Vec<u8>>,
}

/// One transaction inside a decoded block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSummary {
    pub tx_id: String,
    pub validation_code: ValidationCode,
    pub chaincode_events: Vec<ChaincodeEvent>,
    /// Serialized transaction envelope; always `None` in filtered blocks.
    pub envelope: Option<Vec<u8>>,
}

/// A block as seen by listeners, in either filtered or full form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBlock {
    pub number: u64,
    pub channel_id: String,
    pub mode: BlockMode,
    pub transactions: Vec<TransactionSummary>,
}

impl DecodedBlock {
    /// Find a transaction by id.
    pub fn transaction(&self, tx_id: &str) -> Option<&TransactionSummary> {
        self.transactions.iter().find(|t| t.tx_id == tx_id)
    }
}

// ─── Replay window ───────────────────────────────────────────────────────────

/// Where a replay starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartBlock {
    Oldest,
    #[serde(untagged)]
    Number(u64),
}

/// Where a replay stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndBlock {
    Newest,
    #[serde(untagged)]
    Number(u64),
}

impl std::str::FromStr for StartBlock {
    type Err = EventHubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oldest" => Ok(Self::Oldest),
            n => n
                .parse()
                .map(Self::Number)
                .map_err(|_| EventHubError::config(format!("invalid start block '{s}'"))),
        }
    }
}

impl std::str::FromStr for EndBlock {
    type Err = EventHubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newest" => Ok(Self::Newest),
            n => n
                .parse()
                .map(Self::Number)
                .map_err(|_| EventHubError::config(format!("invalid end block '{s}'"))),
        }
    }
}

/// The `[start, end]` range requested for one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplayWindow {
    pub start: Option<StartBlock>,
    pub end: Option<EndBlock>,
}

impl ReplayWindow {
    pub fn new(start: Option<StartBlock>, end: Option<EndBlock>) -> Result<Self, EventHubError> {
        if let (Some(StartBlock::Number(s)), Some(EndBlock::Number(e))) = (start, end) {
            if s > e {
                return Err(EventHubError::config(format!(
                    "startBlock ({s}) must not be greater than endBlock ({e})"
                )));
            }
        }
        Ok(Self { start, end })
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Seek position for the start of the session. No start means live
    /// delivery from the current head.
    pub fn seek_start(&self) -> SeekPosition {
        match self.start {
            Some(StartBlock::Oldest) => SeekPosition::Oldest,
            Some(StartBlock::Number(n)) => SeekPosition::Specified(n),
            None => SeekPosition::Newest,
        }
    }

    /// Seek position for the end of the session; `None` is unbounded.
    pub fn seek_stop(&self) -> Option<SeekPosition> {
        self.end.map(|end| match end {
            EndBlock::Newest => SeekPosition::Newest,
            EndBlock::Number(n) => SeekPosition::Specified(n),
        })
    }
}

/// A position on the ledger as understood by the deliver service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeekPosition {
    Oldest,
    Newest,
    Specified(u64),
}

// ─── Connection state / targets ──────────────────────────────────────────────

/// Connection lifecycle of a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// The remote peer a hub streams from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTarget {
    name: String,
    url: String,
    addr: String,
}

impl PeerTarget {
    /// Build a target from an endpoint URL such as `grpcs://localhost:7051`.
    /// The name defaults to the `host:port` address.
    pub fn new(url: impl Into<String>) -> Result<Self, EventHubError> {
        let url = url.into();
        let addr = parse_addr(&url)?;
        Ok(Self {
            name: addr.clone(),
            url,
            addr,
        })
    }

    /// Override the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// `host:port` of the peer.
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

fn parse_addr(raw: &str) -> Result<String, EventHubError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| EventHubError::config(format!("invalid peer url '{raw}': {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| EventHubError::config(format!("peer url '{raw}' has no host")))?;
    Ok(match parsed.port_or_known_default() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_code_names_and_numbers() {
        assert_eq!(ValidationCode::MvccReadConflict.to_string(), "MVCC_READ_CONFLICT");
        assert_eq!(ValidationCode::MvccReadConflict.code(), 11);
        assert_eq!(ValidationCode::from_code(254), Some(ValidationCode::NotValidated));
        assert_eq!(ValidationCode::from_code(99), None);
        assert!(ValidationCode::Valid.is_valid());
        assert!(!ValidationCode::PhantomReadConflict.is_valid());

        let json = serde_json::to_string(&ValidationCode::EndorsementPolicyFailure).unwrap();
        assert_eq!(json, "\"ENDORSEMENT_POLICY_FAILURE\"");
    }

    #[test]
    fn peer_target_addr() {
        let target = PeerTarget::new("grpcs://localhost:7051").unwrap();
        assert_eq!(target.addr(), "localhost:7051");
        assert_eq!(target.name(), "localhost:7051");

        let named = PeerTarget::new("ws://10.0.0.5:9443/deliver").unwrap().with_name("peer0.org2");
        assert_eq!(named.addr(), "10.0.0.5:9443");
        assert_eq!(named.name(), "peer0.org2");

        assert!(PeerTarget::new("not a url").is_err());
    }

    #[test]
    fn replay_window_validation() {
        assert!(ReplayWindow::new(Some(StartBlock::Number(10)), Some(EndBlock::Number(5))).is_err());
        let w = ReplayWindow::new(Some(StartBlock::Number(0)), Some(EndBlock::Newest)).unwrap();
        assert_eq!(w.seek_start(), SeekPosition::Specified(0));
        assert_eq!(w.seek_stop(), Some(SeekPosition::Newest));
        assert_eq!(ReplayWindow::default().seek_start(), SeekPosition::Newest);
        assert_eq!(ReplayWindow::default().seek_stop(), None);
    }

    #[test]
    fn parse_block_positions() {
        assert_eq!("oldest".parse::<StartBlock>().unwrap(), StartBlock::Oldest);
        assert_eq!("42".parse::<StartBlock>().unwrap(), StartBlock::Number(42));
        assert_eq!("newest".parse::<EndBlock>().unwrap(), EndBlock::Newest);
        assert!("latest".parse::<EndBlock>().is_err());
    }
}
