//! `BlockDecoder` trait and the JSON ledger-block decoder.
//!
//! Raw block messages carry a [`LedgerBlock`] serialized as JSON, with binary
//! fields (chaincode event payloads, transaction envelopes) hex-encoded. The
//! decoder projects that into a [`DecodedBlock`] in the mode the session was
//! opened with.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::transport::RawBlock;
use crate::types::{BlockMode, ChaincodeEvent, DecodedBlock, TransactionSummary, ValidationCode};

/// Turns raw block messages into decoded blocks.
pub trait BlockDecoder: Send + Sync {
    /// Decode `raw` into the filtered or full view.
    fn decode(&self, raw: &RawBlock, mode: BlockMode) -> Result<DecodedBlock, DecodeError>;
}

// ─── Wire representation ─────────────────────────────────────────────────────

/// A committed block in its JSON wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerBlock {
    pub number: u64,
    pub channel_id: String,
    #[serde(default)]
    pub transactions: Vec<LedgerTransaction>,
}

/// A transaction in its JSON wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerTransaction {
    pub tx_id: String,
    pub validation_code: ValidationCode,
    #[serde(default)]
    pub chaincode_events: Vec<LedgerChaincodeEvent>,
    /// Hex-encoded envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<String>,
}

/// A chaincode event in its JSON wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerChaincodeEvent {
    pub chaincode_id: String,
    pub event_name: String,
    /// Hex-encoded payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl LedgerBlock {
    pub fn new(number: u64, channel_id: impl Into<String>) -> Self {
        Self {
            number,
            channel_id: channel_id.into(),
            transactions: vec![],
        }
    }

    /// Append a transaction without chaincode events.
    pub fn with_tx(mut self, tx_id: impl Into<String>, code: ValidationCode) -> Self {
        self.transactions.push(LedgerTransaction {
            tx_id: tx_id.into(),
            validation_code: code,
            chaincode_events: vec![],
            envelope: None,
        });
        self
    }

    /// Attach a chaincode event to the most recently added transaction.
    pub fn with_chaincode_event(
        mut self,
        chaincode_id: impl Into<String>,
        event_name: impl Into<String>,
        payload: &[u8],
    ) -> Self {
        if let Some(tx) = self.transactions.last_mut() {
            tx.chaincode_events.push(LedgerChaincodeEvent {
                chaincode_id: chaincode_id.into(),
                event_name: event_name.into(),
                payload: Some(hex::encode(payload)),
            });
        }
        self
    }

    /// Serialize into a raw block message.
    pub fn to_raw(&self) -> Result<RawBlock, DecodeError> {
        serde_json::to_vec(self)
            .map(RawBlock::from)
            .map_err(|e| DecodeError::Malformed(e.to_string()))
    }
}

// ─── JsonBlockDecoder ────────────────────────────────────────────────────────

/// Decodes [`LedgerBlock`] JSON messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBlockDecoder;

impl JsonBlockDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl BlockDecoder for JsonBlockDecoder {
    fn decode(&self, raw: &RawBlock, mode: BlockMode) -> Result<DecodedBlock, DecodeError> {
        let block: LedgerBlock = serde_json::from_slice(raw.as_bytes())
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let mut transactions = Vec::with_capacity(block.transactions.len());
        for tx in block.transactions {
            let envelope = match (mode, &tx.envelope) {
                (BlockMode::Full, Some(hex_str)) => Some(decode_hex(&tx.tx_id, hex_str)?),
                _ => None,
            };
            let mut chaincode_events = Vec::with_capacity(tx.chaincode_events.len());
            for ev in tx.chaincode_events {
                let payload = match (mode, &ev.payload) {
                    (BlockMode::Full, Some(hex_str)) => Some(decode_hex(&tx.tx_id, hex_str)?),
                    (BlockMode::Full, None) => Some(Vec::new()),
                    _ => None,
                };
                chaincode_events.push(ChaincodeEvent {
                    chaincode_id: ev.chaincode_id,
                    tx_id: tx.tx_id.clone(),
                    event_name: ev.event_name,
                    payload,
                });
            }
            transactions.push(TransactionSummary {
                tx_id: tx.tx_id,
                validation_code: tx.validation_code,
                chaincode_events,
                envelope,
            });
        }

        Ok(DecodedBlock {
            number: block.number,
            channel_id: block.channel_id,
            mode,
            transactions,
        })
    }
}

fn decode_hex(tx_id: &str, s: &str) -> Result<Vec<u8>, DecodeError> {
    hex::decode(s.trim_start_matches("0x")).map_err(|e| DecodeError::InvalidPayload {
        tx_id: tx_id.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RawBlock {
        LedgerBlock::new(4, "mychannel")
            .with_tx("tx-a", ValidationCode::Valid)
            .with_chaincode_event("cc1", "evtA", b"hello")
            .with_tx("tx-b", ValidationCode::MvccReadConflict)
            .to_raw()
            .unwrap()
    }

    #[test]
    fn filtered_view_drops_payloads() {
        let block = JsonBlockDecoder.decode(&sample(), BlockMode::Filtered).unwrap();
        assert_eq!(block.number, 4);
        assert_eq!(block.mode, BlockMode::Filtered);
        assert_eq!(block.transactions.len(), 2);
        let ev = &block.transactions[0].chaincode_events[0];
        assert_eq!(ev.event_name, "evtA");
        assert_eq!(ev.tx_id, "tx-a");
        assert!(ev.payload.is_none());
        assert_eq!(
            block.transaction("tx-b").unwrap().validation_code,
            ValidationCode::MvccReadConflict
        );
    }

    #[test]
    fn full_view_keeps_payloads() {
        let block = JsonBlockDecoder.decode(&sample(), BlockMode::Full).unwrap();
        let ev = &block.transactions[0].chaincode_events[0];
        assert_eq!(ev.payload.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn malformed_input_is_an_error() {
        let raw = RawBlock::from(b"{not json".to_vec());
        assert!(matches!(
            JsonBlockDecoder.decode(&raw, BlockMode::Filtered),
            Err(DecodeError::Malformed(_))
        ));

        let bad_hex = br#"{"number":1,"channelId":"c","transactions":[{"txId":"t","validationCode":"VALID","chaincodeEvents":[{"chaincodeId":"cc","eventName":"e","payload":"zz"}]}]}"#;
        assert!(matches!(
            JsonBlockDecoder.decode(&RawBlock::from(bad_hex.to_vec()), BlockMode::Full),
            Err(DecodeError::InvalidPayload { .. })
        ));
    }
}
