//! JSON frames exchanged with a deliver gateway.
//!
//! ```text
//! client → gateway   {"channelId":"mychannel","start":"oldest","stop":{"specified":9},
//!                     "fullBlock":false,"mspId":"Org1MSP","signature":"ab12.."}
//! gateway → client   {"type":"block","block":{"number":0,"channelId":"mychannel",...}}
//!                    {"type":"status","status":"SUCCESS"}
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use chainevents_core::error::TransportError;
use chainevents_core::transport::{DeliverRequest, DeliverResponse, DeliverStatus, RawBlock};
use chainevents_core::types::SeekPosition;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid deliver frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),

    #[error("signing seek request failed: {0}")]
    Signing(#[source] TransportError),
}

impl From<WireError> for TransportError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::InvalidFrame(e) => TransportError::Protocol(e.to_string()),
            WireError::Signing(e) => e,
        }
    }
}

/// The seek request as signed by the identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeekInfo {
    pub channel_id: String,
    pub start: SeekPosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<SeekPosition>,
    pub full_block: bool,
    pub msp_id: String,
}

/// First frame of every session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeekFrame {
    #[serde(flatten)]
    pub seek: SeekInfo,
    /// Hex signature over the JSON encoding of `seek`.
    pub signature: String,
}

impl SeekFrame {
    pub fn signed(request: &DeliverRequest) -> Result<Self, WireError> {
        let seek = SeekInfo {
            channel_id: request.channel_id.clone(),
            start: request.start,
            stop: request.stop,
            full_block: request.full_block,
            msp_id: request.identity.msp_id().to_string(),
        };
        let message = serde_json::to_vec(&seek)?;
        let signature = request.identity.sign(&message).map_err(WireError::Signing)?;
        Ok(Self {
            seek,
            signature: hex::encode(signature),
        })
    }
}

/// Frames sent by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeliverFrame {
    Block { block: serde_json::Value },
    Status { status: DeliverStatus },
}

impl DeliverFrame {
    pub fn parse(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn into_response(self) -> Result<DeliverResponse, WireError> {
        Ok(match self {
            Self::Block { block } => DeliverResponse::Block(RawBlock::from(serde_json::to_vec(&block)?)),
            Self::Status { status } => DeliverResponse::Status(status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainevents_core::transport::SigningIdentity;
    use chainevents_core::types::PeerTarget;
    use chainevents_core::{BlockMode, BlockDecoder, JsonBlockDecoder, LedgerBlock, ValidationCode};
    use std::sync::Arc;

    /// Signs by reversing the message.
    struct ReverseSigner;

    impl SigningIdentity for ReverseSigner {
        fn msp_id(&self) -> &str {
            "Org1MSP"
        }

        fn sign(&self, message: &[u8]) -> Result<Vec<u8>, TransportError> {
            Ok(message.iter().rev().copied().collect())
        }
    }

    #[test]
    fn seek_frame_is_signed_over_seek_info() {
        let request = DeliverRequest {
            channel_id: "mychannel".into(),
            target: PeerTarget::new("wss://gateway:443").unwrap(),
            full_block: true,
            start: SeekPosition::Oldest,
            stop: Some(SeekPosition::Specified(9)),
            identity: Arc::new(ReverseSigner),
        };
        let frame = SeekFrame::signed(&request).unwrap();
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["channelId"], "mychannel");
        assert_eq!(json["start"], "oldest");
        assert_eq!(json["stop"]["specified"], 9);
        assert_eq!(json["fullBlock"], true);
        assert_eq!(json["mspId"], "Org1MSP");

        let mut signed = serde_json::to_vec(&frame.seek).unwrap();
        signed.reverse();
        assert_eq!(frame.signature, hex::encode(signed));
    }

    #[test]
    fn block_frame_decodes_into_raw_block() {
        let block = LedgerBlock::new(7, "mychannel").with_tx("tx7", ValidationCode::Valid);
        let text = serde_json::json!({ "type": "block", "block": block }).to_string();
        let response = DeliverFrame::parse(&text).unwrap().into_response().unwrap();
        let DeliverResponse::Block(raw) = response else {
            panic!("expected a block");
        };
        let decoded = JsonBlockDecoder.decode(&raw, BlockMode::Filtered).unwrap();
        assert_eq!(decoded.number, 7);
        assert_eq!(decoded.transactions[0].tx_id, "tx7");
    }

    #[test]
    fn status_frame() {
        let frame = DeliverFrame::parse(r#"{"type":"status","status":"NOT_FOUND"}"#).unwrap();
        assert_eq!(
            frame.into_response().unwrap(),
            DeliverResponse::Status(DeliverStatus::NotFound)
        );
        let err: TransportError = DeliverFrame::parse(r#"{"type":"ping"}"#).unwrap_err().into();
        assert!(matches!(err, TransportError::Protocol(_)));
    }
}
