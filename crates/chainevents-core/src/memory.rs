//! In-memory ledger, a `DeliverTransport` for testing and demos.
//!
//! Blocks appended to the ledger are served to every session whose range
//! covers them. Sessions replay from their start position, wait for live
//! blocks past the current height, and finish with `Status(Success)` once
//! their stop position has been sent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::decoder::LedgerBlock;
use crate::error::{DecodeError, TransportError};
use crate::transport::{
    DeliverRequest, DeliverResponse, DeliverStatus, DeliverStream, DeliverTransport, RawBlock,
};
use crate::types::SeekPosition;

type Feed = mpsc::UnboundedSender<Result<DeliverResponse, TransportError>>;

/// Shared in-memory ledger for one channel.
///
/// Cloning is cheap; clones share the same blocks and peers.
#[derive(Clone)]
pub struct MemoryLedger {
    inner: Arc<LedgerInner>,
}

struct LedgerInner {
    channel_id: String,
    blocks: Mutex<Vec<RawBlock>>,
    /// Current height; bumped on every append.
    height: watch::Sender<u64>,
    /// Bumped by `drop_sessions` to break every open session.
    generation: watch::Sender<u64>,
    /// addr → online
    peers: Mutex<HashMap<String, bool>>,
}

impl LedgerInner {
    fn blocks(&self) -> MutexGuard<'_, Vec<RawBlock>> {
        self.blocks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MemoryLedger {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                channel_id: channel_id.into(),
                blocks: Mutex::new(Vec::new()),
                height: watch::Sender::new(0),
                generation: watch::Sender::new(0),
                peers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.inner.channel_id
    }

    /// Accept sessions addressed to `addr` (`host:port`).
    pub fn serve(&self, addr: impl Into<String>) {
        self.peers().insert(addr.into(), true);
    }

    /// Refuse new sessions addressed to `addr`. Open sessions are unaffected.
    pub fn take_offline(&self, addr: &str) {
        if let Some(online) = self.peers().get_mut(addr) {
            *online = false;
        }
    }

    /// Break every open session with a transport error.
    pub fn drop_sessions(&self) {
        self.inner.generation.send_modify(|g| *g += 1);
    }

    /// Commit `block` as the next block; its number and channel are set by
    /// the ledger. Returns the assigned number.
    pub fn append(&self, mut block: LedgerBlock) -> Result<u64, DecodeError> {
        let mut blocks = self.inner.blocks();
        let number = blocks.len() as u64;
        block.number = number;
        block.channel_id = self.inner.channel_id.clone();
        blocks.push(block.to_raw()?);
        drop(blocks);
        self.inner.height.send_modify(|h| *h = number + 1);
        Ok(number)
    }

    /// Commit an arbitrary message as the next block.
    pub fn append_raw(&self, raw: RawBlock) -> u64 {
        let mut blocks = self.inner.blocks();
        let number = blocks.len() as u64;
        blocks.push(raw);
        drop(blocks);
        self.inner.height.send_modify(|h| *h = number + 1);
        number
    }

    pub fn height(&self) -> u64 {
        *self.inner.height.borrow()
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<String, bool>> {
        self.inner.peers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for MemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLedger")
            .field("channel_id", &self.inner.channel_id)
            .field("height", &self.height())
            .finish()
    }
}

#[async_trait]
impl DeliverTransport for MemoryLedger {
    async fn open(&self, request: DeliverRequest) -> Result<DeliverStream, TransportError> {
        let addr = request.target.addr().to_string();
        if self.peers().get(&addr) != Some(&true) {
            return Err(TransportError::Unavailable { target: addr });
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream: DeliverStream =
            Box::pin(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)));

        if request.channel_id != self.inner.channel_id {
            let _ = tx.send(Ok(DeliverResponse::Status(DeliverStatus::NotFound)));
            return Ok(stream);
        }

        // Subscribe before reading the height so no append or drop is missed.
        let height_rx = self.inner.height.subscribe();
        let generation_rx = self.inner.generation.subscribe();
        let height = self.height();
        let start = match request.start {
            SeekPosition::Oldest => 0,
            SeekPosition::Newest => height.saturating_sub(1),
            SeekPosition::Specified(n) => n,
        };
        let stop = match request.stop {
            None => None,
            Some(SeekPosition::Oldest) => Some(0),
            Some(SeekPosition::Newest) if height == 0 => {
                let _ = tx.send(Ok(DeliverResponse::Status(DeliverStatus::NotFound)));
                return Ok(stream);
            }
            Some(SeekPosition::Newest) => Some(height - 1),
            Some(SeekPosition::Specified(n)) => Some(n),
        };
        if matches!(stop, Some(stop) if start > stop) {
            let _ = tx.send(Ok(DeliverResponse::Status(DeliverStatus::BadRequest)));
            return Ok(stream);
        }

        debug!(peer = %addr, start, ?stop, height, "memory ledger session opened");
        tokio::spawn(feed(self.inner.clone(), start, stop, tx, height_rx, generation_rx));
        Ok(stream)
    }

    fn kind(&self) -> &str {
        "memory"
    }
}

async fn feed(
    inner: Arc<LedgerInner>,
    start: u64,
    stop: Option<u64>,
    tx: Feed,
    mut height_rx: watch::Receiver<u64>,
    mut generation_rx: watch::Receiver<u64>,
) {
    let mut next = start;
    loop {
        loop {
            if matches!(stop, Some(stop) if next > stop) {
                let _ = tx.send(Ok(DeliverResponse::Status(DeliverStatus::Success)));
                return;
            }
            let block = inner.blocks().get(next as usize).cloned();
            let Some(block) = block else { break };
            if tx.send(Ok(DeliverResponse::Block(block))).is_err() {
                return;
            }
            next += 1;
        }
        tokio::select! {
            changed = height_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = generation_rx.changed() => {
                let _ = tx.send(Err(TransportError::Io("session dropped by ledger".into())));
                return;
            }
            _ = tx.closed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::UnsignedIdentity;
    use crate::types::{PeerTarget, ValidationCode};
    use futures::StreamExt;
    use std::time::Duration;

    const ADDR: &str = "localhost:7051";

    fn request(start: SeekPosition, stop: Option<SeekPosition>) -> DeliverRequest {
        DeliverRequest {
            channel_id: "mychannel".into(),
            target: PeerTarget::new("grpcs://localhost:7051").unwrap(),
            full_block: false,
            start,
            stop,
            identity: Arc::new(UnsignedIdentity::new("Org1MSP")),
        }
    }

    fn ledger(blocks: u64) -> MemoryLedger {
        let ledger = MemoryLedger::new("mychannel");
        ledger.serve(ADDR);
        for i in 0..blocks {
            ledger
                .append(LedgerBlock::new(0, "").with_tx(format!("tx{i}"), ValidationCode::Valid))
                .unwrap();
        }
        ledger
    }

    async fn next(stream: &mut DeliverStream) -> DeliverResponse {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .expect("transport error")
    }

    #[tokio::test]
    async fn replays_range_then_success() {
        let ledger = ledger(4);
        assert_eq!(ledger.height(), 4);
        let mut stream = ledger
            .open(request(SeekPosition::Specified(1), Some(SeekPosition::Specified(2))))
            .await
            .unwrap();
        assert!(matches!(next(&mut stream).await, DeliverResponse::Block(_)));
        assert!(matches!(next(&mut stream).await, DeliverResponse::Block(_)));
        assert_eq!(next(&mut stream).await, DeliverResponse::Status(DeliverStatus::Success));
    }

    #[tokio::test]
    async fn live_session_waits_for_appends() {
        let ledger = ledger(1);
        let mut stream = ledger.open(request(SeekPosition::Newest, None)).await.unwrap();
        assert!(matches!(next(&mut stream).await, DeliverResponse::Block(_)));
        ledger.append(LedgerBlock::new(0, "")).unwrap();
        match next(&mut stream).await {
            DeliverResponse::Block(raw) => {
                let block: LedgerBlock = serde_json::from_slice(raw.as_bytes()).unwrap();
                assert_eq!(block.number, 1);
                assert_eq!(block.channel_id, "mychannel");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn offline_peer_is_unavailable() {
        let ledger = ledger(0);
        ledger.take_offline(ADDR);
        let err = ledger.open(request(SeekPosition::Oldest, None)).await.err().unwrap();
        assert_eq!(err, TransportError::Unavailable { target: ADDR.into() });
    }

    #[tokio::test]
    async fn newest_on_empty_ledger_is_not_found() {
        let ledger = ledger(0);
        let mut stream = ledger
            .open(request(SeekPosition::Oldest, Some(SeekPosition::Newest)))
            .await
            .unwrap();
        assert_eq!(next(&mut stream).await, DeliverResponse::Status(DeliverStatus::NotFound));
    }

    #[tokio::test]
    async fn drop_sessions_breaks_open_streams() {
        let ledger = ledger(0);
        let mut stream = ledger.open(request(SeekPosition::Oldest, None)).await.unwrap();
        ledger.drop_sessions();
        let item = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(item, Err(TransportError::Io(_))));
    }
}
