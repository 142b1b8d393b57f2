//! Registration registry: the block, transaction and chaincode listener
//! tables owned by one hub.
//!
//! Entries are stored as `Arc`s so the dispatcher can take a snapshot at the
//! start of a block and later confirm ("claim") that the exact entry it is
//! about to fire is still registered. A listener that was removed, or
//! replaced under the same key, while the block is being dispatched is
//! skipped.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::error::EventHubError;
use crate::types::{ChaincodeEvent, DecodedBlock, ValidationCode};

/// Wildcard transaction id matching every transaction.
pub const ALL_TRANSACTIONS: &str = "ALL";

pub type BlockCallback = Arc<dyn Fn(&DecodedBlock) + Send + Sync>;
/// `(tx_id, validation_code, block_number)`
pub type TxCallback = Arc<dyn Fn(&str, ValidationCode, u64) + Send + Sync>;
/// `(event, block_number, validation_code)`; the event carries its tx id.
pub type ChaincodeCallback = Arc<dyn Fn(&ChaincodeEvent, u64, ValidationCode) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&EventHubError) + Send + Sync>;

/// Handle returned by `register_block_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHandle(u64);

/// Handle returned by `register_chaincode_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChaincodeHandle(u64);

impl std::fmt::Display for BlockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "block-{}", self.0)
    }
}

impl std::fmt::Display for ChaincodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chaincode-{}", self.0)
    }
}

/// When a registration is removed without its error callback firing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lifetime {
    /// After its first delivery.
    pub unregister_after_first: bool,
    /// Once a replay range with a numeric end block has been delivered.
    pub range_bound: bool,
}

impl Lifetime {
    pub fn range_bound(mut self, bound: bool) -> Self {
        self.range_bound = bound;
        self
    }
}

impl From<bool> for Lifetime {
    fn from(unregister_after_first: bool) -> Self {
        Self {
            unregister_after_first,
            range_bound: false,
        }
    }
}

pub struct BlockRegistration {
    pub(crate) handle: BlockHandle,
    pub(crate) on_event: BlockCallback,
    pub(crate) on_error: ErrorCallback,
    pub(crate) lifetime: Lifetime,
}

pub struct TxRegistration {
    pub(crate) tx_id: String,
    pub(crate) on_event: TxCallback,
    pub(crate) on_error: ErrorCallback,
    pub(crate) lifetime: Lifetime,
}

pub struct ChaincodeRegistration {
    pub(crate) handle: ChaincodeHandle,
    pub(crate) chaincode_id: String,
    pub(crate) pattern: Regex,
    pub(crate) on_event: ChaincodeCallback,
    pub(crate) on_error: ErrorCallback,
    pub(crate) lifetime: Lifetime,
}

impl ChaincodeRegistration {
    /// Exact chaincode id match plus regex match on the event name.
    pub fn matches(&self, event: &ChaincodeEvent) -> bool {
        self.chaincode_id == event.chaincode_id && self.pattern.is_match(&event.event_name)
    }
}

/// Registrations captured at the start of a block dispatch.
pub struct RegistrySnapshot {
    pub(crate) blocks: Vec<Arc<BlockRegistration>>,
    pub(crate) txs: HashMap<String, Arc<TxRegistration>>,
    pub(crate) chaincodes: Vec<Arc<ChaincodeRegistration>>,
}

/// The three listener tables of one hub.
#[derive(Default)]
pub struct RegistrationRegistry {
    next_handle: u64,
    blocks: HashMap<BlockHandle, Arc<BlockRegistration>>,
    txs: HashMap<String, Arc<TxRegistration>>,
    chaincodes: HashMap<ChaincodeHandle, Arc<ChaincodeRegistration>>,
}

/// Map `"all"` in any case onto the wildcard key.
pub fn normalize_tx_id(tx_id: &str) -> String {
    if tx_id.eq_ignore_ascii_case(ALL_TRANSACTIONS) {
        ALL_TRANSACTIONS.to_string()
    } else {
        tx_id.to_string()
    }
}

impl RegistrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Register a block listener.
    pub fn add_block(
        &mut self,
        on_event: BlockCallback,
        on_error: ErrorCallback,
        lifetime: impl Into<Lifetime>,
    ) -> BlockHandle {
        let handle = BlockHandle(self.next_id());
        self.blocks.insert(
            handle,
            Arc::new(BlockRegistration {
                handle,
                on_event,
                on_error,
                lifetime: lifetime.into(),
            }),
        );
        handle
    }

    /// Check that `tx_id` can be registered; returns the normalised key.
    pub fn check_tx(&self, tx_id: &str) -> Result<String, EventHubError> {
        if tx_id.is_empty() {
            return Err(EventHubError::config("Missing \"txid\" parameter"));
        }
        let key = normalize_tx_id(tx_id);
        if self.txs.contains_key(&key) {
            return Err(EventHubError::config(format!(
                "TransactionId ({key}) is already registered"
            )));
        }
        Ok(key)
    }

    /// Register a transaction listener under its exact id or the wildcard.
    pub fn add_tx(
        &mut self,
        tx_id: &str,
        on_event: TxCallback,
        on_error: ErrorCallback,
        lifetime: impl Into<Lifetime>,
    ) -> Result<String, EventHubError> {
        let key = self.check_tx(tx_id)?;
        self.txs.insert(
            key.clone(),
            Arc::new(TxRegistration {
                tx_id: key.clone(),
                on_event,
                on_error,
                lifetime: lifetime.into(),
            }),
        );
        Ok(key)
    }

    /// Compile `pattern` for a chaincode registration.
    pub fn compile_pattern(chaincode_id: &str, pattern: &str) -> Result<Regex, EventHubError> {
        if chaincode_id.is_empty() {
            return Err(EventHubError::config("Missing \"ccid\" parameter"));
        }
        if pattern.is_empty() {
            return Err(EventHubError::config("Missing \"eventname\" parameter"));
        }
        Regex::new(pattern).map_err(|e| {
            EventHubError::config(format!("invalid event name pattern '{pattern}': {e}"))
        })
    }

    /// Register a chaincode event listener.
    pub fn add_chaincode(
        &mut self,
        chaincode_id: &str,
        pattern: Regex,
        on_event: ChaincodeCallback,
        on_error: ErrorCallback,
        lifetime: impl Into<Lifetime>,
    ) -> ChaincodeHandle {
        let handle = ChaincodeHandle(self.next_id());
        self.chaincodes.insert(
            handle,
            Arc::new(ChaincodeRegistration {
                handle,
                chaincode_id: chaincode_id.to_string(),
                pattern,
                on_event,
                on_error,
                lifetime: lifetime.into(),
            }),
        );
        handle
    }

    pub fn remove_block(&mut self, handle: BlockHandle) -> bool {
        self.blocks.remove(&handle).is_some()
    }

    pub fn remove_tx(&mut self, tx_id: &str) -> bool {
        self.txs.remove(&normalize_tx_id(tx_id)).is_some()
    }

    pub fn remove_chaincode(&mut self, handle: ChaincodeHandle) -> bool {
        self.chaincodes.remove(&handle).is_some()
    }

    /// Copy the current tables, in registration order where it exists.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut blocks: Vec<_> = self.blocks.values().cloned().collect();
        blocks.sort_by_key(|r| r.handle);
        let mut chaincodes: Vec<_> = self.chaincodes.values().cloned().collect();
        chaincodes.sort_by_key(|r| r.handle);
        RegistrySnapshot {
            blocks,
            txs: self.txs.clone(),
            chaincodes,
        }
    }

    /// Returns `true` if `reg` is still registered and may fire; removes it
    /// when it only wanted its first delivery.
    pub fn claim_block(&mut self, reg: &Arc<BlockRegistration>) -> bool {
        match self.blocks.get(&reg.handle) {
            Some(current) if Arc::ptr_eq(current, reg) => {
                if reg.lifetime.unregister_after_first {
                    self.blocks.remove(&reg.handle);
                }
                true
            }
            _ => false,
        }
    }

    pub fn claim_tx(&mut self, reg: &Arc<TxRegistration>) -> bool {
        match self.txs.get(&reg.tx_id) {
            Some(current) if Arc::ptr_eq(current, reg) => {
                if reg.lifetime.unregister_after_first {
                    self.txs.remove(&reg.tx_id);
                }
                true
            }
            _ => false,
        }
    }

    pub fn claim_chaincode(&mut self, reg: &Arc<ChaincodeRegistration>) -> bool {
        match self.chaincodes.get(&reg.handle) {
            Some(current) if Arc::ptr_eq(current, reg) => {
                if reg.lifetime.unregister_after_first {
                    self.chaincodes.remove(&reg.handle);
                }
                true
            }
            _ => false,
        }
    }

    /// Remove every registration and return their error callbacks, blocks
    /// first, then transactions by id, then chaincode listeners.
    pub fn drain(&mut self) -> Vec<ErrorCallback> {
        let mut blocks: Vec<_> = self.blocks.drain().map(|(_, r)| r).collect();
        blocks.sort_by_key(|r| r.handle);
        let mut txs: Vec<_> = self.txs.drain().map(|(_, r)| r).collect();
        txs.sort_by(|a, b| a.tx_id.cmp(&b.tx_id));
        let mut chaincodes: Vec<_> = self.chaincodes.drain().map(|(_, r)| r).collect();
        chaincodes.sort_by_key(|r| r.handle);

        blocks
            .into_iter()
            .map(|r| r.on_error.clone())
            .chain(txs.into_iter().map(|r| r.on_error.clone()))
            .chain(chaincodes.into_iter().map(|r| r.on_error.clone()))
            .collect()
    }

    /// Remove every range-bound registration without notifying it.
    /// Returns how many were removed.
    pub fn remove_range_bound(&mut self) -> usize {
        let before = self.len();
        self.blocks.retain(|_, r| !r.lifetime.range_bound);
        self.txs.retain(|_, r| !r.lifetime.range_bound);
        self.chaincodes.retain(|_, r| !r.lifetime.range_bound);
        before - self.len()
    }

    pub fn tx_count(&self) -> usize {
        self.txs.len()
    }

    pub fn chaincode_count(&self) -> usize {
        self.chaincodes.len()
    }

    /// Total number of registrations.
    pub fn len(&self) -> usize {
        self.blocks.len() + self.txs.len() + self.chaincodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn noop_error() -> ErrorCallback {
        Arc::new(|_: &EventHubError| {})
    }

    fn noop_tx() -> TxCallback {
        Arc::new(|_: &str, _: ValidationCode, _: u64| {})
    }

    fn noop_chaincode() -> ChaincodeCallback {
        Arc::new(|_: &ChaincodeEvent, _: u64, _: ValidationCode| {})
    }

    #[test]
    fn duplicate_tx_ids_are_rejected() {
        let mut reg = RegistrationRegistry::new();
        reg.add_tx("tx1", noop_tx(), noop_error(), true).unwrap();
        let err = reg.add_tx("tx1", noop_tx(), noop_error(), true).unwrap_err();
        assert!(err.is_config());

        // wildcard coexists with exact ids, and is matched case-insensitively
        assert_eq!(reg.add_tx("all", noop_tx(), noop_error(), false).unwrap(), "ALL");
        assert!(reg.add_tx("ALL", noop_tx(), noop_error(), false).is_err());
        assert_eq!(reg.tx_count(), 2);
    }

    #[test]
    fn claim_removes_one_shot_entries() {
        let mut reg = RegistrationRegistry::new();
        reg.add_tx("tx1", noop_tx(), noop_error(), true).unwrap();
        reg.add_tx("ALL", noop_tx(), noop_error(), false).unwrap();
        let snap = reg.snapshot();

        let exact = snap.txs.get("tx1").unwrap();
        assert!(reg.claim_tx(exact));
        assert!(!reg.claim_tx(exact), "one-shot entry must not fire twice");

        let all = snap.txs.get(ALL_TRANSACTIONS).unwrap();
        assert!(reg.claim_tx(all));
        assert!(reg.claim_tx(all));
        assert_eq!(reg.tx_count(), 1);
    }

    #[test]
    fn replaced_entry_is_not_claimed_from_old_snapshot() {
        let mut reg = RegistrationRegistry::new();
        reg.add_tx("tx1", noop_tx(), noop_error(), false).unwrap();
        let snap = reg.snapshot();
        reg.remove_tx("tx1");
        reg.add_tx("tx1", noop_tx(), noop_error(), false).unwrap();
        assert!(!reg.claim_tx(snap.txs.get("tx1").unwrap()));
    }

    #[test]
    fn drain_returns_every_error_callback_once() {
        let count = Arc::new(AtomicU32::new(0));
        let counting: ErrorCallback = {
            let count = count.clone();
            Arc::new(move |_: &EventHubError| {
                count.fetch_add(1, Ordering::Relaxed);
            })
        };
        let mut reg = RegistrationRegistry::new();
        reg.add_block(Arc::new(|_: &DecodedBlock| {}), counting.clone(), false);
        reg.add_tx("tx1", noop_tx(), counting.clone(), true).unwrap();
        let pattern = RegistrationRegistry::compile_pattern("cc1", "^evt.*").unwrap();
        reg.add_chaincode("cc1", pattern, noop_chaincode(), counting, false);

        for cb in reg.drain() {
            cb(&EventHubError::Shutdown);
        }
        assert_eq!(count.load(Ordering::Relaxed), 3);
        assert!(reg.is_empty());
        assert!(reg.drain().is_empty());
    }

    #[test]
    fn range_bound_entries_leave_quietly() {
        let mut reg = RegistrationRegistry::new();
        let replay = Lifetime::from(false).range_bound(true);
        reg.add_block(Arc::new(|_: &DecodedBlock| {}), noop_error(), replay);
        reg.add_block(Arc::new(|_: &DecodedBlock| {}), noop_error(), false);
        reg.add_tx("tx1", noop_tx(), noop_error(), Lifetime::from(true).range_bound(true))
            .unwrap();
        reg.add_tx("ALL", noop_tx(), noop_error(), false).unwrap();

        assert_eq!(reg.remove_range_bound(), 2);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.tx_count(), 1);
        assert_eq!(reg.remove_range_bound(), 0);
    }

    #[test]
    fn chaincode_matching() {
        let pattern = RegistrationRegistry::compile_pattern("cc1", "^evt.*").unwrap();
        let mut reg = RegistrationRegistry::new();
        reg.add_chaincode("cc1", pattern, noop_chaincode(), noop_error(), false);
        let snap = reg.snapshot();
        let ev = |cc: &str, name: &str| ChaincodeEvent {
            chaincode_id: cc.into(),
            tx_id: "t".into(),
            event_name: name.into(),
            payload: None,
        };
        assert!(snap.chaincodes[0].matches(&ev("cc1", "evtA")));
        assert!(!snap.chaincodes[0].matches(&ev("cc1", "other")));
        assert!(!snap.chaincodes[0].matches(&ev("cc2", "evtA")));

        assert!(RegistrationRegistry::compile_pattern("cc1", "(").is_err());
        assert!(RegistrationRegistry::compile_pattern("", "x").is_err());
    }
}
