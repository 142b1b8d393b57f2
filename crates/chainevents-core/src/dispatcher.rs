//! Event dispatcher: fires the registrations matching one decoded block.
//!
//! Order within a block:
//! 1. every block listener, in registration order;
//! 2. for each transaction in block order, the exact-id listener and then
//!    the `"ALL"` listener;
//! 3. for each transaction in block order, each of its chaincode events
//!    against every chaincode listener, in registration order.
//!
//! Registrations are snapshotted when the block starts. Before each callback
//! the dispatcher claims the entry through [`RegistryAccess`]; callbacks run
//! without any lock held so they may register, unregister or disconnect.

use crate::registry::{RegistrationRegistry, ALL_TRANSACTIONS};
use crate::types::DecodedBlock;

/// Locked access to the registry for the duration of one closure.
///
/// Returns `None` once the session that started the dispatch is no longer
/// current (the hub was disconnected or reconnected), which stops the
/// dispatch.
pub trait RegistryAccess {
    fn with_registry<R>(&self, f: impl FnOnce(&mut RegistrationRegistry) -> R) -> Option<R>;
}

impl RegistryAccess for std::sync::Mutex<RegistrationRegistry> {
    fn with_registry<R>(&self, f: impl FnOnce(&mut RegistrationRegistry) -> R) -> Option<R> {
        let mut guard = self.lock().unwrap_or_else(|e| e.into_inner());
        Some(f(&mut guard))
    }
}

/// Counters for one dispatched block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub block_events: u32,
    pub tx_events: u32,
    pub chaincode_events: u32,
    /// `true` if the dispatch stopped early because the session ended.
    pub interrupted: bool,
}

/// Dispatch `block` to every matching registration.
pub fn dispatch<A: RegistryAccess>(access: &A, block: &DecodedBlock) -> DispatchStats {
    let mut stats = DispatchStats::default();
    let Some(snapshot) = access.with_registry(|r| r.snapshot()) else {
        stats.interrupted = true;
        return stats;
    };

    for reg in &snapshot.blocks {
        match access.with_registry(|r| r.claim_block(reg)) {
            Some(true) => {
                (reg.on_event)(block);
                stats.block_events += 1;
            }
            Some(false) => {}
            None => {
                stats.interrupted = true;
                return stats;
            }
        }
    }

    let wildcard = snapshot.txs.get(ALL_TRANSACTIONS);
    for tx in &block.transactions {
        let exact = if tx.tx_id == ALL_TRANSACTIONS {
            None
        } else {
            snapshot.txs.get(&tx.tx_id)
        };
        for reg in exact.into_iter().chain(wildcard) {
            match access.with_registry(|r| r.claim_tx(reg)) {
                Some(true) => {
                    (reg.on_event)(&tx.tx_id, tx.validation_code, block.number);
                    stats.tx_events += 1;
                }
                Some(false) => {}
                None => {
                    stats.interrupted = true;
                    return stats;
                }
            }
        }
    }

    if snapshot.chaincodes.is_empty() {
        return stats;
    }
    for tx in &block.transactions {
        for event in &tx.chaincode_events {
            for reg in snapshot.chaincodes.iter().filter(|r| r.matches(event)) {
                match access.with_registry(|r| r.claim_chaincode(reg)) {
                    Some(true) => {
                        (reg.on_event)(event, block.number, tx.validation_code);
                        stats.chaincode_events += 1;
                    }
                    Some(false) => {}
                    None => {
                        stats.interrupted = true;
                        return stats;
                    }
                }
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EventHubError;
    use crate::registry::ErrorCallback;
    use crate::types::{BlockMode, ChaincodeEvent, TransactionSummary, ValidationCode};
    use std::sync::{Arc, Mutex};

    fn block(number: u64, txs: Vec<(&str, ValidationCode, Vec<(&str, &str)>)>) -> DecodedBlock {
        DecodedBlock {
            number,
            channel_id: "mychannel".into(),
            mode: BlockMode::Filtered,
            transactions: txs
                .into_iter()
                .map(|(id, code, events)| TransactionSummary {
                    tx_id: id.to_string(),
                    validation_code: code,
                    chaincode_events: events
                        .iter()
                        .map(|(cc, name)| ChaincodeEvent {
                            chaincode_id: cc.to_string(),
                            tx_id: id.to_string(),
                            event_name: name.to_string(),
                            payload: None,
                        })
                        .collect(),
                    envelope: None,
                })
                .collect(),
        }
    }

    fn noop_error() -> ErrorCallback {
        Arc::new(|_: &EventHubError| {})
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, tag: &'static str) -> crate::registry::TxCallback {
        let log = log.clone();
        Arc::new(move |tx_id: &str, code: ValidationCode, n: u64| {
            log.lock().unwrap().push(format!("{tag}:{tx_id}:{code}:{n}"));
        })
    }

    #[test]
    fn exact_and_wildcard_fire_independently() {
        let log: Log = Arc::default();
        let registry = Mutex::new(RegistrationRegistry::new());
        {
            let mut r = registry.lock().unwrap();
            r.add_tx("tx1", recorder(&log, "exact"), noop_error(), true).unwrap();
            r.add_tx("ALL", recorder(&log, "all"), noop_error(), false).unwrap();
        }

        let b = block(
            3,
            vec![("tx1", ValidationCode::Valid, vec![]), ("tx2", ValidationCode::MvccReadConflict, vec![])],
        );
        let stats = dispatch(&registry, &b);

        assert_eq!(stats.tx_events, 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "exact:tx1:VALID:3".to_string(),
                "all:tx1:VALID:3".to_string(),
                "all:tx2:MVCC_READ_CONFLICT:3".to_string(),
            ]
        );
        // one-shot exact entry is gone, wildcard remains
        assert_eq!(registry.lock().unwrap().tx_count(), 1);

        // a replayed block does not reach the removed listener
        log.lock().unwrap().clear();
        dispatch(&registry, &b);
        assert!(log.lock().unwrap().iter().all(|l| l.starts_with("all:")));
    }

    #[test]
    fn chaincode_pattern_filters_event_names() {
        let hits: Arc<Mutex<Vec<String>>> = Arc::default();
        let registry = Mutex::new(RegistrationRegistry::new());
        {
            let hits = hits.clone();
            let pattern = RegistrationRegistry::compile_pattern("cc1", "^evt.*").unwrap();
            registry.lock().unwrap().add_chaincode(
                "cc1",
                pattern,
                Arc::new(move |ev: &ChaincodeEvent, n: u64, code: ValidationCode| {
                    hits.lock().unwrap().push(format!("{}:{}:{}:{}", ev.event_name, n, ev.tx_id, code));
                }),
                noop_error(),
                false,
            );
        }

        let b = block(
            9,
            vec![("tx9", ValidationCode::Valid, vec![("cc1", "evtA"), ("cc1", "other"), ("cc2", "evtB")])],
        );
        let stats = dispatch(&registry, &b);

        assert_eq!(stats.chaincode_events, 1);
        assert_eq!(*hits.lock().unwrap(), vec!["evtA:9:tx9:VALID".to_string()]);
    }

    #[test]
    fn multiple_chaincode_listeners_all_fire() {
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let registry = Mutex::new(RegistrationRegistry::new());
        for _ in 0..2 {
            let count = count.clone();
            let pattern = RegistrationRegistry::compile_pattern("cc1", "^evtsender").unwrap();
            registry.lock().unwrap().add_chaincode(
                "cc1",
                pattern,
                Arc::new(move |_: &ChaincodeEvent, _: u64, _: ValidationCode| {
                    count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }),
                noop_error(),
                true,
            );
        }
        let b = block(1, vec![("t", ValidationCode::Valid, vec![("cc1", "evtsender"), ("cc1", "evtsender")])]);
        dispatch(&registry, &b);
        // each one-shot listener fires exactly once even with two matching events
        assert_eq!(count.load(std::sync::atomic::Ordering::Relaxed), 2);
        assert_eq!(registry.lock().unwrap().chaincode_count(), 0);
    }

    /// Access that stops answering after `budget` calls, like a hub that was
    /// disconnected from inside a callback.
    struct Expiring {
        registry: Mutex<RegistrationRegistry>,
        budget: Mutex<u32>,
    }

    impl RegistryAccess for Expiring {
        fn with_registry<R>(&self, f: impl FnOnce(&mut RegistrationRegistry) -> R) -> Option<R> {
            let mut budget = self.budget.lock().unwrap();
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
            Some(f(&mut self.registry.lock().unwrap()))
        }
    }

    #[test]
    fn dispatch_stops_when_session_ends() {
        let fired = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let mut registry = RegistrationRegistry::new();
        for _ in 0..3 {
            let fired = fired.clone();
            registry.add_block(
                Arc::new(move |_: &DecodedBlock| {
                    fired.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }),
                noop_error(),
                false,
            );
        }
        // snapshot + two claims
        let access = Expiring {
            registry: Mutex::new(registry),
            budget: Mutex::new(3),
        };
        let stats = dispatch(&access, &block(0, vec![]));
        assert!(stats.interrupted);
        assert_eq!(fired.load(std::sync::atomic::Ordering::Relaxed), 2);
    }
}
