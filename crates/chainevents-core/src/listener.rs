//! Channel-based adapters over the callback registrations.
//!
//! Each `subscribe_*` call registers a callback pair that forwards into an
//! unbounded `mpsc` channel, so consumers can `recv().await` instead of
//! writing callbacks. The error sweep arrives as a final
//! [`Notification::Failed`].

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::error::EventHubError;
use crate::hub::ChannelEventHub;
use crate::options::RegistrationOptions;
use crate::registry::{BlockHandle, ChaincodeHandle};
use crate::types::{ChaincodeEvent, DecodedBlock, ValidationCode};

/// One item delivered to a channel subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification<T> {
    Delivered(T),
    Failed(EventHubError),
}

impl<T> Notification<T> {
    pub fn into_result(self) -> Result<T, EventHubError> {
        match self {
            Self::Delivered(v) => Ok(v),
            Self::Failed(e) => Err(e),
        }
    }
}

/// Commit status of one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxStatus {
    pub tx_id: String,
    pub validation_code: ValidationCode,
    pub block_number: u64,
}

/// A chaincode event together with where it was committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChaincodeNotice {
    pub event: ChaincodeEvent,
    pub block_number: u64,
    pub validation_code: ValidationCode,
}

pub type Subscription<T> = mpsc::UnboundedReceiver<Notification<T>>;

fn forward_errors<T: Send + 'static>(
    tx: &mpsc::UnboundedSender<Notification<T>>,
) -> impl Fn(&EventHubError) + Send + Sync + 'static {
    let tx = tx.clone();
    move |err: &EventHubError| {
        let _ = tx.send(Notification::Failed(err.clone()));
    }
}

impl ChannelEventHub {
    /// Stream every decoded block.
    pub fn subscribe_blocks(
        &self,
        options: RegistrationOptions,
    ) -> Result<(BlockHandle, Subscription<DecodedBlock>), EventHubError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let on_error = forward_errors(&tx);
        let handle = self.register_block_event(
            move |block: &DecodedBlock| {
                let _ = tx.send(Notification::Delivered(block.clone()));
            },
            on_error,
            options,
        )?;
        Ok((handle, rx))
    }

    /// Stream commit statuses for `tx_id` (or `"ALL"`).
    pub fn subscribe_tx(
        &self,
        tx_id: &str,
        options: RegistrationOptions,
    ) -> Result<(String, Subscription<TxStatus>), EventHubError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let on_error = forward_errors(&tx);
        let key = self.register_tx_event(
            tx_id,
            move |tx_id: &str, validation_code: ValidationCode, block_number: u64| {
                let _ = tx.send(Notification::Delivered(TxStatus {
                    tx_id: tx_id.to_string(),
                    validation_code,
                    block_number,
                }));
            },
            on_error,
            options,
        )?;
        Ok((key, rx))
    }

    /// Stream chaincode events from `chaincode_id` whose name matches
    /// `event_pattern`.
    pub fn subscribe_chaincode(
        &self,
        chaincode_id: &str,
        event_pattern: &str,
        options: RegistrationOptions,
    ) -> Result<(ChaincodeHandle, Subscription<ChaincodeNotice>), EventHubError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let on_error = forward_errors(&tx);
        let handle = self.register_chaincode_event(
            chaincode_id,
            event_pattern,
            move |event: &ChaincodeEvent, block_number: u64, validation_code: ValidationCode| {
                let _ = tx.send(Notification::Delivered(ChaincodeNotice {
                    event: event.clone(),
                    block_number,
                    validation_code,
                }));
            },
            on_error,
            options,
        )?;
        Ok((handle, rx))
    }

    /// Register a one-shot listener for `tx_id` and wait for its commit
    /// status. Resolves with the first of the delivery or the error sweep.
    ///
    /// The listener is registered before the future is first polled, so the
    /// hub may be connected right after this call returns.
    pub fn wait_for_tx(
        &self,
        tx_id: &str,
    ) -> Result<impl std::future::Future<Output = Result<TxStatus, EventHubError>>, EventHubError>
    {
        let (tx, rx) = oneshot::channel::<Result<TxStatus, EventHubError>>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let on_error_slot = slot.clone();
        self.register_tx_event(
            tx_id,
            move |tx_id: &str, validation_code: ValidationCode, block_number: u64| {
                let sender = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
                if let Some(sender) = sender {
                    let _ = sender.send(Ok(TxStatus {
                        tx_id: tx_id.to_string(),
                        validation_code,
                        block_number,
                    }));
                }
            },
            move |err: &EventHubError| {
                let sender = on_error_slot.lock().unwrap_or_else(|e| e.into_inner()).take();
                if let Some(sender) = sender {
                    let _ = sender.send(Err(err.clone()));
                }
            },
            RegistrationOptions::new().unregister(true),
        )
        .map(|_| async move { rx.await.unwrap_or(Err(EventHubError::Shutdown)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_into_result() {
        let ok: Notification<u32> = Notification::Delivered(3);
        assert_eq!(ok.into_result(), Ok(3));
        let failed: Notification<u32> = Notification::Failed(EventHubError::Shutdown);
        assert_eq!(failed.into_result(), Err(EventHubError::Shutdown));
    }
}
