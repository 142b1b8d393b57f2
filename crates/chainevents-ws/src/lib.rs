//! chainevents-ws — WebSocket deliver transport for the channel event hub.
//!
//! # Features
//! - One signed seek frame per session
//! - Block and status frames mapped onto the hub's deliver stream
//! - Bounded handshake and frame size

pub mod client;
pub mod wire;

pub use client::{gateway_url, WsDeliverConfig, WsDeliverTransport};
pub use wire::{DeliverFrame, SeekFrame, SeekInfo, WireError};
