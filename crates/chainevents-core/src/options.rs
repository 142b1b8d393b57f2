//! Options accepted by `connect`/`reconnect` and by the register calls.

use crate::error::EventHubError;
use crate::types::{EndBlock, PeerTarget, ReplayWindow, StartBlock};

/// Options for [`ChannelEventHub::connect`] and [`ChannelEventHub::reconnect`].
///
/// [`ChannelEventHub::connect`]: crate::hub::ChannelEventHub::connect
/// [`ChannelEventHub::reconnect`]: crate::hub::ChannelEventHub::reconnect
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Deliver full blocks instead of filtered blocks.
    pub full_block: bool,
    pub start_block: Option<StartBlock>,
    pub end_block: Option<EndBlock>,
    /// Stream from a different peer. The hub's name and address switch to
    /// this target once the new session is ready.
    pub target: Option<PeerTarget>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn full_block(mut self, full: bool) -> Self {
        self.full_block = full;
        self
    }

    pub fn start_block(mut self, start: StartBlock) -> Self {
        self.start_block = Some(start);
        self
    }

    pub fn end_block(mut self, end: EndBlock) -> Self {
        self.end_block = Some(end);
        self
    }

    pub fn target(mut self, target: PeerTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub(crate) fn window(&self) -> Result<ReplayWindow, EventHubError> {
        ReplayWindow::new(self.start_block, self.end_block)
    }
}

/// Per-registration options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistrationOptions {
    /// Replay window to adopt for the next connection attempt.
    pub start_block: Option<StartBlock>,
    pub end_block: Option<EndBlock>,
    /// Remove the registration after its first delivery. `None` uses the
    /// default for the registration kind.
    pub unregister: Option<bool>,
}

impl RegistrationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_block(mut self, start: StartBlock) -> Self {
        self.start_block = Some(start);
        self
    }

    pub fn end_block(mut self, end: EndBlock) -> Self {
        self.end_block = Some(end);
        self
    }

    pub fn unregister(mut self, unregister: bool) -> Self {
        self.unregister = Some(unregister);
        self
    }

    /// Shorthand for a replay of `[start, end]`.
    pub fn replay(start: StartBlock, end: EndBlock) -> Self {
        Self {
            start_block: Some(start),
            end_block: Some(end),
            unregister: None,
        }
    }

    pub(crate) fn window(&self) -> Result<ReplayWindow, EventHubError> {
        ReplayWindow::new(self.start_block, self.end_block)
    }
}
