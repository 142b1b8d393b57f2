//! `ChannelEventHub`: connection state machine for one peer and one channel.
//!
//! ```text
//!            connect()                 session ready
//! DISCONNECTED ───────────▶ CONNECTING ───────────────▶ CONNECTED
//!      ▲                        │                           │
//!      │   open failure /       │                           │ disconnect(), stream
//!      └────────────────────────┴───────────────────────────┘ error, end of range
//! ```
//!
//! Every connection attempt gets a new epoch. The background session task
//! carries the epoch it was started with and stops touching the hub as soon
//! as the epoch moves on, so a superseded session never fires callbacks.
//!
//! Listener callbacks run on the session task (or on the caller of
//! `disconnect`) without the hub lock held. A callback that panics unwinds
//! the session task; handling its own failures is the listener's job.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::decoder::BlockDecoder;
use crate::dispatcher::{self, RegistryAccess};
use crate::error::EventHubError;
use crate::options::{ConnectOptions, RegistrationOptions};
use crate::registry::{
    BlockHandle, ChaincodeHandle, Lifetime, RegistrationRegistry, ALL_TRANSACTIONS,
};
use crate::transport::{
    DeliverRequest, DeliverResponse, DeliverStatus, DeliverTransport, RawBlock, SigningIdentity,
};
use crate::types::{
    BlockMode, ChaincodeEvent, ConnectionState, DecodedBlock, EndBlock, PeerTarget, ReplayWindow,
    ValidationCode,
};

/// Completion callback for `connect`/`reconnect`.
pub type ConnectCallback = Box<dyn FnOnce(Result<ChannelEventHub, EventHubError>) + Send>;

/// Event subscription and replay client for one channel on one peer.
///
/// Cloning is cheap; all clones share the same connection and registrations.
#[derive(Clone)]
pub struct ChannelEventHub {
    inner: Arc<HubInner>,
}

pub(crate) struct HubInner {
    channel_id: String,
    transport: Arc<dyn DeliverTransport>,
    decoder: Arc<dyn BlockDecoder>,
    identity: Option<Arc<dyn SigningIdentity>>,
    state: Mutex<HubState>,
}

struct HubState {
    connection: ConnectionState,
    target: PeerTarget,
    /// Target of the attempt in progress; becomes `target` once ready.
    pending_target: Option<PeerTarget>,
    epoch: u64,
    /// Dropping or firing this closes the running session.
    session: Option<oneshot::Sender<()>>,
    mode: BlockMode,
    window: ReplayWindow,
    /// A registration or connect call has fixed the window for this attempt.
    window_fixed: bool,
    last_block: Option<u64>,
    connect_callbacks: Vec<ConnectCallback>,
    registry: RegistrationRegistry,
}

impl HubState {
    /// Tear down the current attempt without touching registrations.
    fn end_session(&mut self) {
        if let Some(close) = self.session.take() {
            let _ = close.send(());
        }
        self.epoch += 1;
        self.connection = ConnectionState::Disconnected;
        self.pending_target = None;
        self.window = ReplayWindow::default();
        self.window_fixed = false;
    }

    /// Window for a registration request, without adopting it yet.
    fn check_registration_window(
        &self,
        options: &RegistrationOptions,
    ) -> Result<Option<ReplayWindow>, EventHubError> {
        let window = options.window()?;
        if window.is_empty() {
            return Ok(None);
        }
        if self.connection != ConnectionState::Disconnected {
            return Err(EventHubError::config(
                "The registration with a startBlock or endBlock must be done before calling connect()",
            ));
        }
        if self.window_fixed && self.window != window {
            return Err(EventHubError::config(format!(
                "A replay window ({:?}..{:?}) is already requested for the next connection",
                self.window.start, self.window.end
            )));
        }
        Ok(Some(window))
    }

    fn adopt_window(&mut self, window: Option<ReplayWindow>) {
        if let Some(window) = window {
            self.window = window;
            self.window_fixed = true;
        }
    }
}

impl ChannelEventHub {
    pub(crate) fn from_parts(
        channel_id: String,
        target: PeerTarget,
        transport: Arc<dyn DeliverTransport>,
        decoder: Arc<dyn BlockDecoder>,
        identity: Option<Arc<dyn SigningIdentity>>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                channel_id,
                transport,
                decoder,
                identity,
                state: Mutex::new(HubState {
                    connection: ConnectionState::Disconnected,
                    target,
                    pending_target: None,
                    epoch: 0,
                    session: None,
                    mode: BlockMode::Filtered,
                    window: ReplayWindow::default(),
                    window_fixed: false,
                    last_block: None,
                    connect_callbacks: vec![],
                    registry: RegistrationRegistry::new(),
                }),
            }),
        }
    }

    // ─── Identity / state queries ────────────────────────────────────────────

    /// Display name of the bound peer.
    pub fn name(&self) -> String {
        self.inner.lock().target.name().to_string()
    }

    /// `host:port` of the bound peer.
    pub fn peer_addr(&self) -> String {
        self.inner.lock().target.addr().to_string()
    }

    pub fn channel_id(&self) -> &str {
        &self.inner.channel_id
    }

    /// `true` only once the session is ready.
    pub fn is_connected(&self) -> bool {
        self.inner.lock().connection == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock().connection
    }

    /// Number of the last block dispatched by this hub, across reconnects.
    pub fn last_block_number(&self) -> Option<u64> {
        self.inner.lock().last_block
    }

    /// Number of registrations currently held.
    pub fn registration_count(&self) -> usize {
        self.inner.lock().registry.len()
    }

    // ─── Connection lifecycle ────────────────────────────────────────────────

    /// Start connecting. Returns immediately; `callback` receives the hub once
    /// the session is ready, or the error if opening it failed.
    ///
    /// Configuration errors are returned synchronously. Calling `connect`
    /// while already connecting or connected does not open a second session.
    /// Must be called from within a Tokio runtime.
    pub fn connect(
        &self,
        options: ConnectOptions,
        callback: Option<ConnectCallback>,
    ) -> Result<(), EventHubError> {
        let state = self.inner.lock();
        self.start_session(state, options, callback)
    }

    /// Close the current session (if any) and open a new one, keeping every
    /// registration so the new session's replay reaches the same listeners.
    /// A replay window registered since the last session ended is kept.
    pub fn reconnect(
        &self,
        options: ConnectOptions,
        callback: Option<ConnectCallback>,
    ) -> Result<(), EventHubError> {
        let mut state = self.inner.lock();
        let superseded = std::mem::take(&mut state.connect_callbacks);
        // a window registered while disconnected belongs to this attempt
        let armed = (state.connection == ConnectionState::Disconnected)
            .then_some((state.window, state.window_fixed));
        state.end_session();
        if let Some((window, fixed)) = armed {
            state.window = window;
            state.window_fixed = fixed;
        }
        info!(
            peer = %state.target.addr(),
            channel = %self.inner.channel_id,
            "reconnecting channel event hub"
        );
        let result = self.start_session(state, options, callback);
        for cb in superseded {
            cb(Err(EventHubError::Shutdown));
        }
        result
    }

    /// Connect and wait until the session is ready.
    pub async fn connect_and_wait(&self, options: ConnectOptions) -> Result<(), EventHubError> {
        let (tx, rx) = oneshot::channel();
        self.connect(options, Some(oneshot_callback(tx)))?;
        rx.await.unwrap_or(Err(EventHubError::Shutdown)).map(|_| ())
    }

    /// Reconnect and wait until the new session is ready.
    pub async fn reconnect_and_wait(&self, options: ConnectOptions) -> Result<(), EventHubError> {
        let (tx, rx) = oneshot::channel();
        self.reconnect(options, Some(oneshot_callback(tx)))?;
        rx.await.unwrap_or(Err(EventHubError::Shutdown)).map(|_| ())
    }

    /// Close the session and deliver a shutdown error to every registered
    /// listener, removing them. By the time this returns every listener has
    /// been notified; transport teardown continues in the background.
    ///
    /// Safe to call from inside a listener callback. A second call finds
    /// nothing left to sweep.
    pub fn disconnect(&self) {
        let (callbacks, sweep, addr) = {
            let mut state = self.inner.lock();
            let was = state.connection;
            state.end_session();
            let callbacks = std::mem::take(&mut state.connect_callbacks);
            let sweep = state.registry.drain();
            if was != ConnectionState::Disconnected || !sweep.is_empty() {
                info!(
                    peer = %state.target.addr(),
                    channel = %self.inner.channel_id,
                    listeners = sweep.len(),
                    "disconnecting channel event hub"
                );
            }
            (callbacks, sweep, state.target.addr().to_string())
        };
        let err = EventHubError::Shutdown;
        for cb in callbacks {
            cb(Err(err.clone()));
        }
        for on_error in sweep {
            on_error(&err);
        }
        debug!(peer = %addr, "disconnect complete");
    }

    fn start_session(
        &self,
        mut state: MutexGuard<'_, HubState>,
        options: ConnectOptions,
        callback: Option<ConnectCallback>,
    ) -> Result<(), EventHubError> {
        match state.connection {
            ConnectionState::Connected => {
                drop(state);
                if let Some(cb) = callback {
                    cb(Ok(self.clone()));
                }
                return Ok(());
            }
            ConnectionState::Connecting => {
                if let Some(cb) = callback {
                    state.connect_callbacks.push(cb);
                }
                return Ok(());
            }
            ConnectionState::Disconnected => {}
        }

        let identity = self
            .inner
            .identity
            .clone()
            .ok_or_else(|| EventHubError::config("missing signing identity"))?;
        let requested = options.window()?;
        let window = if requested.is_empty() {
            state.window
        } else if state.window_fixed && state.window != requested {
            return Err(EventHubError::config(format!(
                "connect options replay window ({:?}..{:?}) conflicts with the registered one ({:?}..{:?})",
                requested.start, requested.end, state.window.start, state.window.end
            )));
        } else {
            requested
        };
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            EventHubError::config("connect must be called from within a Tokio runtime")
        })?;

        let target = options.target.unwrap_or_else(|| state.target.clone());
        state.pending_target = Some(target.clone());
        state.window = window;
        state.window_fixed = !window.is_empty();
        state.mode = BlockMode::from_full_block(options.full_block);
        state.epoch += 1;
        state.connection = ConnectionState::Connecting;
        let (close_tx, close_rx) = oneshot::channel();
        state.session = Some(close_tx);
        if let Some(cb) = callback {
            state.connect_callbacks.push(cb);
        }
        let epoch = state.epoch;

        let request = DeliverRequest {
            channel_id: self.inner.channel_id.clone(),
            target,
            full_block: options.full_block,
            start: window.seek_start(),
            stop: window.seek_stop(),
            identity,
        };
        info!(
            peer = %request.target.addr(),
            channel = %request.channel_id,
            transport = self.inner.transport.kind(),
            start = ?request.start,
            stop = ?request.stop,
            full_block = request.full_block,
            "connecting channel event hub"
        );
        drop(state);

        runtime.spawn(run_session(self.inner.clone(), epoch, request, close_rx));
        Ok(())
    }

    // ─── Registrations ───────────────────────────────────────────────────────

    /// Register a listener for every block. Persistent unless
    /// `options.unregister` is `Some(true)`.
    pub fn register_block_event<F, E>(
        &self,
        on_event: F,
        on_error: E,
        options: RegistrationOptions,
    ) -> Result<BlockHandle, EventHubError>
    where
        F: Fn(&DecodedBlock) + Send + Sync + 'static,
        E: Fn(&EventHubError) + Send + Sync + 'static,
    {
        let mut state = self.inner.lock();
        let window = state.check_registration_window(&options)?;
        let lifetime = Lifetime::from(options.unregister.unwrap_or(false))
            .range_bound(window.is_some());
        let handle = state.registry.add_block(Arc::new(on_event), Arc::new(on_error), lifetime);
        state.adopt_window(window);
        debug!(%handle, "registered block listener");
        Ok(handle)
    }

    /// Register a listener for one transaction id, or `"ALL"` for every
    /// transaction. Returns the key to unregister with.
    ///
    /// An exact id is removed after its first delivery by default; the
    /// `"ALL"` wildcard stays registered by default.
    pub fn register_tx_event<F, E>(
        &self,
        tx_id: &str,
        on_event: F,
        on_error: E,
        options: RegistrationOptions,
    ) -> Result<String, EventHubError>
    where
        F: Fn(&str, ValidationCode, u64) + Send + Sync + 'static,
        E: Fn(&EventHubError) + Send + Sync + 'static,
    {
        let mut state = self.inner.lock();
        let window = state.check_registration_window(&options)?;
        let key = state.registry.check_tx(tx_id)?;
        let default_unregister = key != ALL_TRANSACTIONS;
        let lifetime = Lifetime::from(options.unregister.unwrap_or(default_unregister))
            .range_bound(window.is_some());
        let key = state.registry.add_tx(&key, Arc::new(on_event), Arc::new(on_error), lifetime)?;
        state.adopt_window(window);
        debug!(tx_id = %key, "registered transaction listener");
        Ok(key)
    }

    /// Register a listener for chaincode events whose chaincode id equals
    /// `chaincode_id` and whose name matches the regular expression
    /// `event_pattern`. Persistent by default.
    pub fn register_chaincode_event<F, E>(
        &self,
        chaincode_id: &str,
        event_pattern: &str,
        on_event: F,
        on_error: E,
        options: RegistrationOptions,
    ) -> Result<ChaincodeHandle, EventHubError>
    where
        F: Fn(&ChaincodeEvent, u64, ValidationCode) + Send + Sync + 'static,
        E: Fn(&EventHubError) + Send + Sync + 'static,
    {
        let pattern = RegistrationRegistry::compile_pattern(chaincode_id, event_pattern)?;
        let mut state = self.inner.lock();
        let window = state.check_registration_window(&options)?;
        let handle = state.registry.add_chaincode(
            chaincode_id,
            pattern,
            Arc::new(on_event),
            Arc::new(on_error),
            Lifetime::from(options.unregister.unwrap_or(false)).range_bound(window.is_some()),
        );
        state.adopt_window(window);
        debug!(%handle, chaincode_id, event_pattern, "registered chaincode listener");
        Ok(handle)
    }

    /// Remove a block listener. Returns `false` if it was not registered.
    pub fn unregister_block_event(&self, handle: BlockHandle) -> bool {
        self.inner.lock().registry.remove_block(handle)
    }

    /// Remove a transaction listener. Returns `false` if it was not registered.
    pub fn unregister_tx_event(&self, tx_id: &str) -> bool {
        self.inner.lock().registry.remove_tx(tx_id)
    }

    /// Remove a chaincode listener. Returns `false` if it was not registered.
    pub fn unregister_chaincode_event(&self, handle: ChaincodeHandle) -> bool {
        self.inner.lock().registry.remove_chaincode(handle)
    }
}

impl std::fmt::Debug for ChannelEventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ChannelEventHub")
            .field("channel_id", &self.inner.channel_id)
            .field("peer", &state.target.addr())
            .field("state", &state.connection)
            .field("registrations", &state.registry.len())
            .finish()
    }
}

fn oneshot_callback(tx: oneshot::Sender<Result<ChannelEventHub, EventHubError>>) -> ConnectCallback {
    Box::new(move |res| {
        let _ = tx.send(res);
    })
}

// ─── Session task ────────────────────────────────────────────────────────────

enum SessionFlow {
    Continue,
    Stop,
}

impl HubInner {
    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn hub(self: &Arc<Self>) -> ChannelEventHub {
        ChannelEventHub { inner: self.clone() }
    }

    /// Session ready: switch to `Connected` and notify pending callbacks.
    fn mark_connected(self: &Arc<Self>, epoch: u64) -> bool {
        let (callbacks, addr) = {
            let mut state = self.lock();
            if state.epoch != epoch {
                return false;
            }
            state.connection = ConnectionState::Connected;
            if let Some(target) = state.pending_target.take() {
                state.target = target;
            }
            (
                std::mem::take(&mut state.connect_callbacks),
                state.target.addr().to_string(),
            )
        };
        info!(peer = %addr, channel = %self.channel_id, "channel event hub connected");
        let hub = self.hub();
        for cb in callbacks {
            cb(Ok(hub.clone()));
        }
        true
    }

    /// End the session with `err`: notify pending connect callbacks and sweep
    /// every registration.
    fn fail_session(self: &Arc<Self>, epoch: u64, err: EventHubError) {
        let (callbacks, sweep) = {
            let mut state = self.lock();
            if state.epoch != epoch {
                return;
            }
            state.end_session();
            (
                std::mem::take(&mut state.connect_callbacks),
                state.registry.drain(),
            )
        };
        if err.completion().is_some() {
            info!(channel = %self.channel_id, listeners = sweep.len(), "{err}");
        } else {
            warn!(channel = %self.channel_id, listeners = sweep.len(), error = %err, "event session failed");
        }
        for cb in callbacks {
            cb(Err(err.clone()));
        }
        for on_error in sweep {
            on_error(&err);
        }
    }

    /// Numeric end of range reached: close quietly. Registrations that asked
    /// for the range go with it; the rest stay for the next session.
    fn finish_range(&self, epoch: u64, end: u64) {
        let mut state = self.lock();
        if state.epoch != epoch {
            return;
        }
        state.end_session();
        let released = state.registry.remove_range_bound();
        info!(
            channel = %self.channel_id,
            end_block = end,
            released,
            remaining = state.registry.len(),
            "replay range complete"
        );
    }

    fn on_block(self: &Arc<Self>, epoch: u64, raw: RawBlock) -> SessionFlow {
        let (mode, end) = {
            let state = self.lock();
            if state.epoch != epoch {
                return SessionFlow::Stop;
            }
            (state.mode, state.window.end)
        };

        let block = match self.decoder.decode(&raw, mode) {
            Ok(block) => block,
            Err(e) => {
                self.fail_session(epoch, EventHubError::Decode(e));
                return SessionFlow::Stop;
            }
        };

        {
            let mut state = self.lock();
            if state.epoch != epoch {
                return SessionFlow::Stop;
            }
            if let Some(last) = state.last_block {
                if block.number <= last {
                    warn!(block = block.number, last, "block number did not increase");
                }
            }
            state.last_block = Some(block.number);
        }

        let scope = SessionScope { inner: self, epoch };
        let stats = dispatcher::dispatch(&scope, &block);
        debug!(
            block = block.number,
            txs = block.transactions.len(),
            block_events = stats.block_events,
            tx_events = stats.tx_events,
            chaincode_events = stats.chaincode_events,
            "dispatched block"
        );
        if stats.interrupted {
            return SessionFlow::Stop;
        }

        if let Some(EndBlock::Number(end)) = end {
            if block.number >= end {
                self.finish_range(epoch, end);
                return SessionFlow::Stop;
            }
        }
        SessionFlow::Continue
    }

    fn on_status(self: &Arc<Self>, epoch: u64, status: DeliverStatus) {
        let (end, last_block) = {
            let state = self.lock();
            if state.epoch != epoch {
                return;
            }
            (state.window.end, state.last_block)
        };
        match (status, end) {
            (DeliverStatus::Success, Some(EndBlock::Newest)) => self.fail_session(
                epoch,
                EventHubError::NewestBlockReceived { block_number: last_block },
            ),
            (DeliverStatus::Success, Some(EndBlock::Number(n))) => self.finish_range(epoch, n),
            (status, _) => self.fail_session(epoch, EventHubError::UnexpectedStatus(status)),
        }
    }
}

/// Registry access bound to one session epoch.
struct SessionScope<'a> {
    inner: &'a Arc<HubInner>,
    epoch: u64,
}

impl RegistryAccess for SessionScope<'_> {
    fn with_registry<R>(&self, f: impl FnOnce(&mut RegistrationRegistry) -> R) -> Option<R> {
        let mut state = self.inner.lock();
        if state.epoch != self.epoch {
            return None;
        }
        Some(f(&mut state.registry))
    }
}

async fn run_session(
    inner: Arc<HubInner>,
    epoch: u64,
    request: DeliverRequest,
    mut close_rx: oneshot::Receiver<()>,
) {
    let addr = request.target.addr().to_string();
    let opened = tokio::select! {
        res = inner.transport.open(request) => res,
        _ = &mut close_rx => {
            debug!(peer = %addr, "session closed before it was ready");
            return;
        }
    };

    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            inner.fail_session(epoch, EventHubError::Connection(e));
            return;
        }
    };

    if !inner.mark_connected(epoch) {
        return;
    }

    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = &mut close_rx => {
                debug!(peer = %addr, "session closed locally");
                return;
            }
        };
        match item {
            Some(Ok(DeliverResponse::Block(raw))) => {
                if let SessionFlow::Stop = inner.on_block(epoch, raw) {
                    return;
                }
            }
            Some(Ok(DeliverResponse::Status(status))) => {
                inner.on_status(epoch, status);
                return;
            }
            Some(Err(e)) => {
                inner.fail_session(epoch, EventHubError::Connection(e));
                return;
            }
            None => {
                inner.fail_session(epoch, EventHubError::StreamClosed);
                return;
            }
        }
    }
}

