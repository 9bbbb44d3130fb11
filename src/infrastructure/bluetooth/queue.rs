//! Device Queue and Dispatcher
//!
//! Every device gets one dispatcher task that owns all of its mutable state:
//! the connection state machine, the in-flight correlator and the
//! per-connection context. Callers only ever hold a [`DeviceQueue`] handle,
//! which appends transactions to a shared pending list and sends control
//! commands; it never waits on the dispatcher.
//!
//! ```text
//!  DeviceQueue ──add/insert──▶ pending (VecDeque) ──pop──┐
//!       │                                                ▼
//!       └──commands──▶ ┌────────────────────────────────────────┐
//!                      │ Dispatcher                             │
//!  GattCallbackBridge  │  run_transaction ─▶ run_action ─▶ pump │
//!   ──BridgeMessage──▶ │  correlator / state machine / context  │
//!                      └───────────────┬────────────────────────┘
//!                                      ▼
//!                                GattTransport
//! ```
//!
//! At most one action is in flight per device. Transactions run in FIFO
//! order, except that `insert` places one at the head.

use crate::domain::error::{QueueError, TransportError};
use crate::domain::models::{ConnectionState, DeviceEvent, DeviceId};
use crate::domain::settings::EngineSettings;
use crate::infrastructure::bluetooth::action::{Action, ActionContext, CompletionKey};
use crate::infrastructure::bluetooth::bridge::{
    BridgeMessage, Correlation, Correlator, GattCallbackBridge, GattEvent, GattListener, LinkState,
};
use crate::infrastructure::bluetooth::connection::ConnectionStateMachine;
use crate::infrastructure::bluetooth::context::{ConnectionContext, ProtocolContext};
use crate::infrastructure::bluetooth::gatt::{
    GattStatus, CLIENT_CHARACTERISTIC_CONFIG, DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE,
};
use crate::infrastructure::bluetooth::protocol::DeviceProtocol;
use crate::infrastructure::bluetooth::transaction::{
    ReadValue, Transaction, TransactionBuilder, TransactionReport,
};
use crate::infrastructure::bluetooth::transfer::TransferId;
use crate::infrastructure::bluetooth::transport::GattTransport;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    SetAutoReconnect(bool),
    RegisterTransfer { id: TransferId, data: Vec<u8> },
    Dispose,
}

#[derive(Default)]
struct Pending {
    transactions: VecDeque<Transaction>,
    disposed: bool,
}

/// State shared between the handles and the dispatcher.
pub(crate) struct Shared {
    device: DeviceId,
    protocol: Arc<dyn DeviceProtocol>,
    pending: Mutex<Pending>,
    wakeup: Notify,
    state: watch::Receiver<ConnectionState>,
    mtu: watch::Receiver<u16>,
}

impl Shared {
    pub(crate) fn device(&self) -> &DeviceId {
        &self.device
    }

    pub(crate) fn protocol(&self) -> &Arc<dyn DeviceProtocol> {
        &self.protocol
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Callbacks always run after the lock is released.
    pub(crate) fn enqueue(&self, transaction: Transaction, first: bool) -> Result<(), QueueError> {
        let mut pending = self.lock();
        if pending.disposed {
            drop(pending);
            let err = QueueError::Disposed(self.device.clone());
            transaction.finish(Err(err.clone()));
            return Err(err);
        }
        if transaction.is_empty() && !transaction.is_initialization() {
            drop(pending);
            debug!("Transaction '{}' has no actions", transaction.name());
            let report = TransactionReport::new(transaction.name());
            transaction.finish(Ok(report));
            return Ok(());
        }

        debug!(
            "{}: queued '{}' ({} actions){}",
            self.device,
            transaction.name(),
            transaction.len(),
            if first { " at head" } else { "" }
        );
        if first {
            pending.transactions.push_front(transaction);
        } else {
            pending.transactions.push_back(transaction);
        }
        drop(pending);
        self.wakeup.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<Transaction> {
        self.lock().transactions.pop_front()
    }

    fn drain(&self) -> Vec<Transaction> {
        self.lock().transactions.drain(..).collect()
    }

    /// Refuse further submissions and hand back what was pending.
    fn close(&self) -> Vec<Transaction> {
        let mut pending = self.lock();
        pending.disposed = true;
        pending.transactions.drain(..).collect()
    }

    fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    fn len(&self) -> usize {
        self.lock().transactions.len()
    }
}

/// Cloneable handle to one device's transaction queue.
#[derive(Clone)]
pub struct DeviceQueue {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl DeviceQueue {
    /// Start the dispatcher for `device`. Must be called from within a
    /// Tokio runtime.
    pub fn spawn(
        device: DeviceId,
        transport: Arc<dyn GattTransport>,
        protocol: Arc<dyn DeviceProtocol>,
        settings: EngineSettings,
        event_sender: Option<mpsc::UnboundedSender<DeviceEvent>>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::NotConnected);
        let (mtu_tx, mtu_rx) = watch::channel(settings.default_mtu);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (bridge_tx, bridge_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            device: device.clone(),
            protocol: protocol.clone(),
            pending: Mutex::new(Pending::default()),
            wakeup: Notify::new(),
            state: state_rx,
            mtu: mtu_rx,
        });

        let dispatcher = Dispatcher {
            machine: ConnectionStateMachine::new(
                device,
                settings.auto_reconnect,
                state_tx,
                event_sender.clone(),
            ),
            shared: shared.clone(),
            transport,
            protocol,
            settings,
            event_sender,
            commands: command_rx,
            events: bridge_rx,
            bridge_tx,
            generation: 0,
            correlator: Correlator::new(),
            connection: None,
            listener: None,
            mtu_tx,
            connect_deadline: None,
            disposed: false,
        };
        tokio::spawn(dispatcher.run());

        Self {
            shared,
            commands: command_tx,
        }
    }

    fn send(&self, command: Command) -> bool {
        if self.commands.send(command).is_err() {
            warn!("Dispatcher for {} is not running", self.shared.device);
            return false;
        }
        true
    }

    pub fn device(&self) -> &DeviceId {
        &self.shared.device
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.clone()
    }

    /// Wait until the state satisfies `predicate`.
    pub async fn wait_for_state<F>(&self, predicate: F) -> Result<ConnectionState, QueueError>
    where
        F: Fn(ConnectionState) -> bool,
    {
        let mut rx = self.shared.state.clone();
        loop {
            let state = *rx.borrow_and_update();
            if predicate(state) {
                return Ok(state);
            }
            if rx.changed().await.is_err() {
                return Err(QueueError::Disposed(self.shared.device.clone()));
            }
        }
    }

    pub fn mtu(&self) -> u16 {
        *self.shared.mtu.borrow()
    }

    /// Largest payload of a single write at the current MTU.
    pub fn max_chunk_size(&self) -> usize {
        self.shared.protocol.chunk_size_for(self.mtu())
    }

    pub fn pending_len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Request a connection. Returns false when already connected or
    /// connecting.
    pub fn connect(&self) -> bool {
        let state = self.state();
        if state.is_connected() || state == ConnectionState::Connecting {
            debug!("{}: connect ignored, already {}", self.shared.device, state);
            return false;
        }
        self.send(Command::Connect)
    }

    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    pub fn set_auto_reconnect(&self, enable: bool) {
        self.send(Command::SetAutoReconnect(enable));
    }

    /// Offer `data` to the peripheral, which pulls it chunk by chunk through
    /// the protocol's transfer registry. Dropped if the link goes away.
    pub fn register_transfer(&self, id: TransferId, data: Vec<u8>) -> bool {
        self.send(Command::RegisterTransfer { id, data })
    }

    /// Append to the pending queue. Never blocks on running work.
    pub fn add(&self, transaction: Transaction) -> Result<(), QueueError> {
        self.shared.enqueue(transaction, false)
    }

    /// Place at the head of the pending queue; the running transaction
    /// still finishes first.
    pub fn insert(&self, transaction: Transaction) -> Result<(), QueueError> {
        self.shared.enqueue(transaction, true)
    }

    /// Cancel everything not yet started. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let dropped = self.shared.drain();
        let count = dropped.len();
        if count > 0 {
            info!("{}: cleared {} pending transaction(s)", self.shared.device, count);
        }
        for transaction in dropped {
            transaction.finish(Err(QueueError::Cancelled));
        }
        count
    }

    /// Disconnect, fail everything with `Disposed` and stop the dispatcher.
    pub fn dispose(&self) {
        let dropped = self.shared.close();
        for transaction in dropped {
            transaction.finish(Err(QueueError::Disposed(self.shared.device.clone())));
        }
        self.send(Command::Dispose);
    }

    pub fn create_transaction_builder(&self, name: impl Into<String>) -> TransactionBuilder {
        TransactionBuilder::for_protocol(name, self.shared.protocol.clone())
    }

    /// Builder for work that needs a fully initialized device.
    pub fn perform_initialized(
        &self,
        name: impl Into<String>,
    ) -> Result<TransactionBuilder, QueueError> {
        if self.is_disposed() {
            return Err(QueueError::Disposed(self.shared.device.clone()));
        }
        let state = self.state();
        if !state.is_initialized() {
            return Err(QueueError::NotInitialized {
                device: self.shared.device.clone(),
                state,
            });
        }
        Ok(self.create_transaction_builder(name))
    }

    /// Queue without the initialization check, connecting first if needed.
    pub fn perform_connected(&self, transaction: Transaction) -> Result<(), QueueError> {
        if !self.state().is_connected() {
            self.connect();
        }
        self.add(transaction)
    }
}

impl std::fmt::Debug for DeviceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceQueue")
            .field("device", &self.shared.device)
            .field("state", &self.state())
            .field("pending", &self.pending_len())
            .finish()
    }
}

enum Flow {
    Continue,
    Resolved(Result<Option<Vec<u8>>, QueueError>),
    Aborted(QueueError),
}

fn completion_result(
    key: CompletionKey,
    status: GattStatus,
    value: Option<Vec<u8>>,
) -> Result<Option<Vec<u8>>, QueueError> {
    if status.is_success() {
        Ok(value)
    } else {
        Err(TransportError::Status {
            characteristic: key.characteristic,
            status: status.0,
        }
        .into())
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct Dispatcher {
    shared: Arc<Shared>,
    transport: Arc<dyn GattTransport>,
    protocol: Arc<dyn DeviceProtocol>,
    settings: EngineSettings,
    event_sender: Option<mpsc::UnboundedSender<DeviceEvent>>,
    machine: ConnectionStateMachine,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<BridgeMessage>,
    bridge_tx: mpsc::UnboundedSender<BridgeMessage>,
    /// Bumped on every connect attempt and link loss; older events are stale.
    generation: u64,
    correlator: Correlator,
    connection: Option<ConnectionContext>,
    /// Override of the transaction currently running.
    listener: Option<Arc<dyn GattListener>>,
    mtu_tx: watch::Sender<u16>,
    connect_deadline: Option<Instant>,
    disposed: bool,
}

impl Dispatcher {
    async fn run(mut self) {
        info!("Dispatcher for {} started", self.shared.device);

        while !self.disposed {
            if self.machine.state().is_connected() {
                if let Some(transaction) = self.shared.pop() {
                    self.run_transaction(transaction).await;
                    continue;
                }
            }

            let deadline = self.connect_deadline;
            tokio::select! {
                command = self.commands.recv() => {
                    self.handle_command(command.unwrap_or(Command::Dispose));
                }
                Some(message) = self.events.recv() => {
                    self.handle_event(message);
                }
                _ = self.shared.wakeup.notified() => {}
                _ = sleep_until_opt(deadline) => self.on_connect_timeout(),
            }
        }

        info!("Dispatcher for {} terminated", self.shared.device);
    }

    async fn run_transaction(&mut self, mut transaction: Transaction) {
        let name = transaction.name().to_string();
        let actions = transaction.take_actions();
        let total = actions.len();
        info!("{}: running '{}' ({} actions)", self.shared.device, name, total);

        if transaction.is_initialization() && self.machine.state() == ConnectionState::Connected {
            if let Err(e) = self.machine.transition_to(ConnectionState::Initializing) {
                warn!("{}: {}", self.shared.device, e);
            }
        }

        self.listener = transaction.listener().cloned();
        let mut report = TransactionReport::new(name.as_str());
        let mut outcome = Ok(());
        for (index, action) in actions.iter().enumerate() {
            debug!(
                "{}: '{}' action {}/{}: {}",
                self.shared.device,
                name,
                index + 1,
                total,
                action
            );
            match self.run_action(action).await {
                Ok(value) => {
                    if let (Some(value), Some(characteristic)) = (value, action.characteristic()) {
                        report.reads.push(ReadValue {
                            characteristic: characteristic.uuid,
                            value,
                        });
                    }
                    report.actions_run += 1;
                }
                Err(e) => {
                    error!(
                        "{}: '{}' aborted at action {}/{} ({}): {}",
                        self.shared.device,
                        name,
                        index + 1,
                        total,
                        action,
                        e
                    );
                    outcome = Err(e);
                    break;
                }
            }
        }
        self.listener = None;

        if transaction.is_initialization() {
            match &outcome {
                Ok(()) if self.machine.state() == ConnectionState::Initializing => {
                    if let Err(e) = self.machine.transition_to(ConnectionState::Initialized) {
                        warn!("{}: {}", self.shared.device, e);
                    }
                }
                Ok(()) => {}
                Err(e) => warn!(
                    "{}: initialization failed, device stays {}: {}",
                    self.shared.device,
                    self.machine.state(),
                    e
                ),
            }
        }

        transaction.finish(outcome.map(|()| report));
    }

    async fn run_action(&mut self, action: &Action) -> Result<Option<Vec<u8>>, QueueError> {
        match action {
            Action::Wait(duration) => {
                let deadline = Instant::now() + *duration;
                return self.pump_until(deadline, action).await;
            }
            Action::Plain(plain) => {
                let ctx = ActionContext {
                    device: &self.shared.device,
                    state: self.machine.state(),
                    mtu: *self.mtu_tx.borrow(),
                };
                return plain.run(&ctx).map(|()| None);
            }
            Action::SetState(state) => {
                self.machine.transition_to(*state)?;
                return Ok(None);
            }
            _ => {}
        }

        let key = action.completion_key();
        if let Some(key) = key {
            self.correlator.begin(key);
        }
        if let Err(e) = self.issue(action) {
            self.correlator.cancel();
            return Err(e);
        }
        if key.is_none() {
            return Ok(None);
        }

        let deadline = Instant::now() + self.settings.action_timeout();
        self.pump_until(deadline, action).await
    }

    /// Hand the GATT operation to the platform.
    fn issue(&mut self, action: &Action) -> Result<(), QueueError> {
        let device = &self.shared.device;
        match action {
            Action::Write {
                characteristic,
                value,
            } => self.transport.write_characteristic(
                device,
                characteristic,
                value,
                characteristic.write_type(),
            )?,
            Action::Read { characteristic } => {
                self.transport.read_characteristic(device, characteristic)?
            }
            Action::Notify {
                characteristic,
                enable,
            } => {
                let value = if *enable {
                    characteristic.subscription_value().ok_or(
                        TransportError::Unsupported {
                            characteristic: characteristic.uuid,
                            operation: "subscribe",
                        },
                    )?
                } else {
                    DISABLE_NOTIFICATION_VALUE
                };
                self.transport
                    .set_characteristic_notification(device, characteristic, *enable)?;
                self.transport.write_descriptor(
                    device,
                    characteristic,
                    CLIENT_CHARACTERISTIC_CONFIG,
                    &value,
                )?;
                if let Some(connection) = self.connection.as_mut() {
                    connection.record_subscription(
                        characteristic.uuid,
                        value == ENABLE_INDICATION_VALUE,
                    );
                }
            }
            Action::RequestMtu(mtu) => self.transport.request_mtu(device, *mtu)?,
            Action::Wait(_) | Action::Plain(_) | Action::SetState(_) => {}
        }
        Ok(())
    }

    /// Process commands and GATT events until the in-flight action resolves,
    /// the link drops, or `deadline` passes.
    async fn pump_until(
        &mut self,
        deadline: Instant,
        action: &Action,
    ) -> Result<Option<Vec<u8>>, QueueError> {
        let awaiting = !self.correlator.is_idle();
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    if let Some(err) = self.handle_command(command.unwrap_or(Command::Dispose)) {
                        return Err(err);
                    }
                }
                Some(message) = self.events.recv() => match self.handle_event(message) {
                    Flow::Continue => {}
                    Flow::Resolved(result) => return result,
                    Flow::Aborted(err) => return Err(err),
                },
                _ = sleep_until(deadline) => {
                    if !awaiting {
                        return Ok(None);
                    }
                    self.correlator.cancel();
                    let after = self.settings.action_timeout();
                    warn!("{}: {} timed out after {:?}", self.shared.device, action, after);
                    return Err(QueueError::Timeout {
                        action: action.to_string(),
                        after,
                    });
                }
            }
        }
    }

    /// Returns the error that aborts in-flight work, if the command does.
    fn handle_command(&mut self, command: Command) -> Option<QueueError> {
        let device = self.shared.device.clone();
        match command {
            Command::Connect => {
                self.start_connect();
                None
            }
            Command::Disconnect => {
                if self.machine.state() == ConnectionState::NotConnected {
                    debug!("{}: already disconnected", device);
                    return None;
                }
                info!("{}: disconnect requested", device);
                self.transport.disconnect(&device);
                let err = QueueError::Disconnected(device);
                self.on_link_lost(true, &err);
                Some(err)
            }
            Command::SetAutoReconnect(enable) => {
                debug!("{}: auto reconnect {}", device, enable);
                self.machine.set_auto_reconnect(enable);
                None
            }
            Command::RegisterTransfer { id, data } => {
                match self.connection.as_mut() {
                    Some(connection) => {
                        if let Err(e) = connection.transfers().register(id, data) {
                            warn!("{}: {}", device, e);
                        }
                    }
                    None => warn!("{}: transfer {} dropped, not connected", device, id),
                }
                None
            }
            Command::Dispose => {
                info!("{}: disposing queue", device);
                if self.machine.state() != ConnectionState::NotConnected {
                    self.transport.disconnect(&device);
                }
                let err = QueueError::Disposed(device);
                self.on_link_lost(true, &err);
                for transaction in self.shared.close() {
                    transaction.finish(Err(err.clone()));
                }
                self.disposed = true;
                Some(err)
            }
        }
    }

    fn next_bridge(&mut self) -> GattCallbackBridge {
        self.generation += 1;
        GattCallbackBridge::new(
            self.shared.device.clone(),
            self.generation,
            self.bridge_tx.clone(),
        )
    }

    fn start_connect(&mut self) {
        let device = self.shared.device.clone();
        match self.machine.state() {
            ConnectionState::NotConnected => {}
            ConnectionState::WaitingForReconnect => {
                debug!("{}: restarting pending reconnect", device);
                let _ = self.machine.transition_to(ConnectionState::NotConnected);
            }
            state => {
                debug!("{}: connect ignored in state {}", device, state);
                return;
            }
        }
        if let Err(e) = self.machine.transition_to(ConnectionState::Connecting) {
            warn!("{}: {}", device, e);
            return;
        }

        let bridge = self.next_bridge();
        match self.transport.connect(&device, bridge) {
            Ok(()) => {
                self.connect_deadline = Some(Instant::now() + self.settings.connect_timeout());
            }
            Err(e) => {
                warn!("{}: connect failed: {}", device, e);
                let _ = self.machine.transition_to(ConnectionState::NotConnected);
            }
        }
    }

    fn on_connect_timeout(&mut self) {
        let device = self.shared.device.clone();
        warn!(
            "{}: connect timed out after {:?}",
            device,
            self.settings.connect_timeout()
        );
        self.transport.disconnect(&device);
        self.on_link_lost(true, &QueueError::Disconnected(device));
    }

    fn on_link_up(&mut self) {
        let device = self.shared.device.clone();
        match self.machine.state() {
            ConnectionState::Connecting => {}
            ConnectionState::WaitingForReconnect => {
                let _ = self.machine.transition_to(ConnectionState::Connecting);
            }
            state => {
                debug!("{}: link up ignored in state {}", device, state);
                return;
            }
        }
        if let Err(e) = self.machine.transition_to(ConnectionState::Connected) {
            warn!("{}: {}", device, e);
            return;
        }

        self.connect_deadline = None;
        self.correlator.reset();
        self.connection = Some(ConnectionContext::new(&self.settings, self.protocol.as_ref()));
        self.mtu_tx.send_replace(self.settings.default_mtu);

        let init = self
            .protocol
            .initialize(TransactionBuilder::initialization(self.protocol.clone()))
            .build();
        if let Err(e) = self.shared.enqueue(init, true) {
            warn!("{}: could not queue initialization: {}", device, e);
        }
    }

    /// Tear down everything tied to the current link.
    fn on_link_lost(&mut self, requested: bool, error: &QueueError) {
        let device = self.shared.device.clone();
        self.generation += 1;
        self.connect_deadline = None;
        if let Some(key) = self.correlator.cancel() {
            debug!("{}: abandoning in-flight {:?}", device, key);
        }

        let flushed = self.shared.drain();
        if !flushed.is_empty() {
            warn!(
                "{}: failing {} pending transaction(s): {}",
                device,
                flushed.len(),
                error
            );
        }
        for transaction in flushed {
            transaction.finish(Err(error.clone()));
        }
        if let Some(mut connection) = self.connection.take() {
            connection.flush();
        }

        if self.machine.link_lost(!requested) == ConnectionState::WaitingForReconnect {
            info!("{}: attempting to reconnect", device);
            let bridge = self.next_bridge();
            if let Err(e) = self.transport.connect(&device, bridge) {
                warn!("{}: reconnect failed: {}", device, e);
                let _ = self.machine.transition_to(ConnectionState::NotConnected);
            }
        }
    }

    fn handle_event(&mut self, message: BridgeMessage) -> Flow {
        if message.generation != self.generation {
            debug!(
                "{}: ignoring stale event {:?}",
                self.shared.device, message.event
            );
            return Flow::Continue;
        }

        let event = message.event;
        let Some(key) = event.completion_key() else {
            match event {
                GattEvent::ConnectionStateChanged { state, status } => {
                    return self.on_link_state(state, status)
                }
                GattEvent::CharacteristicChanged {
                    characteristic,
                    value,
                } => self.route_value_change(characteristic, &value),
                _ => {}
            }
            return Flow::Continue;
        };

        if let GattEvent::MtuChanged { mtu, status } = event {
            if status.is_success() {
                self.apply_mtu(mtu);
            }
        }

        match self.correlator.resolve(key) {
            Correlation::Matched => Flow::Resolved(match event {
                GattEvent::CharacteristicRead { value, status, .. } => {
                    completion_result(key, status, Some(value))
                }
                other => completion_result(key, other.status(), None),
            }),
            Correlation::Duplicate => self.discard(key),
            Correlation::Unsolicited => {
                match event {
                    GattEvent::CharacteristicWrite {
                        characteristic,
                        status,
                    } => self.route_write(characteristic, status),
                    GattEvent::CharacteristicRead {
                        characteristic,
                        value,
                        status,
                    } => self.route_read(characteristic, &value, status),
                    GattEvent::DescriptorWrite {
                        characteristic,
                        descriptor,
                        ..
                    } => debug!(
                        "{}: unsolicited descriptor write {} on {}",
                        self.shared.device, descriptor, characteristic
                    ),
                    _ => {}
                }
                Flow::Continue
            }
        }
    }

    fn on_link_state(&mut self, state: LinkState, status: GattStatus) -> Flow {
        match state {
            LinkState::Connected => {
                self.on_link_up();
                Flow::Continue
            }
            LinkState::Connecting => {
                if self.machine.state() == ConnectionState::WaitingForReconnect
                    && self.machine.transition_to(ConnectionState::Connecting).is_ok()
                {
                    self.connect_deadline = Some(Instant::now() + self.settings.connect_timeout());
                }
                Flow::Continue
            }
            LinkState::Disconnected => {
                let err = QueueError::Disconnected(self.shared.device.clone());
                warn!("{}: link lost ({})", self.shared.device, status);
                self.on_link_lost(false, &err);
                Flow::Aborted(err)
            }
        }
    }

    fn discard(&self, key: CompletionKey) -> Flow {
        warn!(
            "{}: discarding duplicate completion {:?}",
            self.shared.device, key
        );
        Flow::Continue
    }

    fn apply_mtu(&mut self, mtu: u16) {
        info!("{}: MTU is now {}", self.shared.device, mtu);
        if let Some(connection) = self.connection.as_mut() {
            connection.set_mtu(mtu);
        }
        self.mtu_tx.send_replace(mtu);
        if let Some(sender) = &self.event_sender {
            let _ = sender.send(DeviceEvent::MtuChanged {
                device: self.shared.device.clone(),
                mtu,
            });
        }
    }

    fn route_value_change(&mut self, characteristic: Uuid, value: &[u8]) {
        let Some(connection) = self.connection.as_mut() else {
            debug!(
                "{}: value change on {} without a connection",
                self.shared.device, characteristic
            );
            return;
        };
        let indication = connection.is_indication(characteristic);
        let mut ctx = ProtocolContext::new(&self.shared, connection);

        let handled = self
            .listener
            .as_ref()
            .is_some_and(|l| l.on_characteristic_changed(&mut ctx, characteristic, value))
            || if indication {
                self.protocol.on_indication(&mut ctx, characteristic, value)
            } else {
                self.protocol.on_notification(&mut ctx, characteristic, value)
            };
        if !handled {
            debug!(
                "{}: unhandled value change on {} ({} bytes)",
                self.shared.device,
                characteristic,
                value.len()
            );
        }
    }

    fn route_read(&mut self, characteristic: Uuid, value: &[u8], status: GattStatus) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        let mut ctx = ProtocolContext::new(&self.shared, connection);
        let handled = self.listener.as_ref().is_some_and(|l| {
            l.on_characteristic_read(&mut ctx, characteristic, value, status)
        }) || self
            .protocol
            .on_characteristic_read(&mut ctx, characteristic, value, status);
        if !handled {
            debug!(
                "{}: unsolicited read of {} ignored",
                self.shared.device, characteristic
            );
        }
    }

    fn route_write(&mut self, characteristic: Uuid, status: GattStatus) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        let mut ctx = ProtocolContext::new(&self.shared, connection);
        let handled = self
            .listener
            .as_ref()
            .is_some_and(|l| l.on_characteristic_write(&mut ctx, characteristic, status))
            || self
                .protocol
                .on_characteristic_write(&mut ctx, characteristic, status);
        if !handled {
            debug!(
                "{}: unsolicited write completion on {} ignored",
                self.shared.device, characteristic
            );
        }
    }
}
