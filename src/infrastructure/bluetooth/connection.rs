//! BLE Connection Module
//!
//! Owns the one link to the peripheral: connect, disconnect, automatic
//! reconnection after unexpected drops, and the post-connect setup that
//! reads and subscribes to the attributes we care about.

use crate::domain::error::LinkError;
use crate::domain::models::{AttributeId, Command, ConnectionState, PeerId};
use crate::domain::observable::ObservableValue;
use crate::infrastructure::bluetooth::command_queue::{CommandLink, CommandQueue};
use crate::infrastructure::bluetooth::protocol::{self, ENABLE_NOTIFICATION_VALUE};
use crate::infrastructure::bluetooth::transport::{
    LinkEvent, LinkEventSink, LinkHandle, LinkId, LinkTransport,
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Bounded, fixed-backoff reconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    /// Wait before each attempt
    pub retry_delay: Duration,
    /// How long an attempt gets to reach `Connected`
    pub settle_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            settle_delay: Duration::from_secs(2),
        }
    }
}

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub reconnect: ReconnectPolicy,
    /// Attribute read and subscribed to after every connect
    pub battery_level: AttributeId,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            battery_level: protocol::battery_level_attribute(),
        }
    }
}

const TRANSITION_BACKLOG: usize = 64;

struct ReconnectTask {
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

#[derive(Default)]
struct LinkSlot {
    link: Option<LinkHandle>,
    next_link_id: LinkId,
    last_peer: Option<PeerId>,
    user_initiated_disconnect: bool,
    reconnect: Option<ReconnectTask>,
}

impl LinkSlot {
    fn link_ref(&self) -> Option<&dyn CommandLink> {
        self.link.as_ref().map(|link| link as &dyn CommandLink)
    }

    fn cancel_reconnect(&mut self) {
        if let Some(task) = self.reconnect.take() {
            info!("Cancelling automatic reconnection");
            task.token.cancel();
        }
    }
}

struct Shared {
    transport: Arc<dyn LinkTransport>,
    config: ConnectionConfig,
    // Lock order: slot, then queue.
    slot: Mutex<LinkSlot>,
    queue: CommandQueue,
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    battery: ObservableValue<u8>,
    events_tx: mpsc::UnboundedSender<(LinkId, LinkEvent)>,
}

/// Link lifecycle state machine. Cheap to clone; clones share one link.
#[derive(Clone)]
pub struct ConnectionController {
    shared: Arc<Shared>,
}

impl ConnectionController {
    /// Create the controller. Must be called inside a tokio runtime.
    pub fn new(transport: Arc<dyn LinkTransport>, config: ConnectionConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_BACKLOG);
        let shared = Arc::new(Shared {
            transport,
            config,
            slot: Mutex::new(LinkSlot::default()),
            queue: CommandQueue::new(),
            state,
            transitions,
            battery: ObservableValue::new(),
            events_tx,
        });
        spawn_event_pump(Arc::downgrade(&shared), events_rx);
        Self { shared }
    }

    /// Connect to `peer`, replacing whatever link or attempt was in flight.
    pub fn connect(&self, peer: PeerId) {
        let shared = &self.shared;
        let mut slot = shared.slot.lock();
        info!("Connecting to Bluetooth device: {}", peer);

        slot.cancel_reconnect();
        slot.user_initiated_disconnect = false;
        slot.last_peer = Some(peer.clone());
        shared.release_link(&mut slot);
        shared.set_state(ConnectionState::Connecting);

        if let Err(e) = shared.open_link(&mut slot, &peer) {
            warn!("Could not open link to {}: {}", peer, e);
            shared.set_state(ConnectionState::Disconnected);
            shared.start_reconnect(&mut slot);
        }
    }

    /// User-initiated disconnect. Never triggers reconnection.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        let mut slot = shared.slot.lock();
        slot.user_initiated_disconnect = true;
        slot.cancel_reconnect();
        if let Some(link) = slot.link.as_ref() {
            info!("Disconnecting from {}", link.peer());
        }
        shared.release_link(&mut slot);
        shared.set_state(ConnectionState::Disconnected);
    }

    /// Queue an operation against the current link.
    pub fn enqueue(&self, command: Command) {
        let slot = self.shared.slot.lock();
        self.shared.queue.enqueue(command, slot.link_ref());
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Latest state only; intermediate values may be coalesced.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Every transition, in the order it happened.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.transitions.subscribe()
    }

    pub fn battery_level(&self) -> Option<u8> {
        self.shared.battery.get()
    }

    pub fn subscribe_battery_level(&self) -> watch::Receiver<Option<u8>> {
        self.shared.battery.subscribe()
    }

    pub fn last_peer(&self) -> Option<PeerId> {
        self.shared.slot.lock().last_peer.clone()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.shared.slot.lock().reconnect.is_some()
    }

    pub fn has_link(&self) -> bool {
        self.shared.slot.lock().link.is_some()
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.shared.queue
    }
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!("Connection state: {} -> {}", current, next);
            let _ = self.transitions.send(next.clone());
            *current = next;
            true
        });
    }

    fn current_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    fn open_link(&self, slot: &mut LinkSlot, peer: &PeerId) -> Result<(), LinkError> {
        slot.next_link_id += 1;
        let id = slot.next_link_id;
        let sink = LinkEventSink::new(id, self.events_tx.clone());
        let session = self.transport.open_link(peer, sink)?;
        debug!("Opened link {} to {}", id, peer);
        slot.link = Some(LinkHandle::new(id, peer.clone(), session));
        Ok(())
    }

    /// Close the link and drop everything that targeted it.
    fn release_link(&self, slot: &mut LinkSlot) {
        if let Some(link) = slot.link.take() {
            debug!("Releasing link {} to {}", link.id(), link.peer());
            drop(link);
        }
        self.queue.clear();
        self.battery.clear();
    }

    fn start_reconnect(self: &Arc<Self>, slot: &mut LinkSlot) {
        let Some(peer) = slot.last_peer.clone() else {
            debug!("No known peer, not reconnecting");
            return;
        };
        slot.cancel_reconnect();

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_reconnect(self.clone(), peer, token.clone()));
        slot.reconnect = Some(ReconnectTask {
            token,
            _handle: handle,
        });
        self.set_state(ConnectionState::Connecting);
    }

    fn handle_event(self: &Arc<Self>, link_id: LinkId, event: LinkEvent) {
        let mut slot = self.slot.lock();
        let current = slot.link.as_ref().map(LinkHandle::id);
        if current != Some(link_id) {
            trace!("Ignoring event from released link {}: {:?}", link_id, event);
            return;
        }

        match event {
            LinkEvent::Established => {
                let Some(link) = slot.link.as_ref() else { return };
                let peer = link.peer().clone();
                if let Err(e) = link.session().discover_capabilities() {
                    warn!("Capability discovery could not start: {}", e);
                    self.fail_link(&mut slot, LinkError::LinkLost(e.to_string()));
                    return;
                }
                slot.cancel_reconnect();
                slot.user_initiated_disconnect = false;
                slot.last_peer = Some(peer.clone());
                self.set_state(ConnectionState::Connected(peer));
            }
            LinkEvent::Lost { reason } => {
                self.fail_link(&mut slot, LinkError::LinkLost(reason));
            }
            LinkEvent::Error { reason } => {
                error!("Transport reported an error: {}", reason);
                slot.cancel_reconnect();
                self.release_link(&mut slot);
                self.set_state(ConnectionState::Failed(reason));
            }
            LinkEvent::CapabilitiesDiscovered(Ok(attributes)) => {
                info!("Discovered {} attributes", attributes.len());
                self.run_post_connect_setup(&slot, &attributes);
            }
            LinkEvent::CapabilitiesDiscovered(Err(e)) => {
                warn!("Capability discovery failed: {}", e);
            }
            LinkEvent::AttributeRead { attribute, result } => {
                match result {
                    Ok(value) => self.apply_value(&attribute, &value),
                    Err(e) => warn!("Read of {} failed: {}", attribute, e),
                }
                self.queue.complete(slot.link_ref());
            }
            LinkEvent::AttributeWritten { attribute, result } => {
                if let Err(e) = result {
                    warn!("Write to {} failed: {}", attribute, e);
                }
                self.queue.complete(slot.link_ref());
            }
            LinkEvent::DescriptorWritten { descriptor, result } => {
                match result {
                    Ok(()) => debug!("Descriptor {} written", descriptor),
                    Err(e) => warn!("Descriptor write to {} failed: {}", descriptor, e),
                }
                self.queue.complete(slot.link_ref());
            }
            LinkEvent::Notification { attribute, value } => {
                self.apply_value(&attribute, &value);
            }
        }
    }

    /// The link is unusable: drop it and let the reconnection policy decide.
    fn fail_link(self: &Arc<Self>, slot: &mut LinkSlot, error: LinkError) {
        info!("{}", error);
        self.release_link(slot);
        self.set_state(ConnectionState::Disconnected);
        if slot.user_initiated_disconnect {
            debug!("Disconnect was user-initiated, staying down");
        } else if slot.reconnect.is_some() {
            debug!("Reconnection attempt failed, policy continues");
        } else {
            self.start_reconnect(slot);
        }
    }

    fn run_post_connect_setup(&self, slot: &LinkSlot, attributes: &[AttributeId]) {
        let battery = self.config.battery_level;
        if !attributes.contains(&battery) {
            warn!("Peer does not expose battery level {}", battery);
            return;
        }
        let Some(link) = slot.link.as_ref() else { return };

        info!("Reading battery level and enabling notifications...");
        self.queue.enqueue(Command::Read(battery), slot.link_ref());
        if let Err(e) = link.session().subscribe(&battery) {
            warn!("Could not enable local notifications for {}: {}", battery, e);
            return;
        }
        self.queue.enqueue(
            Command::WriteDescriptor {
                descriptor: protocol::client_config_descriptor(battery),
                payload: ENABLE_NOTIFICATION_VALUE.to_vec(),
            },
            slot.link_ref(),
        );
    }

    fn apply_value(&self, attribute: &AttributeId, value: &[u8]) {
        if *attribute != self.config.battery_level {
            trace!("Ignoring value for {}", attribute);
            return;
        }
        if let Some(level) = protocol::parse_battery_level(value) {
            debug!("Battery level: {}%", level);
            self.battery.set(level);
        }
    }
}

fn spawn_event_pump(
    shared: Weak<Shared>,
    mut events_rx: mpsc::UnboundedReceiver<(LinkId, LinkEvent)>,
) {
    tokio::spawn(async move {
        while let Some((link_id, event)) = events_rx.recv().await {
            let Some(shared) = shared.upgrade() else { break };
            shared.handle_event(link_id, event);
        }
        debug!("Link event pump stopped");
    });
}

/// Sleep unless cancelled first. `false` means cancelled.
async fn pause(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn run_reconnect(shared: Arc<Shared>, peer: PeerId, token: CancellationToken) {
    let policy = shared.config.reconnect.clone();

    for attempt in 1..=policy.max_attempts {
        if !pause(&token, policy.retry_delay).await {
            debug!("Reconnection cancelled before attempt {}", attempt);
            return;
        }

        {
            let mut slot = shared.slot.lock();
            // Cancellation happens under the slot lock, so this check is final.
            if token.is_cancelled() {
                return;
            }
            info!(
                "Reconnection attempt {}/{} to {}",
                attempt, policy.max_attempts, peer
            );
            shared.release_link(&mut slot);
            shared.set_state(ConnectionState::Connecting);
            if let Err(e) = shared.open_link(&mut slot, &peer) {
                warn!("Reconnection attempt {} could not open link: {}", attempt, e);
            }
        }

        if !pause(&token, policy.settle_delay).await {
            debug!("Reconnection cancelled during attempt {}", attempt);
            return;
        }

        {
            let mut slot = shared.slot.lock();
            if token.is_cancelled() {
                return;
            }
            if shared.current_state().is_connected() {
                info!("Reconnected to {} on attempt {}", peer, attempt);
                slot.reconnect = None;
                return;
            }
        }
    }

    let mut slot = shared.slot.lock();
    if token.is_cancelled() {
        return;
    }
    error!(
        "Failed to reconnect to {} after {} attempts",
        peer, policy.max_attempts
    );
    slot.reconnect = None;
    shared.release_link(&mut slot);
    shared.set_state(ConnectionState::Failed(
        LinkError::ReconnectionExhausted.to_string(),
    ));
}
