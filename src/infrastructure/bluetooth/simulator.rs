//! Simulated Peripheral
//!
//! An in-memory transport that plays the part of the platform driver. It
//! scripts how link attempts turn out, serves attribute values, records
//! every call made against it, and can broadcast advertisements. The daemon
//! uses it for its demo mode; the tests use it to drive the controller.

use crate::domain::error::LinkError;
use crate::domain::models::{Advertisement, AttributeId, DescriptorId, PeerId, WriteMode};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    LinkEvent, LinkEventSink, LinkId, LinkSession, LinkTransport, ScanFilter, ScanReport,
    ScanTransport,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How the next link attempt turns out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Link comes up.
    Establish,
    /// Driver rejects the attempt synchronously.
    Refuse(LinkError),
    /// Attempt starts, then the link is reported lost.
    Drop(String),
    /// Attempt starts and nothing is ever reported.
    Silent,
}

/// A call made against the simulated driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    OpenLink(PeerId),
    CloseLink(LinkId),
    Discover,
    Read(AttributeId),
    Write(AttributeId, Vec<u8>),
    WriteDescriptor(DescriptorId, Vec<u8>),
    Subscribe(AttributeId),
    StartScan(ScanFilter),
    StopScan,
}

struct SimState {
    outcomes: VecDeque<ConnectOutcome>,
    default_outcome: ConnectOutcome,
    attributes: HashMap<AttributeId, Vec<u8>>,
    auto_complete: bool,
    reject_dispatches: u32,
    reject_discoveries: u32,
    adapter_enabled: bool,
    active_link: Option<LinkEventSink>,
    held_completions: VecDeque<(LinkEventSink, LinkEvent)>,
    scan_tx: Option<mpsc::UnboundedSender<ScanReport>>,
    calls: VecDeque<SimCall>,
}

/// Oldest calls are forgotten beyond this, so a long-running demo stays bounded.
pub const CALL_LOG_LIMIT: usize = 1024;

impl Default for SimState {
    fn default() -> Self {
        let mut attributes = HashMap::new();
        attributes.insert(protocol::battery_level_attribute(), vec![100]);
        Self {
            outcomes: VecDeque::new(),
            default_outcome: ConnectOutcome::Establish,
            attributes,
            auto_complete: true,
            reject_dispatches: 0,
            reject_discoveries: 0,
            adapter_enabled: true,
            active_link: None,
            held_completions: VecDeque::new(),
            scan_tx: None,
            calls: VecDeque::new(),
        }
    }
}

impl SimState {
    fn complete(&mut self, sink: &LinkEventSink, event: LinkEvent) {
        if self.auto_complete {
            sink.emit(event);
        } else {
            self.held_completions.push_back((sink.clone(), event));
        }
    }

    fn record(&mut self, call: SimCall) {
        if self.calls.len() == CALL_LOG_LIMIT {
            self.calls.pop_front();
        }
        self.calls.push_back(call);
    }

    fn take_rejection(&mut self) -> bool {
        take_one(&mut self.reject_dispatches)
    }
}

fn take_one(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

/// Scriptable stand-in for the platform Bluetooth driver
#[derive(Clone, Default)]
pub struct SimulatedPeripheral {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPeripheral {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for the next link attempts, in order.
    pub fn script_connects(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.state.lock().outcomes.extend(outcomes);
    }

    /// Outcome used once the script runs dry.
    pub fn set_default_outcome(&self, outcome: ConnectOutcome) {
        self.state.lock().default_outcome = outcome;
    }

    pub fn set_attribute(&self, attribute: AttributeId, value: Vec<u8>) {
        self.state.lock().attributes.insert(attribute, value);
    }

    pub fn remove_attribute(&self, attribute: &AttributeId) {
        self.state.lock().attributes.remove(attribute);
    }

    /// When off, completions are held until [`Self::complete_next`].
    pub fn set_auto_complete(&self, enabled: bool) {
        self.state.lock().auto_complete = enabled;
    }

    /// Reject the next `count` dispatches synchronously.
    pub fn reject_dispatches(&self, count: u32) {
        self.state.lock().reject_dispatches = count;
    }

    /// Reject the next `count` capability discoveries synchronously.
    pub fn reject_discoveries(&self, count: u32) {
        self.state.lock().reject_discoveries = count;
    }

    pub fn set_adapter_enabled(&self, enabled: bool) {
        self.state.lock().adapter_enabled = enabled;
    }

    /// Release one held completion. Returns false when none was pending.
    pub fn complete_next(&self) -> bool {
        let next = self.state.lock().held_completions.pop_front();
        match next {
            Some((sink, event)) => {
                sink.emit(event);
                true
            }
            None => false,
        }
    }

    pub fn held_completions(&self) -> usize {
        self.state.lock().held_completions.len()
    }

    /// The peer drops the current link.
    pub fn drop_link(&self, reason: &str) {
        if let Some(sink) = self.state.lock().active_link.take() {
            info!("Simulated peer dropping link {}", sink.link_id());
            sink.emit(LinkEvent::Lost {
                reason: reason.to_string(),
            });
        }
    }

    /// The current link comes up (for attempts scripted as `Silent`).
    pub fn establish_link(&self) {
        if let Some(sink) = self.state.lock().active_link.as_ref() {
            sink.emit(LinkEvent::Established);
        }
    }

    pub fn notify(&self, attribute: AttributeId, value: Vec<u8>) {
        if let Some(sink) = self.state.lock().active_link.as_ref() {
            sink.emit(LinkEvent::Notification { attribute, value });
        }
    }

    pub fn report_error(&self, reason: &str) {
        if let Some(sink) = self.state.lock().active_link.as_ref() {
            sink.emit(LinkEvent::Error {
                reason: reason.to_string(),
            });
        }
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.iter().cloned().collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn open_link_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, SimCall::OpenLink(_)))
            .count()
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().scan_tx.is_some()
    }

    /// Deliver one advertisement to the running scan, if any.
    pub fn advertise(&self, advertisement: Advertisement) -> bool {
        match self.state.lock().scan_tx.as_ref() {
            Some(tx) => tx.send(ScanReport::Advertisement(advertisement)).is_ok(),
            None => false,
        }
    }

    /// Close the report stream of the running scan without stopping it.
    pub fn end_scan(&self) {
        if self.state.lock().scan_tx.take().is_some() {
            debug!("Simulated scan stream ended");
        }
    }

    pub fn fail_scan(&self, reason: &str) {
        if let Some(tx) = self.state.lock().scan_tx.as_ref() {
            let _ = tx.send(ScanReport::Failed(reason.to_string()));
        }
    }

    /// Broadcast `name` repeatedly, cycling through `rssi_steps`, while a scan runs.
    pub fn spawn_beacon(
        &self,
        device_id: PeerId,
        name: String,
        rssi_steps: Vec<i16>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let peripheral = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            for rssi in rssi_steps.iter().copied().cycle() {
                ticker.tick().await;
                let heard = peripheral.advertise(Advertisement {
                    device_id: device_id.clone(),
                    name: Some(name.clone()),
                    rssi,
                    payload: Vec::new(),
                });
                if heard {
                    debug!("Beacon {} at {} dBm", name, rssi);
                }
            }
        })
    }
}

impl LinkTransport for SimulatedPeripheral {
    fn open_link(
        &self,
        peer: &PeerId,
        events: LinkEventSink,
    ) -> Result<Box<dyn LinkSession>, LinkError> {
        let mut state = self.state.lock();
        state.record(SimCall::OpenLink(peer.clone()));
        if !state.adapter_enabled {
            return Err(LinkError::TransportUnavailable("adapter disabled".into()));
        }

        let outcome = state
            .outcomes
            .pop_front()
            .unwrap_or_else(|| state.default_outcome.clone());
        debug!("Simulated link {} to {}: {:?}", events.link_id(), peer, outcome);

        match outcome {
            ConnectOutcome::Refuse(e) => return Err(e),
            ConnectOutcome::Establish => {
                events.emit(LinkEvent::Established);
                state.active_link = Some(events.clone());
            }
            ConnectOutcome::Drop(reason) => {
                events.emit(LinkEvent::Lost { reason });
                state.active_link = None;
            }
            ConnectOutcome::Silent => {
                state.active_link = Some(events.clone());
            }
        }

        Ok(Box::new(SimLink {
            id: events.link_id(),
            sink: events,
            state: self.state.clone(),
        }))
    }
}

impl ScanTransport for SimulatedPeripheral {
    fn start_scan(
        &self,
        filter: &ScanFilter,
    ) -> Result<mpsc::UnboundedReceiver<ScanReport>, LinkError> {
        let mut state = self.state.lock();
        state.record(SimCall::StartScan(filter.clone()));
        if !state.adapter_enabled {
            return Err(LinkError::TransportUnavailable(
                "Bluetooth is disabled or not available".into(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.scan_tx = Some(tx);
        Ok(rx)
    }

    fn stop_scan(&self) {
        let mut state = self.state.lock();
        state.record(SimCall::StopScan);
        state.scan_tx = None;
    }
}

struct SimLink {
    id: LinkId,
    sink: LinkEventSink,
    state: Arc<Mutex<SimState>>,
}

impl LinkSession for SimLink {
    fn discover_capabilities(&self) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.record(SimCall::Discover);
        if take_one(&mut state.reject_discoveries) {
            return Err(LinkError::CommandDispatchFailed(
                "discovery rejected".into(),
            ));
        }
        let attributes = state.attributes.keys().copied().collect();
        self.sink
            .emit(LinkEvent::CapabilitiesDiscovered(Ok(attributes)));
        Ok(())
    }

    fn read_attribute(&self, attribute: &AttributeId) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.record(SimCall::Read(*attribute));
        if state.take_rejection() {
            return Err(LinkError::CommandDispatchFailed("read rejected".into()));
        }
        let result = state
            .attributes
            .get(attribute)
            .cloned()
            .ok_or(LinkError::Gatt { status: 0x0A });
        state.complete(
            &self.sink,
            LinkEvent::AttributeRead {
                attribute: *attribute,
                result,
            },
        );
        Ok(())
    }

    fn write_attribute(
        &self,
        attribute: &AttributeId,
        payload: &[u8],
        _mode: WriteMode,
    ) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.record(SimCall::Write(*attribute, payload.to_vec()));
        if state.take_rejection() {
            return Err(LinkError::CommandDispatchFailed("write rejected".into()));
        }
        state.attributes.insert(*attribute, payload.to_vec());
        state.complete(
            &self.sink,
            LinkEvent::AttributeWritten {
                attribute: *attribute,
                result: Ok(()),
            },
        );
        Ok(())
    }

    fn write_descriptor(
        &self,
        descriptor: &DescriptorId,
        payload: &[u8],
    ) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.record(SimCall::WriteDescriptor(*descriptor, payload.to_vec()));
        if state.take_rejection() {
            return Err(LinkError::CommandDispatchFailed(
                "descriptor write rejected".into(),
            ));
        }
        state.complete(
            &self.sink,
            LinkEvent::DescriptorWritten {
                descriptor: *descriptor,
                result: Ok(()),
            },
        );
        Ok(())
    }

    fn subscribe(&self, attribute: &AttributeId) -> Result<(), LinkError> {
        self.state.lock().record(SimCall::Subscribe(*attribute));
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.record(SimCall::CloseLink(self.id));
        if state
            .active_link
            .as_ref()
            .is_some_and(|sink| sink.link_id() == self.id)
        {
            state.active_link = None;
        }
    }
}
