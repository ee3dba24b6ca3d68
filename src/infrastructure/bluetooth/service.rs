//! RideSync Service Module
//!
//! Main service that wires the connection controller, the scanners and the
//! presence orchestrator together from persisted settings.

use crate::domain::models::{Command, ConnectionState, PeerId};
use crate::domain::settings::{Settings, SettingsService};
use crate::infrastructure::bluetooth::{
    connection::{ConnectionConfig, ConnectionController, ReconnectPolicy},
    presence::{PresenceHandle, PresenceOrchestrator},
    protocol,
    scanner::{DeviceScanner, DiscoverySession, PresenceCriteria, PresenceSession, SignalSampler},
    transport::{LinkTransport, ScanFilter, ScanTransport},
};
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection settings as the controller wants them
pub fn connection_config(settings: &Settings) -> Result<ConnectionConfig> {
    let reconnect = &settings.reconnect;
    Ok(ConnectionConfig {
        reconnect: ReconnectPolicy {
            max_attempts: reconnect.max_attempts,
            retry_delay: Duration::from_millis(reconnect.retry_delay_ms),
            settle_delay: Duration::from_millis(reconnect.settle_delay_ms),
        },
        battery_level: protocol::parse_attribute_id(&settings.attributes.battery_level_uuid)?,
    })
}

pub fn presence_criteria(settings: &Settings) -> PresenceCriteria {
    PresenceCriteria {
        target_pattern: settings.presence.target_pattern.clone(),
        threshold_rssi: settings.presence.threshold_rssi,
        required_hits: settings.presence.required_hits,
    }
}

/// Main service coordinating all link operations
pub struct RideSyncService {
    controller: ConnectionController,
    sampler: SignalSampler,
    scanner: DeviceScanner,
    criteria: PresenceCriteria,
    session_timeout: Duration,
    settings: Arc<Mutex<SettingsService>>,
    _peer_recorder: JoinHandle<()>,
}

impl RideSyncService {
    /// Create the service. Must be called inside a tokio runtime.
    pub fn new<T>(transport: Arc<T>, settings: Arc<Mutex<SettingsService>>) -> Result<Self>
    where
        T: LinkTransport + ScanTransport + 'static,
    {
        let (config, criteria, session_timeout) = {
            let settings = settings.lock();
            let s = settings.get();
            (
                connection_config(s)?,
                presence_criteria(s),
                Duration::from_millis(s.presence.session_timeout_ms),
            )
        };

        let controller = ConnectionController::new(transport.clone(), config);
        let peer_recorder = spawn_peer_recorder(controller.subscribe_transitions(), settings.clone());

        Ok(Self {
            controller,
            sampler: SignalSampler::new(transport.clone()),
            scanner: DeviceScanner::new(transport),
            criteria,
            session_timeout,
            settings,
            _peer_recorder: peer_recorder,
        })
    }

    pub fn connect(&self, peer: PeerId) {
        self.controller.connect(peer);
    }

    /// Connect to the peer the last link was established with.
    pub fn connect_last_known(&self) -> Result<PeerId> {
        let peer = self
            .settings
            .lock()
            .get()
            .last_connected_peer
            .clone()
            .ok_or_else(|| anyhow::anyhow!("No previously connected peer"))?;
        self.controller.connect(peer.clone());
        Ok(peer)
    }

    pub fn disconnect(&self) {
        self.controller.disconnect();
    }

    pub fn enqueue(&self, command: Command) {
        self.controller.enqueue(command);
    }

    pub fn state(&self) -> ConnectionState {
        self.controller.state()
    }

    pub fn is_connected(&self) -> bool {
        self.controller.state().is_connected()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.controller.subscribe_state()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.controller.subscribe_transitions()
    }

    pub fn battery_level(&self) -> Option<u8> {
        self.controller.battery_level()
    }

    pub fn subscribe_battery_level(&self) -> watch::Receiver<Option<u8>> {
        self.controller.subscribe_battery_level()
    }

    /// One proximity session with the configured criteria, for callers that
    /// want to decide themselves what to do on acquisition.
    pub fn detect_presence(&self) -> PresenceSession {
        self.sampler.start(self.criteria.clone())
    }

    /// Discovery scan for every named device, or only those matching `name`.
    pub fn scan_devices(&self, name: Option<&str>) -> DiscoverySession {
        let filter = match name {
            Some(name) => ScanFilter::Name(name.to_string()),
            None => ScanFilter::Any,
        };
        self.scanner.scan_devices(filter)
    }

    /// Automatic presence detection and auto-connect
    pub fn start_presence(&self) -> PresenceHandle {
        PresenceOrchestrator::new(
            self.sampler.clone(),
            self.controller.clone(),
            self.criteria.clone(),
            self.session_timeout,
        )
        .start()
    }

    pub fn controller(&self) -> &ConnectionController {
        &self.controller
    }
}

fn spawn_peer_recorder(
    mut transitions: broadcast::Receiver<ConnectionState>,
    settings: Arc<Mutex<SettingsService>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match transitions.recv().await {
                Ok(ConnectionState::Connected(peer)) => {
                    info!("Remembering {} as last connected peer", peer);
                    if let Err(e) = settings.lock().record_connected_peer(&peer) {
                        warn!("Failed to save settings: {}", e);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Peer recorder skipped {} transitions", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
