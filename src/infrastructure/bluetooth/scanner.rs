//! BLE Scanner Module
//!
//! Broadcast listening in two flavours: a proximity session that waits for
//! one target to be seen strongly enough, several times in a row, and a
//! plain discovery scan that reports every named device it hears.
//!
//! Both sessions start the underlying scan lazily, on the first call to
//! `next()`, and stop it on every exit path: acquisition, error, end of
//! stream or drop.

use crate::domain::models::{
    Advertisement, DiscoveryEvent, PeerId, PresenceEvent, ScannedDevice,
};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{ScanFilter, ScanReport, ScanTransport};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What a proximity session is looking for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceCriteria {
    /// Case-insensitive substring of the advertised name
    pub target_pattern: String,
    /// Minimum signal strength (dBm) for a sample to count
    pub threshold_rssi: i16,
    /// Back-to-back qualifying samples needed before acting
    pub required_hits: u32,
}

impl Default for PresenceCriteria {
    fn default() -> Self {
        Self {
            target_pattern: "Hanto".to_string(),
            threshold_rssi: -55,
            required_hits: 3,
        }
    }
}

/// Debounced signal-strength filter.
///
/// One weak sample from the target wipes out every strong sample before it.
#[derive(Debug, Clone)]
pub struct ProximityFilter {
    criteria: PresenceCriteria,
    hits: u32,
}

impl ProximityFilter {
    pub fn new(criteria: PresenceCriteria) -> Self {
        Self { criteria, hits: 0 }
    }

    pub fn hits(&self) -> u32 {
        self.hits
    }

    fn required_hits(&self) -> u32 {
        self.criteria.required_hits.max(1)
    }

    /// Feed one sample. Returns the device on the sample that completes the run.
    pub fn observe(&mut self, advertisement: &Advertisement) -> Option<ScannedDevice> {
        let name = protocol::resolve_display_name(advertisement)?;
        if !protocol::name_matches(&name, &self.criteria.target_pattern) {
            return None;
        }

        if advertisement.rssi < self.criteria.threshold_rssi {
            if self.hits > 0 {
                debug!(
                    "Signal dropped to {} dBm. Resetting count.",
                    advertisement.rssi
                );
            }
            self.hits = 0;
            return None;
        }

        self.hits += 1;
        debug!(
            "Signal detected: {} dBm (count: {}/{})",
            advertisement.rssi,
            self.hits,
            self.required_hits()
        );

        if self.hits == self.required_hits() {
            Some(ScannedDevice {
                id: advertisement.device_id.clone(),
                name,
                rssi: advertisement.rssi,
            })
        } else {
            None
        }
    }
}

/// Keeps a scan running for as long as it lives
struct ScanGuard {
    transport: Arc<dyn ScanTransport>,
    reports: mpsc::UnboundedReceiver<ScanReport>,
}

impl ScanGuard {
    fn start(transport: &Arc<dyn ScanTransport>, filter: &ScanFilter) -> Result<Self, String> {
        info!("Starting BLE scan ({:?})", filter);
        let reports = transport
            .start_scan(filter)
            .map_err(|e| e.to_string())?;
        Ok(Self {
            transport: transport.clone(),
            reports,
        })
    }

    async fn next_report(&mut self) -> Option<ScanReport> {
        self.reports.recv().await
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        info!("Stopping BLE scan...");
        self.transport.stop_scan();
    }
}

enum Phase {
    NotStarted,
    Running(ScanGuard),
    Finished,
}

/// Produces proximity sessions over one scan transport.
#[derive(Clone)]
pub struct SignalSampler {
    transport: Arc<dyn ScanTransport>,
}

impl SignalSampler {
    pub fn new(transport: Arc<dyn ScanTransport>) -> Self {
        Self { transport }
    }

    /// A fresh session. Nothing is scanned until the first `next()`.
    pub fn start(&self, criteria: PresenceCriteria) -> PresenceSession {
        PresenceSession {
            transport: self.transport.clone(),
            filter: ProximityFilter::new(criteria),
            phase: Phase::NotStarted,
        }
    }
}

/// Lazy sequence of `Loading`, then `Acquired` or `Error`, then end.
pub struct PresenceSession {
    transport: Arc<dyn ScanTransport>,
    filter: ProximityFilter,
    phase: Phase,
}

impl PresenceSession {
    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Finished)
    }

    pub fn hits(&self) -> u32 {
        self.filter.hits()
    }

    pub async fn next(&mut self) -> Option<PresenceEvent> {
        loop {
            match &mut self.phase {
                Phase::Finished => return None,
                Phase::NotStarted => {
                    let filter = ScanFilter::Name(self.filter.criteria.target_pattern.clone());
                    return match ScanGuard::start(&self.transport, &filter) {
                        Ok(guard) => {
                            self.phase = Phase::Running(guard);
                            Some(PresenceEvent::Loading)
                        }
                        Err(reason) => {
                            // Never started, so there is nothing to stop.
                            warn!("Presence scan could not start: {}", reason);
                            self.phase = Phase::Finished;
                            Some(PresenceEvent::Error(reason))
                        }
                    };
                }
                Phase::Running(guard) => match guard.next_report().await {
                    Some(ScanReport::Advertisement(advertisement)) => {
                        if let Some(device) = self.filter.observe(&advertisement) {
                            info!(
                                "Entry confirmed: {} ({}) at {} dBm",
                                device.name, device.id, device.rssi
                            );
                            self.phase = Phase::Finished;
                            return Some(PresenceEvent::Acquired(device));
                        }
                    }
                    Some(ScanReport::Failed(reason)) => {
                        warn!("Presence scan failed: {}", reason);
                        self.phase = Phase::Finished;
                        return Some(PresenceEvent::Error(reason));
                    }
                    None => {
                        debug!("Scan stream ended");
                        self.phase = Phase::Finished;
                        return None;
                    }
                },
            }
        }
    }
}

/// Plain discovery over one scan transport.
#[derive(Clone)]
pub struct DeviceScanner {
    transport: Arc<dyn ScanTransport>,
}

impl DeviceScanner {
    pub fn new(transport: Arc<dyn ScanTransport>) -> Self {
        Self { transport }
    }

    pub fn scan_devices(&self, filter: ScanFilter) -> DiscoverySession {
        DiscoverySession {
            transport: self.transport.clone(),
            filter,
            phase: Phase::NotStarted,
        }
    }
}

/// Lazy sequence of `Loading`, then one `Found` per named advertisement.
pub struct DiscoverySession {
    transport: Arc<dyn ScanTransport>,
    filter: ScanFilter,
    phase: Phase,
}

impl DiscoverySession {
    pub async fn next(&mut self) -> Option<DiscoveryEvent> {
        loop {
            match &mut self.phase {
                Phase::Finished => return None,
                Phase::NotStarted => {
                    return match ScanGuard::start(&self.transport, &self.filter) {
                        Ok(guard) => {
                            self.phase = Phase::Running(guard);
                            Some(DiscoveryEvent::Loading)
                        }
                        Err(reason) => {
                            self.phase = Phase::Finished;
                            Some(DiscoveryEvent::Error(reason))
                        }
                    };
                }
                Phase::Running(guard) => match guard.next_report().await {
                    Some(ScanReport::Advertisement(advertisement)) => {
                        // Nameless devices are not worth listing.
                        if let Some(name) = protocol::resolve_display_name(&advertisement) {
                            return Some(DiscoveryEvent::Found(ScannedDevice {
                                id: advertisement.device_id,
                                name,
                                rssi: advertisement.rssi,
                            }));
                        }
                    }
                    Some(ScanReport::Failed(reason)) => {
                        warn!("Discovery scan failed: {}", reason);
                        self.phase = Phase::Finished;
                        return Some(DiscoveryEvent::Error(reason));
                    }
                    None => {
                        self.phase = Phase::Finished;
                        return None;
                    }
                },
            }
        }
    }
}

/// Latest sample per device, listed strongest first
#[derive(Debug, Default, Clone)]
pub struct DeviceList {
    devices: HashMap<PeerId, ScannedDevice>,
}

impl DeviceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, device: ScannedDevice) {
        self.devices.insert(device.id.clone(), device);
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn sorted_by_signal(&self) -> Vec<ScannedDevice> {
        let mut devices: Vec<_> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.id.cmp(&b.id)));
        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::LinkError;
    use parking_lot::Mutex;

    fn sample(name: &str, rssi: i16) -> Advertisement {
        Advertisement {
            device_id: PeerId::new(format!("id-{}", name)),
            name: Some(name.to_string()),
            rssi,
            payload: Vec::new(),
        }
    }

    fn criteria(threshold_rssi: i16, required_hits: u32) -> PresenceCriteria {
        PresenceCriteria {
            target_pattern: "Hanto".to_string(),
            threshold_rssi,
            required_hits,
        }
    }

    #[derive(Default)]
    struct FakeScan {
        tx: Mutex<Option<mpsc::UnboundedSender<ScanReport>>>,
        disabled: bool,
        starts: Mutex<u32>,
        stops: Mutex<u32>,
    }

    impl FakeScan {
        fn push(&self, report: ScanReport) {
            if let Some(tx) = self.tx.lock().as_ref() {
                let _ = tx.send(report);
            }
        }
    }

    impl ScanTransport for FakeScan {
        fn start_scan(
            &self,
            _filter: &ScanFilter,
        ) -> Result<mpsc::UnboundedReceiver<ScanReport>, LinkError> {
            if self.disabled {
                return Err(LinkError::TransportUnavailable("adapter off".into()));
            }
            *self.starts.lock() += 1;
            let (tx, rx) = mpsc::unbounded_channel();
            *self.tx.lock() = Some(tx);
            Ok(rx)
        }

        fn stop_scan(&self) {
            *self.stops.lock() += 1;
            self.tx.lock().take();
        }
    }

    #[test]
    fn three_strong_samples_acquire_on_the_third() {
        let mut filter = ProximityFilter::new(criteria(-80, 3));
        assert_eq!(filter.observe(&sample("Hanto-X", -70)), None);
        assert_eq!(filter.observe(&sample("Hanto-X", -70)), None);
        let device = filter.observe(&sample("Hanto-X", -70)).unwrap();
        assert_eq!(device.name, "Hanto-X");
        assert_eq!(device.rssi, -70);
    }

    #[test]
    fn weak_sample_resets_the_run() {
        let mut filter = ProximityFilter::new(criteria(-80, 3));
        let mut counts = Vec::new();
        let mut acquired_at = None;
        for (i, rssi) in [-70, -90, -70, -70, -70].into_iter().enumerate() {
            if filter.observe(&sample("Hanto-X", rssi)).is_some() {
                acquired_at = Some(i + 1);
            }
            counts.push(filter.hits());
        }
        assert_eq!(counts, vec![1, 0, 1, 2, 3]);
        assert_eq!(acquired_at, Some(5));
    }

    #[test]
    fn one_weak_sample_erases_a_long_run() {
        let mut filter = ProximityFilter::new(criteria(-80, 10));
        for _ in 0..9 {
            filter.observe(&sample("Hanto", -50));
        }
        assert_eq!(filter.hits(), 9);
        filter.observe(&sample("Hanto", -81));
        assert_eq!(filter.hits(), 0);
    }

    #[test]
    fn threshold_is_inclusive() {
        let mut filter = ProximityFilter::new(criteria(-80, 1));
        assert!(filter.observe(&sample("Hanto", -80)).is_some());
    }

    #[test]
    fn other_devices_and_nameless_samples_are_ignored() {
        let mut filter = ProximityFilter::new(criteria(-80, 2));
        filter.observe(&sample("hanto-x", -60));
        // Neither of these touch the counter.
        filter.observe(&sample("Sena 50S", -100));
        filter.observe(&Advertisement {
            device_id: PeerId::new("anon"),
            name: None,
            rssi: -100,
            payload: Vec::new(),
        });
        assert_eq!(filter.hits(), 1);
        assert!(filter.observe(&sample("HANTO-X", -60)).is_some());
    }

    #[test]
    fn embedded_name_is_used_when_platform_has_none() {
        let mut filter = ProximityFilter::new(criteria(-80, 1));
        let advertisement = Advertisement {
            device_id: PeerId::new("AA"),
            name: None,
            rssi: -40,
            payload: vec![0x06, 0x09, b'H', b'a', b'n', b't', b'o'],
        };
        assert_eq!(filter.observe(&advertisement).unwrap().name, "Hanto");
    }

    #[test]
    fn zero_required_hits_behaves_as_one() {
        let mut filter = ProximityFilter::new(criteria(-80, 0));
        assert!(filter.observe(&sample("Hanto", -70)).is_some());
    }

    #[tokio::test]
    async fn session_emits_loading_then_acquired_then_ends() {
        let scan = Arc::new(FakeScan::default());
        let sampler = SignalSampler::new(scan.clone());
        let mut session = sampler.start(criteria(-80, 3));

        assert_eq!(*scan.starts.lock(), 0, "scan must start lazily");
        assert_eq!(session.next().await, Some(PresenceEvent::Loading));
        assert_eq!(*scan.starts.lock(), 1);

        for _ in 0..3 {
            scan.push(ScanReport::Advertisement(sample("Hanto-X", -70)));
        }
        // Samples after acquisition are never looked at.
        scan.push(ScanReport::Advertisement(sample("Hanto-X", -70)));

        match session.next().await {
            Some(PresenceEvent::Acquired(device)) => assert_eq!(device.name, "Hanto-X"),
            other => panic!("expected acquisition, got {:?}", other),
        }
        assert_eq!(session.next().await, None);
        assert!(session.is_finished());

        drop(session);
        assert_eq!(*scan.stops.lock(), 1);
    }

    #[tokio::test]
    async fn disabled_adapter_errors_without_starting() {
        let scan = Arc::new(FakeScan {
            disabled: true,
            ..Default::default()
        });
        let mut session = SignalSampler::new(scan.clone()).start(criteria(-80, 3));

        assert!(matches!(session.next().await, Some(PresenceEvent::Error(_))));
        assert_eq!(session.next().await, None);
        drop(session);
        assert_eq!(*scan.stops.lock(), 0);
    }

    #[tokio::test]
    async fn mid_session_failure_ends_session_and_stops_scan() {
        let scan = Arc::new(FakeScan::default());
        let mut session = SignalSampler::new(scan.clone()).start(criteria(-80, 3));
        session.next().await;

        scan.push(ScanReport::Advertisement(sample("Hanto", -70)));
        scan.push(ScanReport::Failed("code 2".into()));

        assert_eq!(
            session.next().await,
            Some(PresenceEvent::Error("code 2".into()))
        );
        assert_eq!(session.next().await, None);
        drop(session);
        assert_eq!(*scan.stops.lock(), 1);
    }

    #[tokio::test]
    async fn dropping_a_running_session_stops_the_scan() {
        let scan = Arc::new(FakeScan::default());
        let mut session = SignalSampler::new(scan.clone()).start(criteria(-80, 3));
        session.next().await;
        drop(session);
        assert_eq!(*scan.stops.lock(), 1);
    }

    #[tokio::test]
    async fn discovery_skips_nameless_devices() {
        let scan = Arc::new(FakeScan::default());
        let mut session = DeviceScanner::new(scan.clone()).scan_devices(ScanFilter::Any);
        assert_eq!(session.next().await, Some(DiscoveryEvent::Loading));

        scan.push(ScanReport::Advertisement(Advertisement {
            device_id: PeerId::new("anon"),
            name: None,
            rssi: -30,
            payload: Vec::new(),
        }));
        scan.push(ScanReport::Advertisement(sample("Sena", -65)));

        match session.next().await {
            Some(DiscoveryEvent::Found(device)) => assert_eq!(device.name, "Sena"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn device_list_keeps_latest_sample_strongest_first() {
        let mut list = DeviceList::new();
        let device = |id: &str, rssi| ScannedDevice {
            id: PeerId::new(id),
            name: id.to_string(),
            rssi,
        };
        list.update(device("a", -90));
        list.update(device("b", -60));
        list.update(device("a", -40));

        let sorted = list.sorted_by_signal();
        assert_eq!(list.len(), 2);
        assert_eq!(sorted[0].id, PeerId::new("a"));
        assert_eq!(sorted[0].rssi, -40);
        assert_eq!(sorted[1].id, PeerId::new("b"));
    }
}
