use ridesync::domain::error::LinkError;
use ridesync::domain::models::{AttributeId, Command, ConnectionState, PeerId, WriteMode};
use ridesync::infrastructure::bluetooth::connection::{ConnectionConfig, ConnectionController};
use ridesync::infrastructure::bluetooth::protocol::{self, ENABLE_NOTIFICATION_VALUE};
use ridesync::infrastructure::bluetooth::simulator::{ConnectOutcome, SimCall, SimulatedPeripheral};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

const PEER: &str = "C4:7D:46:00:11:22";

fn setup() -> (SimulatedPeripheral, ConnectionController) {
    let peripheral = SimulatedPeripheral::new();
    let controller =
        ConnectionController::new(Arc::new(peripheral.clone()), ConnectionConfig::default());
    (peripheral, controller)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn sleep_secs(secs: f64) {
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}

fn drain(rx: &mut broadcast::Receiver<ConnectionState>) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    while let Ok(state) = rx.try_recv() {
        seen.push(state);
    }
    seen
}

async fn connected(peripheral: &SimulatedPeripheral, controller: &ConnectionController) {
    controller.connect(PeerId::new(PEER));
    settle().await;
    assert_eq!(controller.state(), ConnectionState::Connected(PeerId::new(PEER)));
    peripheral.clear_calls();
}

#[tokio::test(start_paused = true)]
async fn unexpected_drop_retries_three_times_then_fails() {
    let (peripheral, controller) = setup();
    connected(&peripheral, &controller).await;
    let mut transitions = controller.subscribe_transitions();

    peripheral.set_default_outcome(ConnectOutcome::Refuse(LinkError::TransportUnavailable(
        "peer out of range".into(),
    )));
    peripheral.drop_link("supervision timeout");
    settle().await;
    assert!(controller.is_reconnecting());
    assert_eq!(peripheral.open_link_count(), 0);

    // Attempts at +5s, +12s and +19s; the last settle window ends at +21s.
    sleep_secs(4.9).await;
    assert_eq!(peripheral.open_link_count(), 0);
    sleep_secs(0.2).await;
    assert_eq!(peripheral.open_link_count(), 1);
    sleep_secs(7.0).await;
    assert_eq!(peripheral.open_link_count(), 2);
    sleep_secs(7.0).await;
    assert_eq!(peripheral.open_link_count(), 3);
    assert_eq!(controller.state(), ConnectionState::Connecting);

    sleep_secs(2.0).await;
    assert_eq!(
        controller.state(),
        ConnectionState::Failed("automatic reconnection failed".into())
    );
    assert!(!controller.is_reconnecting());

    assert_eq!(
        drain(&mut transitions),
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Failed("automatic reconnection failed".into()),
        ]
    );

    sleep_secs(60.0).await;
    assert_eq!(peripheral.open_link_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn attempts_that_drop_again_count_as_failures() {
    let (peripheral, controller) = setup();
    connected(&peripheral, &controller).await;
    let mut transitions = controller.subscribe_transitions();

    peripheral.set_default_outcome(ConnectOutcome::Drop(
        "connection failed to be established".into(),
    ));
    peripheral.drop_link("supervision timeout");
    sleep_secs(30.0).await;

    assert_eq!(peripheral.open_link_count(), 3);
    let seen = drain(&mut transitions);
    assert_eq!(seen.first(), Some(&ConnectionState::Disconnected));
    assert_eq!(seen.get(1), Some(&ConnectionState::Connecting));
    assert_eq!(
        seen.last(),
        Some(&ConnectionState::Failed("automatic reconnection failed".into()))
    );
    assert!(!seen.iter().any(ConnectionState::is_connected));
}

#[tokio::test(start_paused = true)]
async fn success_on_second_attempt_stops_the_policy() {
    let (peripheral, controller) = setup();
    connected(&peripheral, &controller).await;

    peripheral.script_connects([
        ConnectOutcome::Refuse(LinkError::TransportUnavailable("busy".into())),
        ConnectOutcome::Establish,
    ]);
    peripheral.drop_link("supervision timeout");

    sleep_secs(12.5).await;
    assert_eq!(controller.state(), ConnectionState::Connected(PeerId::new(PEER)));
    assert!(!controller.is_reconnecting());

    sleep_secs(60.0).await;
    assert_eq!(peripheral.open_link_count(), 2);
    assert!(controller.state().is_connected());
}

#[tokio::test(start_paused = true)]
async fn disconnect_when_idle_changes_nothing() {
    let (peripheral, controller) = setup();
    let mut transitions = controller.subscribe_transitions();

    controller.disconnect();
    controller.disconnect();
    sleep_secs(30.0).await;

    assert_eq!(controller.state(), ConnectionState::Disconnected);
    assert!(drain(&mut transitions).is_empty());
    assert_eq!(peripheral.open_link_count(), 0);
    assert!(!controller.is_reconnecting());
}

#[tokio::test(start_paused = true)]
async fn user_disconnect_never_reconnects() {
    let (peripheral, controller) = setup();
    connected(&peripheral, &controller).await;

    controller.disconnect();
    assert_eq!(controller.state(), ConnectionState::Disconnected);
    assert!(!controller.has_link());
    assert!(peripheral.calls().contains(&SimCall::CloseLink(1)));

    sleep_secs(30.0).await;

    assert_eq!(controller.state(), ConnectionState::Disconnected);
    assert_eq!(peripheral.open_link_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_a_running_policy() {
    let (peripheral, controller) = setup();
    connected(&peripheral, &controller).await;

    peripheral.drop_link("supervision timeout");
    settle().await;
    assert!(controller.is_reconnecting());

    sleep_secs(3.0).await;
    controller.disconnect();
    assert!(!controller.is_reconnecting());

    sleep_secs(30.0).await;
    assert_eq!(controller.state(), ConnectionState::Disconnected);
    assert_eq!(peripheral.open_link_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn explicit_connect_replaces_a_running_policy() {
    let (peripheral, controller) = setup();
    connected(&peripheral, &controller).await;

    peripheral.drop_link("supervision timeout");
    settle().await;

    let other = PeerId::new("00:11:22:33:44:55");
    controller.connect(other.clone());
    assert!(!controller.is_reconnecting());
    settle().await;
    assert_eq!(controller.state(), ConnectionState::Connected(other.clone()));

    sleep_secs(30.0).await;
    assert_eq!(peripheral.open_link_count(), 1);
    assert_eq!(controller.last_peer(), Some(other));
}

#[tokio::test(start_paused = true)]
async fn failed_explicit_connect_feeds_the_policy() {
    let (peripheral, controller) = setup();
    peripheral.script_connects([ConnectOutcome::Refuse(LinkError::TransportUnavailable(
        "adapter busy".into(),
    ))]);

    controller.connect(PeerId::new(PEER));
    assert!(controller.is_reconnecting());
    assert_eq!(controller.state(), ConnectionState::Connecting);

    sleep_secs(5.5).await;
    assert_eq!(controller.state(), ConnectionState::Connected(PeerId::new(PEER)));
    assert_eq!(peripheral.open_link_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn rejected_discovery_releases_the_link_and_retries() {
    let (peripheral, controller) = setup();
    let mut transitions = controller.subscribe_transitions();
    peripheral.reject_discoveries(1);

    controller.connect(PeerId::new(PEER));
    settle().await;
    assert_eq!(controller.state(), ConnectionState::Connecting);
    assert!(controller.is_reconnecting());
    assert!(!controller.has_link());
    assert!(peripheral.calls().contains(&SimCall::CloseLink(1)));

    sleep_secs(5.5).await;
    assert_eq!(controller.state(), ConnectionState::Connected(PeerId::new(PEER)));
    assert!(!controller.is_reconnecting());
    assert_eq!(peripheral.open_link_count(), 2);
    assert_eq!(
        drain(&mut transitions),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected(PeerId::new(PEER)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_discovery_during_reconnection_counts_as_a_failed_attempt() {
    let (peripheral, controller) = setup();
    connected(&peripheral, &controller).await;

    peripheral.reject_discoveries(1);
    peripheral.drop_link("supervision timeout");

    // Attempt 1 at +5s comes up but cannot discover; attempt 2 at +12s succeeds.
    sleep_secs(5.5).await;
    assert!(controller.is_reconnecting());
    assert!(!controller.state().is_connected());

    sleep_secs(7.0).await;
    assert_eq!(controller.state(), ConnectionState::Connected(PeerId::new(PEER)));
    assert!(!controller.is_reconnecting());
    assert_eq!(peripheral.open_link_count(), 2);
    let discoveries = peripheral
        .calls()
        .iter()
        .filter(|call| matches!(call, SimCall::Discover))
        .count();
    assert_eq!(discoveries, 2);
}

#[tokio::test(start_paused = true)]
async fn transport_error_fails_without_retrying() {
    let (peripheral, controller) = setup();
    connected(&peripheral, &controller).await;

    peripheral.report_error("GATT_ERROR 133");
    sleep_secs(30.0).await;

    assert_eq!(controller.state(), ConnectionState::Failed("GATT_ERROR 133".into()));
    assert!(!controller.has_link());
    assert_eq!(peripheral.open_link_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn post_connect_setup_runs_one_command_at_a_time() {
    let (peripheral, controller) = setup();
    peripheral.set_attribute(protocol::battery_level_attribute(), vec![64]);
    peripheral.set_auto_complete(false);

    controller.connect(PeerId::new(PEER));
    settle().await;

    let battery = protocol::battery_level_attribute();
    let cccd = protocol::client_config_descriptor(battery);
    assert!(controller.state().is_connected());
    assert_eq!(
        peripheral.calls(),
        vec![
            SimCall::OpenLink(PeerId::new(PEER)),
            SimCall::Discover,
            SimCall::Read(battery),
            SimCall::Subscribe(battery),
        ]
    );
    assert!(controller.queue().is_busy());
    assert_eq!(controller.queue().len(), 1);
    assert_eq!(controller.battery_level(), None);

    assert!(peripheral.complete_next());
    settle().await;
    assert_eq!(controller.battery_level(), Some(64));
    assert_eq!(
        peripheral.calls().last(),
        Some(&SimCall::WriteDescriptor(cccd, ENABLE_NOTIFICATION_VALUE.to_vec()))
    );
    assert!(controller.queue().is_busy());

    assert!(peripheral.complete_next());
    settle().await;
    assert!(!controller.queue().is_busy());
    assert!(controller.queue().is_empty());
}

#[tokio::test(start_paused = true)]
async fn user_commands_wait_behind_setup() {
    let (peripheral, controller) = setup();
    peripheral.set_auto_complete(false);
    controller.connect(PeerId::new(PEER));
    settle().await;

    let volume = AttributeId(Uuid::from_u128(0x0000ff01_0000_1000_8000_00805f9b34fb));
    controller.enqueue(Command::Write {
        attribute: volume,
        payload: vec![7],
        mode: WriteMode::WithResponse,
    });
    assert_eq!(controller.queue().len(), 2);

    while peripheral.complete_next() {
        settle().await;
    }

    let calls = peripheral.calls();
    let descriptor_at = calls
        .iter()
        .position(|c| matches!(c, SimCall::WriteDescriptor(..)))
        .unwrap();
    let write_at = calls
        .iter()
        .position(|c| *c == SimCall::Write(volume, vec![7]))
        .unwrap();
    assert!(descriptor_at < write_at);
    assert!(!controller.queue().is_busy());
}

#[tokio::test(start_paused = true)]
async fn rejected_dispatch_is_skipped() {
    let (peripheral, controller) = setup();
    connected(&peripheral, &controller).await;

    let attr = AttributeId(Uuid::from_u128(0xff02));
    peripheral.set_attribute(attr, vec![1]);
    peripheral.reject_dispatches(1);

    controller.enqueue(Command::Read(attr));
    controller.enqueue(Command::Read(protocol::battery_level_attribute()));
    settle().await;

    assert_eq!(
        peripheral.calls(),
        vec![
            SimCall::Read(attr),
            SimCall::Read(protocol::battery_level_attribute()),
        ]
    );
    assert!(!controller.queue().is_busy());
}

#[tokio::test(start_paused = true)]
async fn notifications_update_battery_level() {
    let (peripheral, controller) = setup();
    connected(&peripheral, &controller).await;
    assert_eq!(controller.battery_level(), Some(100));

    let mut levels = controller.subscribe_battery_level();
    peripheral.notify(protocol::battery_level_attribute(), vec![42]);
    settle().await;
    assert!(levels.has_changed().unwrap());
    assert_eq!(*levels.borrow_and_update(), Some(42));

    peripheral.notify(AttributeId(Uuid::from_u128(0xff03)), vec![5]);
    settle().await;
    assert_eq!(controller.battery_level(), Some(42));
}

#[tokio::test(start_paused = true)]
async fn link_loss_clears_queue_and_battery() {
    let (peripheral, controller) = setup();
    connected(&peripheral, &controller).await;
    peripheral.set_auto_complete(false);

    controller.enqueue(Command::Read(protocol::battery_level_attribute()));
    controller.enqueue(Command::Read(protocol::battery_level_attribute()));
    assert!(controller.queue().is_busy());

    peripheral.drop_link("supervision timeout");
    settle().await;

    assert!(!controller.queue().is_busy());
    assert!(controller.queue().is_empty());
    assert_eq!(controller.battery_level(), None);

    // The held completion belongs to the dead link and changes nothing.
    assert!(peripheral.complete_next());
    settle().await;
    assert!(!controller.queue().is_busy());
    assert_eq!(controller.battery_level(), None);
}
