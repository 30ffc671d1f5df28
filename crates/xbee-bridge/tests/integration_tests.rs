//! Integration tests for the XBee bridge
//!
//! These tests run the full bridge event loop against a mock radio link and
//! a recording bus:
//! - Radio to bus flow (serial lines, IO samples, pin reports)
//! - Bus to radio flow (set sequences, paced queries)
//! - Response sequencing (discovery, change detection)
//! - Lifecycle (startup, reconnect, reload, shutdown)

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use xbee_bridge::test_utils::packets;
use xbee_bridge::{
    Address, BridgeConfigBuilder, BridgeError, BridgeHandle, BridgeSettings, CommandDispatcher,
    MockLink, MockLinkHandle, ReconnectConfig, RecordingBus, Result, RoutingTable, SampleValue,
    XBeeBridge,
};

const NODE: &str = "0013a20040401122";

fn node() -> Address {
    NODE.parse().unwrap()
}

fn topic(port: &str) -> String {
    format!("raw/xbee/{}/{}", NODE, port)
}

// ============================================================================
// Test Infrastructure
// ============================================================================

struct Harness {
    task: JoinHandle<Result<()>>,
    handle: BridgeHandle,
    radio: MockLinkHandle,
    bus: RecordingBus,
}

fn spawn_bridge(settings: &BridgeSettings) -> Harness {
    spawn_with_link(MockLink::new(), settings)
}

fn spawn_with_link(link: MockLink, settings: &BridgeSettings) -> Harness {
    let radio = link.handle();
    let bus = RecordingBus::new();
    let (bridge, handle) = XBeeBridge::new(link, settings, Arc::new(bus.clone())).unwrap();
    let task = tokio::spawn(bridge.run());
    Harness {
        task,
        handle,
        radio,
        bus,
    }
}

/// Poll until `condition` holds, advancing (paused) time in small steps
async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn quiet_settings() -> BridgeSettings {
    BridgeConfigBuilder::new()
        .discovery_on_connect(false)
        .build()
        .general
}

impl Harness {
    async fn stop(self) -> Result<()> {
        self.handle.shutdown().await?;
        self.task.await.unwrap()
    }
}

// ============================================================================
// Integration Tests: Bridge Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_startup_subscribes_and_discovers() {
    let settings = BridgeConfigBuilder::new()
        .route(NODE, "dio-3", "/home/garden/pump")
        .build()
        .general;
    let harness = spawn_bridge(&settings);

    let radio = harness.radio.clone();
    wait_until(|| !radio.sent().is_empty()).await;

    assert_eq!(harness.radio.sent_commands(), vec![("ND".to_string(), None)]);
    assert_eq!(
        harness.bus.subscriptions(),
        vec!["/home/garden/pump/set".to_string()]
    );
    assert_eq!(harness.radio.connects(), 1);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_connect_failure_is_fatal() {
    let link = MockLink::new().with_connect_failure();
    let (bridge, _handle) =
        XBeeBridge::new(link, &quiet_settings(), Arc::new(RecordingBus::new())).unwrap();

    let result = bridge.run().await;
    assert!(matches!(result, Err(BridgeError::LinkConnectFailed { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_read_error() {
    let harness = spawn_bridge(&quiet_settings());

    harness
        .radio
        .push_error(BridgeError::ReadError("serial glitch".to_string()));
    let radio = harness.radio.clone();
    wait_until(|| radio.connects() == 2).await;

    // Still serving after the reconnect
    harness.radio.push(packets::data(NODE, "temp:21\n"));
    let bus = harness.bus.clone();
    wait_until(|| !bus.published().is_empty()).await;

    let stats = harness.handle.stats().await.unwrap();
    assert_eq!(stats.link_errors, 1);
    assert_eq!(stats.radio_to_bus, 1);

    harness.stop().await.unwrap();
}

fn fast_reconnect(max_attempts: u32) -> BridgeSettings {
    BridgeConfigBuilder::new()
        .discovery_on_connect(false)
        .reconnect(ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts,
            ..Default::default()
        })
        .build()
        .general
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_retries_until_link_returns() {
    let harness = spawn_with_link(MockLink::new(), &fast_reconnect(0));
    let radio = harness.radio.clone();
    wait_until(|| radio.connects() == 1).await;

    // Second connect fails, third succeeds
    harness.radio.fail_next_connects(1);
    harness
        .radio
        .push_error(BridgeError::ReadError("radio rebooting".to_string()));
    wait_until(|| radio.connects() == 3).await;

    harness.radio.push(packets::data(NODE, "temp:21\n"));
    let bus = harness.bus.clone();
    wait_until(|| !bus.published().is_empty()).await;

    let stats = harness.handle.stats().await.unwrap();
    assert_eq!(stats.link_errors, 1);
    assert_eq!(stats.reconnects, 1);

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_bridge_serves_commands_while_link_down() {
    let harness = spawn_with_link(MockLink::new(), &fast_reconnect(0));
    let radio = harness.radio.clone();
    wait_until(|| radio.connects() == 1).await;

    harness.radio.fail_next_connects(usize::MAX);
    harness
        .radio
        .push_error(BridgeError::ReadError("radio rebooting".to_string()));
    wait_until(|| radio.connects() >= 5).await;

    // Still running and answering
    assert!(!harness.task.is_finished());
    let stats = harness.handle.stats().await.unwrap();
    assert_eq!(stats.link_errors, 1);
    assert_eq!(stats.reconnects, 0);

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_max_attempts() {
    let Harness { task, radio, handle, .. } =
        spawn_with_link(MockLink::new(), &fast_reconnect(3));
    let watched = radio.clone();
    wait_until(|| watched.connects() == 1).await;

    radio.fail_next_connects(usize::MAX);
    radio.push_error(BridgeError::ReadError("radio gone".to_string()));

    let result = task.await.unwrap();
    assert!(matches!(result, Err(BridgeError::LinkConnectFailed { .. })));
    // Initial connect plus three attempts
    assert_eq!(radio.connects(), 4);
    drop(handle);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_handles_stop_bridge() {
    let Harness { task, handle, .. } = spawn_bridge(&quiet_settings());
    drop(handle);
    assert!(task.await.unwrap().is_ok());
}

// ============================================================================
// Integration Tests: Radio to Bus
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_serial_lines_to_bus() {
    let harness = spawn_bridge(&quiet_settings());

    harness.radio.push(packets::data(NODE, "12:3\n45:6\n"));
    let bus = harness.bus.clone();
    wait_until(|| bus.published().len() == 2).await;

    assert_eq!(
        harness.bus.published(),
        vec![
            (topic("12"), "3".to_string()),
            (topic("45"), "6".to_string()),
        ]
    );

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fragmented_serial_line() {
    let harness = spawn_bridge(&quiet_settings());

    harness.radio.push(packets::data(NODE, "abc"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.bus.published().is_empty());

    harness.radio.push(packets::data(NODE, "def\n"));
    let bus = harness.bus.clone();
    wait_until(|| !bus.published().is_empty()).await;
    assert_eq!(harness.bus.values(&topic("serial")), vec!["abcdef".to_string()]);

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_io_sample_with_item_pattern() {
    let settings = BridgeConfigBuilder::new()
        .discovery_on_connect(false)
        .topic_pattern("/raw/xbee/{address}/{item}/{port}")
        .build()
        .general;
    let harness = spawn_bridge(&settings);

    harness.radio.push(packets::io_sample(
        NODE,
        &[
            ("adc-5", SampleValue::Analog(512)),
            ("dio-3", SampleValue::Digital(false)),
        ],
    ));
    let bus = harness.bus.clone();
    wait_until(|| bus.published().len() == 2).await;

    assert_eq!(
        harness.bus.values(&format!("raw/xbee/{}/analog/adc-5", NODE)),
        vec!["512".to_string()]
    );
    assert_eq!(
        harness.bus.values(&format!("raw/xbee/{}/digital/dio-3", NODE)),
        vec!["0".to_string()]
    );
    assert_eq!(
        harness.bus.subscriptions(),
        vec![format!("raw/xbee/{}/digital/dio-3/set", NODE)]
    );

    // The subscribed topic drives the same pin
    harness
        .handle
        .bus_message(format!("raw/xbee/{}/digital/dio-3/set", NODE), "1")
        .await
        .unwrap();
    let radio = harness.radio.clone();
    wait_until(|| radio.sent().len() == 3).await;
    assert_eq!(harness.radio.sent_commands()[0], ("D3".to_string(), Some(vec![5])));

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_window() {
    let harness = spawn_bridge(&quiet_settings());
    let sample = packets::io_sample(NODE, &[("dio-1", SampleValue::Digital(true))]);

    harness.radio.push(sample.clone());
    harness.radio.push(sample.clone());
    let bus = harness.bus.clone();
    wait_until(|| bus.published().len() == 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.bus.published().len(), 1);

    // After the window the same value goes out again
    tokio::time::sleep(Duration::from_secs(5)).await;
    harness.radio.push(sample);
    wait_until(|| bus.published().len() == 2).await;

    let stats = harness.handle.stats().await.unwrap();
    assert_eq!(stats.duplicates_suppressed, 1);

    harness.stop().await.unwrap();
}

// ============================================================================
// Integration Tests: Bus to Radio
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_bus_message_sets_digital_output() {
    let harness = spawn_bridge(&quiet_settings());

    harness
        .handle
        .bus_message(format!("{}/set", topic("dio-3")), "1")
        .await
        .unwrap();
    let radio = harness.radio.clone();
    wait_until(|| radio.sent().len() == 3).await;

    assert_eq!(
        harness.radio.sent_commands(),
        vec![
            ("D3".to_string(), Some(vec![5])),
            ("WR".to_string(), None),
            ("D3".to_string(), None),
        ]
    );
    assert!(harness
        .radio
        .sent()
        .iter()
        .all(|command| command.destination() == Some(&node())));

    let stats = harness.handle.stats().await.unwrap();
    assert_eq!(stats.bus_to_radio, 1);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_volatile_pin_configuration() {
    let mut link = MockLink::connected();
    let radio = link.handle();
    let mut dispatcher = CommandDispatcher::new(
        Duration::from_millis(100),
        Duration::from_secs(30),
        false,
    );

    assert!(
        dispatcher
            .send_message(&mut link, &node(), "pin-12", "5", false)
            .await
    );
    assert_eq!(
        radio.sent_commands(),
        vec![
            ("P2".to_string(), Some(vec![5])),
            ("AC".to_string(), None),
            ("P2".to_string(), None),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_is_counted() {
    let harness = spawn_bridge(&quiet_settings());
    harness.radio.fail_writes(true);

    harness
        .handle
        .bus_message(format!("{}/set", topic("dio-3")), "1")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = harness.handle.stats().await.unwrap();
    assert_eq!(stats.bus_to_radio, 0);
    assert_eq!(stats.command_failures, 1);

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_after_bus_session_loss() {
    let settings = BridgeConfigBuilder::new()
        .discovery_on_connect(false)
        .route(NODE, "dio-4", "/home/garden/lights")
        .build()
        .general;
    let harness = spawn_bridge(&settings);

    harness.radio.push(packets::io_sample(
        NODE,
        &[("dio-3", SampleValue::Digital(true))],
    ));
    let bus = harness.bus.clone();
    wait_until(|| bus.subscriptions().len() == 2).await;

    harness.handle.resubscribe().await.unwrap();
    wait_until(|| bus.subscriptions().len() == 4).await;

    let mut renewed = harness.bus.subscriptions().split_off(2);
    renewed.sort();
    assert_eq!(
        renewed,
        vec![
            "/home/garden/lights/set".to_string(),
            format!("{}/set", topic("dio-3")),
        ]
    );

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reload_routes() {
    let harness = spawn_bridge(&quiet_settings());

    let routes = BridgeConfigBuilder::new()
        .route(NODE, "dio-4", "/home/garden/lights")
        .build()
        .general
        .routes;
    harness.handle.reload(routes).await.unwrap();

    harness
        .handle
        .bus_message("/home/garden/lights/set", "0")
        .await
        .unwrap();
    let radio = harness.radio.clone();
    wait_until(|| radio.sent().len() == 3).await;

    assert_eq!(
        harness.radio.sent_commands()[0],
        ("D4".to_string(), Some(vec![4]))
    );
    assert_eq!(
        harness.bus.subscriptions(),
        vec!["/home/garden/lights/set".to_string()]
    );

    harness.stop().await.unwrap();
}

#[test]
fn test_static_routes_round_trip() {
    let settings = BridgeConfigBuilder::new()
        .route(NODE, "dio-3", "/home/garden/pump")
        .route(NODE, "serial", "home/garden/console")
        .route("0013a200404011ff", "pin-11", "/home/shed/door")
        .build()
        .general;
    let routing = RoutingTable::from_settings(&settings).unwrap();

    for (address, port, _) in routing.routes() {
        let topic = routing.resolve_outbound(address, port).unwrap();
        assert_eq!(
            routing.resolve_inbound(&format!("{}/set", topic)),
            Some((address.clone(), port.to_string()))
        );
    }
}

// ============================================================================
// Integration Tests: Response Sequencing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_identification_queries_are_paced() {
    let harness = spawn_bridge(&quiet_settings());

    harness.radio.push(packets::node_id(NODE, "garden"));
    let bus = harness.bus.clone();
    wait_until(|| bus.published().len() == 2).await;
    assert_eq!(harness.bus.values(&topic("alias")), vec!["garden".to_string()]);

    // One query per interval
    let radio = harness.radio.clone();
    wait_until(|| radio.sent().len() == 13).await;
    let commands: Vec<String> = harness
        .radio
        .sent_commands()
        .into_iter()
        .map(|(command, _)| command)
        .collect();
    assert_eq!(
        commands,
        vec!["D0", "D1", "D2", "D3", "D4", "D5", "D6", "D7", "D8", "D9", "P0", "P1", "P2"]
    );

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_queries_never_burst() {
    let harness = spawn_bridge(&quiet_settings());

    harness.radio.push(packets::node_id(NODE, "garden"));
    let radio = harness.radio.clone();
    wait_until(|| !radio.sent().is_empty()).await;

    // Well below 13 intervals
    tokio::time::sleep(Duration::from_millis(450)).await;
    let sent = harness.radio.sent().len();
    assert!(sent < 13, "sent {} queries in 450ms", sent);

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_discovery_sets_sample_rate() {
    let settings = BridgeConfigBuilder::new().sample_rate(5).build().general;
    let harness = spawn_bridge(&settings);

    harness.radio.push(packets::discovery(0, NODE, "garden"));
    let radio = harness.radio.clone();
    // ND, 13 pin reads, IR
    wait_until(|| radio.sent().len() == 15).await;

    assert_eq!(
        harness.radio.sent_commands().last(),
        Some(&("IR".to_string(), Some(vec![0x13, 0x88])))
    );
    assert_eq!(harness.bus.values(&topic("alias")), vec!["garden".to_string()]);

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_discovery_is_ignored() {
    let settings = BridgeConfigBuilder::new().sample_rate(5).build().general;
    let harness = spawn_bridge(&settings);

    harness.radio.push(packets::discovery(4, NODE, "garden"));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(harness.radio.sent_commands(), vec![("ND".to_string(), None)]);
    assert!(harness.bus.published().is_empty());

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pin_report_published() {
    let harness = spawn_bridge(&quiet_settings());

    harness
        .radio
        .push(packets::remote_response(NODE, "P1", 0, "04"));
    let bus = harness.bus.clone();
    wait_until(|| !bus.published().is_empty()).await;

    assert_eq!(harness.bus.values(&topic("pin-11")), vec!["4".to_string()]);
    let mut subscriptions = harness.bus.subscriptions();
    subscriptions.sort();
    assert_eq!(
        subscriptions,
        vec![
            format!("{}/set", topic("dio-11")),
            format!("{}/set", topic("pin-11")),
        ]
    );

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_change_detection_mask_pushed() {
    let settings = BridgeConfigBuilder::new()
        .discovery_on_connect(false)
        .change_detection(true)
        .build()
        .general;
    let harness = spawn_bridge(&settings);

    harness
        .handle
        .bus_message(format!("{}/set", topic("dio-3")), "1")
        .await
        .unwrap();
    let radio = harness.radio.clone();
    wait_until(|| radio.sent().len() == 3).await;

    // The node still reports an empty mask
    harness
        .radio
        .push(packets::remote_response(NODE, "IC", 0, "0000"));
    wait_until(|| radio.sent().len() == 5).await;

    assert_eq!(
        harness.radio.sent_commands()[3..],
        [
            ("IC".to_string(), Some(vec![0x00, 0x08])),
            ("WR".to_string(), None),
        ]
    );

    // Once the node agrees nothing more is sent
    harness
        .radio
        .push(packets::remote_response(NODE, "IC", 0, "0008"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.radio.sent().len(), 5);

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_query_expires() {
    let settings = BridgeConfigBuilder::new()
        .discovery_on_connect(false)
        .change_detection(true)
        .build()
        .general;
    let harness = spawn_bridge(&settings);

    harness.radio.push(packets::node_id(NODE, "garden"));
    let radio = harness.radio.clone();
    // 13 pin reads plus IC
    wait_until(|| radio.sent().len() == 14).await;

    tokio::time::sleep(Duration::from_secs(45)).await;
    let stats = harness.handle.stats().await.unwrap();
    assert_eq!(stats.expired_responses, 1);

    harness.stop().await.unwrap();
}
