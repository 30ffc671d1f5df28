//! MQTT side of the daemon
//!
//! [`MqttBus`] publishes and subscribes through a `rumqttc` client; the
//! event loop runs in its own task and forwards incoming publishes to the
//! bridge.

use anyhow::{bail, Context};
use rumqttc::{AsyncClient, ConnAck, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use xbee_bridge::{BridgeError, BridgeHandle, BusClient, MqttConfig};

/// Pending requests between the client and its event loop
const REQUEST_QUEUE_SIZE: usize = 256;

/// Pause before polling again after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long to wait for the broker to accept the connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn qos(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

pub fn options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(config.keepalive.max(Duration::from_secs(1)));
    options.set_clean_session(config.clean_session);
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }
    options
}

/// Bus client backed by an MQTT broker
pub struct MqttBus {
    client: AsyncClient,
    qos: QoS,
    retain: bool,
}

impl MqttBus {
    /// Connect to the broker and wait until it accepts the session
    pub async fn connect(config: &MqttConfig) -> anyhow::Result<(Self, EventLoop)> {
        info!(host = %config.host, port = config.port, "Connecting to MQTT broker");
        let (client, mut eventloop) = AsyncClient::new(options(config), REQUEST_QUEUE_SIZE);

        let accepted = tokio::time::timeout(CONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => break Ok(ack),
                    Ok(event) => trace!(?event, "MQTT event"),
                    Err(e) => break Err(e),
                }
            }
        })
        .await;

        match accepted {
            Ok(Ok(ack)) => debug!(?ack, "MQTT session accepted"),
            Ok(Err(e)) => {
                return Err(e).context(format!("{}:{}", config.host, config.port));
            }
            Err(_) => bail!("timed out connecting to {}:{}", config.host, config.port),
        }

        info!("Connected to MQTT broker");
        let bus = Self {
            client,
            qos: qos(config.qos),
            retain: config.retain,
        };
        Ok((bus, eventloop))
    }

    /// Disconnect from the broker
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("Error disconnecting from MQTT broker: {}", e);
        }
    }
}

impl BusClient for MqttBus {
    fn publish(&self, topic: &str, value: &str) -> xbee_bridge::Result<()> {
        self.client
            .try_publish(topic, self.qos, self.retain, value.as_bytes().to_vec())
            .map_err(|e| BridgeError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn subscribe(&self, topics: &[String]) -> xbee_bridge::Result<()> {
        for topic in topics {
            self.client
                .try_subscribe(topic.as_str(), self.qos)
                .map_err(|e| BridgeError::SubscribeFailed(format!("{}: {}", topic, e)))?;
            info!(topic = topic.as_str(), "Subscribed");
        }
        Ok(())
    }
}

/// Whether a reconnection came back without the broker-side subscriptions
pub fn session_lost(ack: &ConnAck) -> bool {
    !ack.session_present
}

/// Drive the MQTT event loop, handing publishes to the bridge
///
/// The first ConnAck is consumed by [`MqttBus::connect`], so any ConnAck
/// seen here follows a reconnection. Returns once the bridge stops
/// accepting messages.
pub async fn forward_messages(mut eventloop: EventLoop, handle: BridgeHandle) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(session_present = ack.session_present, "Reconnected to MQTT broker");
                if session_lost(&ack) && handle.resubscribe().await.is_err() {
                    debug!("Bridge stopped, leaving MQTT loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                debug!(topic = %publish.topic, payload = %payload, "Message received from MQTT broker");
                if handle.bus_message(publish.topic, payload).await.is_err() {
                    debug!("Bridge stopped, leaving MQTT loop");
                    break;
                }
            }
            Ok(event) => trace!(?event, "MQTT event"),
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
