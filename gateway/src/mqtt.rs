use crate::dispatcher::BrokerPublisher;
use crate::errors::Result;
use crate::ingest::TelemetryIngestor;
use crate::metrics::MQTT_RECONNECTS_TOTAL;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeReasonCode};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Broker link state as seen by the ingest loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
}

pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub reconnect_delay: Duration,
}

/// One client for the whole process: telemetry comes in and commands go out
/// over the same connection.
pub fn connect(settings: &MqttSettings) -> (AsyncClient, EventLoop) {
    info!(
        "Connecting to MQTT broker at {}:{}",
        settings.broker, settings.port
    );

    let mut mqtt_options = MqttOptions::new(&settings.client_id, &settings.broker, settings.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    AsyncClient::new(mqtt_options, 10000)
}

/// Drives the broker connection forever.
///
/// The subscription is (re)issued on every ConnAck, so a reconnect restores
/// it. After a transport error the loop waits `reconnect_delay` before the
/// next poll, which is what makes rumqttc reconnect.
pub async fn run_mqtt(
    client: AsyncClient,
    mut eventloop: EventLoop,
    filter: String,
    reconnect_delay: Duration,
    ingestor: TelemetryIngestor,
    state: watch::Sender<ConnectionState>,
) {
    state.send_replace(ConnectionState::Connecting);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker, subscribing to {}", filter);
                state.send_replace(ConnectionState::Connecting);
                if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                    error!("Failed to request subscription to {}: {}", filter, e);
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    error!("Broker refused subscription to {}", filter);
                } else {
                    info!("Subscribed to {} with QoS 1", filter);
                    state.send_replace(ConnectionState::Subscribed);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                // errors are logged and counted inside; nothing to do here
                let _ = ingestor
                    .handle_message(&publish.topic, &publish.payload)
                    .await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker sent disconnect");
                state.send_replace(ConnectionState::Disconnected);
            }
            Ok(other) => {
                debug!("MQTT event: {:?}", other);
            }
            Err(e) => {
                state.send_replace(ConnectionState::Disconnected);
                MQTT_RECONNECTS_TOTAL.inc();
                error!(
                    "MQTT error: {}. Reconnecting in {}ms",
                    e,
                    reconnect_delay.as_millis()
                );
                tokio::time::sleep(reconnect_delay).await;
                state.send_replace(ConnectionState::Connecting);
            }
        }
    }
}

/// Queues a DISCONNECT so the broker sees a clean session end instead of a
/// dropped socket, then gives the poll loop `flush` to write it out.
pub async fn shutdown(client: &AsyncClient, flush: Duration) {
    match client.try_disconnect() {
        Ok(()) => {
            info!("Disconnecting from MQTT broker");
            tokio::time::sleep(flush).await;
        }
        Err(e) => warn!("Failed to request MQTT disconnect: {}", e),
    }
}

#[async_trait]
impl BrokerPublisher for AsyncClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        // try_publish never waits on a stalled event loop
        self.try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::BroadcastFanout;
    use crate::registry::testing::StaticGate;
    use crate::registry::ConnectionRegistry;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(ConnectionState::Subscribed).unwrap(),
            serde_json::json!("subscribed")
        );
    }

    #[tokio::test]
    async fn test_publisher_reports_full_request_queue() {
        let options = MqttOptions::new("gateway-test", "localhost", 1883);
        // capacity 1 and nobody polling: the second request cannot be queued
        let (client, _eventloop) = AsyncClient::new(options, 1);

        assert!(BrokerPublisher::publish(&client, "iot/devices/a/commands", b"{}".to_vec())
            .await
            .is_ok());
        assert!(BrokerPublisher::publish(&client, "iot/devices/a/commands", b"{}".to_vec())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_shutdown_queues_disconnect() {
        let options = MqttOptions::new("gateway-test-shutdown", "localhost", 1883);
        let (client, _eventloop) = AsyncClient::new(options, 1);

        shutdown(&client, Duration::ZERO).await;

        // the DISCONNECT occupies the only request slot
        assert!(client
            .try_publish("iot/devices/a/commands", QoS::AtLeastOnce, false, b"{}".to_vec())
            .is_err());
    }

    #[tokio::test]
    async fn test_unreachable_broker_retries_at_fixed_delay() {
        let settings = MqttSettings {
            broker: "127.0.0.1".to_string(),
            port: 1,
            client_id: "gateway-test-reconnect".to_string(),
            reconnect_delay: Duration::from_millis(200),
        };
        let (client, eventloop) = connect(&settings);

        let registry = Arc::new(ConnectionRegistry::new(Arc::new(StaticGate("t"))));
        let (persist_tx, _persist_rx) = mpsc::channel(1);
        let ingestor = TelemetryIngestor::new("iot", BroadcastFanout::new(registry), persist_tx);

        let (state_tx, mut state_rx) = watch::channel(ConnectionState::Subscribed);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let collector = {
            let seen = seen.clone();
            tokio::spawn(async move {
                while state_rx.changed().await.is_ok() {
                    let state = *state_rx.borrow_and_update();
                    seen.lock().unwrap().push(state);
                }
            })
        };

        let before = MQTT_RECONNECTS_TOTAL.get();
        let task = tokio::spawn(run_mqtt(
            client,
            eventloop,
            "iot/devices/+/telemetry".to_string(),
            settings.reconnect_delay,
            ingestor,
            state_tx,
        ));
        tokio::time::sleep(Duration::from_millis(1000)).await;
        task.abort();
        let _ = task.await;
        collector.await.unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&ConnectionState::Disconnected));
        assert!(seen.contains(&ConnectionState::Connecting));
        assert!(!seen.contains(&ConnectionState::Subscribed));

        // one attempt per 200ms, not a tight loop
        let attempts = (MQTT_RECONNECTS_TOTAL.get() - before) as u64;
        assert!(
            (1..=7).contains(&attempts),
            "unexpected reconnect attempts: {}",
            attempts
        );
    }
}
