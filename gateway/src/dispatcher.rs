use crate::errors::Error;
use crate::metrics::{COMMANDS_FAILED_TOTAL, COMMANDS_PUBLISHED_TOTAL};
use crate::model::Command;
use crate::mqtt::ConnectionState;
use crate::topics::command_topic;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Outbound side of the shared broker connection.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> crate::errors::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid device id '{0}'")]
    InvalidDeviceId(String),
    #[error("command name cannot be empty")]
    EmptyCommand,
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("broker publish failed: {0}")]
    Broker(#[source] Error),
}

impl DispatchError {
    /// Whether the caller's input was at fault, as opposed to the broker.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            DispatchError::InvalidDeviceId(_) | DispatchError::EmptyCommand
        )
    }
}

/// Publishes operator commands to `<ns>/devices/<id>/commands`.
/// Fire-and-forget: nothing waits for the device, and a failed publish is
/// reported to the caller without retry. Commands are refused outright while
/// the broker link is not `Subscribed`, instead of piling up in the client's
/// request queue.
#[derive(Clone)]
pub struct CommandDispatcher {
    publisher: Arc<dyn BrokerPublisher>,
    namespace: String,
    broker_state: watch::Receiver<ConnectionState>,
}

impl CommandDispatcher {
    pub fn new(
        publisher: Arc<dyn BrokerPublisher>,
        namespace: impl Into<String>,
        broker_state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            publisher,
            namespace: namespace.into(),
            broker_state,
        }
    }

    /// Send a command to a specific device. Returns the topic it went to.
    pub async fn publish_command(
        &self,
        device_id: &str,
        command: &Command,
    ) -> Result<String, DispatchError> {
        let result = self.try_publish(device_id, command).await;
        match &result {
            Ok(topic) => {
                COMMANDS_PUBLISHED_TOTAL.inc();
                info!("Command '{}' sent to {} via {}", command.name, device_id, topic);
            }
            Err(e) => {
                COMMANDS_FAILED_TOTAL.inc();
                warn!("Command '{}' for '{}' not sent: {}", command.name, device_id, e);
            }
        }
        result
    }

    async fn try_publish(&self, device_id: &str, command: &Command) -> Result<String, DispatchError> {
        if !is_valid_device_id(device_id) {
            return Err(DispatchError::InvalidDeviceId(device_id.to_string()));
        }
        if command.name.trim().is_empty() {
            return Err(DispatchError::EmptyCommand);
        }

        let state = *self.broker_state.borrow();
        if state != ConnectionState::Subscribed {
            return Err(DispatchError::Broker(Error::BrokerUnavailable(state)));
        }

        let payload = serde_json::to_vec(command)?;
        let topic = command_topic(&self.namespace, device_id);
        self.publisher
            .publish(&topic, payload)
            .await
            .map_err(DispatchError::Broker)?;
        Ok(topic)
    }
}

/// Device ids become a topic level, so they may not be empty or carry
/// separators or wildcards.
fn is_valid_device_id(device_id: &str) -> bool {
    !device_id.trim().is_empty() && !device_id.contains(['/', '+', '#'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(String, Vec<u8>)>>,
        fail: bool,
    }

    #[async_trait]
    impl BrokerPublisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> crate::errors::Result<()> {
            if self.fail {
                return Err(Error::Mqtt(rumqttc::ClientError::TryRequest(
                    rumqttc::Request::Disconnect(rumqttc::Disconnect),
                )));
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            Ok(())
        }
    }

    fn dispatcher(publisher: Arc<RecordingPublisher>) -> CommandDispatcher {
        let (_tx, rx) = watch::channel(ConnectionState::Subscribed);
        CommandDispatcher::new(publisher, "iot", rx)
    }

    #[tokio::test]
    async fn test_publish_command_to_device_topic() {
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = dispatcher(publisher.clone());

        let command = Command::new("toggle_led").with_parameter("state", json!("on"));
        let topic = dispatcher.publish_command("esp32_001", &command).await.unwrap();

        assert_eq!(topic, "iot/devices/esp32_001/commands");
        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let body: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(body, json!({"command": "toggle_led", "parameters": {"state": "on"}}));
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected_without_publish() {
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = dispatcher(publisher.clone());

        let err = dispatcher
            .publish_command("esp32_001", &Command::new(""))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::EmptyCommand));
        assert!(err.is_rejection());
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_device_id_is_rejected_without_publish() {
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = dispatcher(publisher.clone());

        for device_id in ["", "  ", "a/b", "+", "#"] {
            let err = dispatcher
                .publish_command(device_id, &Command::new("reset"))
                .await
                .unwrap_err();
            assert!(matches!(err, DispatchError::InvalidDeviceId(_)));
        }
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broker_failure_is_reported() {
        let publisher = Arc::new(RecordingPublisher {
            fail: true,
            ..Default::default()
        });
        let dispatcher = dispatcher(publisher);

        let err = dispatcher
            .publish_command("esp32_001", &Command::new("reset"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Broker(_)));
        assert!(!err.is_rejection());
    }

    #[tokio::test]
    async fn test_command_refused_until_subscribed() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        let dispatcher = CommandDispatcher::new(publisher.clone(), "iot", rx);

        for state in [ConnectionState::Disconnected, ConnectionState::Connecting] {
            tx.send_replace(state);
            let err = dispatcher
                .publish_command("esp32_001", &Command::new("reset"))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                DispatchError::Broker(Error::BrokerUnavailable(s)) if s == state
            ));
            assert!(!err.is_rejection());
        }
        assert!(publisher.published.lock().unwrap().is_empty());

        tx.send_replace(ConnectionState::Subscribed);
        dispatcher
            .publish_command("esp32_001", &Command::new("reset"))
            .await
            .unwrap();
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
    }
}
