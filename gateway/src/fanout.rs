use crate::metrics::BROADCAST_FAILURES_TOTAL;
use crate::model::{Envelope, TelemetrySample, EVENT_DEVICE_DATA};
use crate::registry::ConnectionRegistry;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Best-effort delivery of realtime events to every admitted subscriber.
/// No queueing, no replay: a subscriber whose send fails is dropped.
#[derive(Clone)]
pub struct BroadcastFanout {
    registry: Arc<ConnectionRegistry>,
}

impl BroadcastFanout {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub async fn publish_sample(&self, sample: &TelemetrySample) -> FanoutReport {
        self.publish(EVENT_DEVICE_DATA, sample).await
    }

    /// Wraps `data` in a `{type, data}` envelope and broadcasts it.
    pub async fn publish<T: Serialize>(&self, kind: &str, data: &T) -> FanoutReport {
        let data = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to encode {} event: {}", kind, e);
                return FanoutReport::default();
            }
        };
        self.publish_envelope(&Envelope::with_data(kind, data)).await
    }

    pub async fn publish_envelope(&self, envelope: &Envelope) -> FanoutReport {
        let frame: Arc<str> = match serde_json::to_string(envelope) {
            Ok(s) => s.into(),
            Err(e) => {
                error!("Failed to serialize {} envelope: {}", envelope.kind, e);
                return FanoutReport::default();
            }
        };

        let mut report = FanoutReport::default();
        for subscriber in self.registry.snapshot().await {
            if !subscriber.is_open() {
                continue;
            }
            match subscriber.send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        "Dropping subscriber {} after failed send: {}",
                        subscriber.id(),
                        e
                    );
                    BROADCAST_FAILURES_TOTAL.inc();
                    report.failed += 1;
                    self.registry.remove(subscriber.id()).await;
                }
            }
        }

        debug!(
            "Broadcast {} to {} subscribers ({} failed)",
            envelope.kind, report.delivered, report.failed
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::{RecordingSink, StaticGate};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn fanout() -> BroadcastFanout {
        BroadcastFanout::new(Arc::new(ConnectionRegistry::new(Arc::new(StaticGate("t")))))
    }

    #[tokio::test]
    async fn test_failed_subscriber_is_isolated_and_removed() {
        let fanout = fanout();
        let registry = fanout.registry().clone();

        let sinks: Vec<Arc<RecordingSink>> =
            (0..5).map(|_| Arc::new(RecordingSink::default())).collect();
        let mut ids = Vec::new();
        for sink in &sinks {
            ids.push(registry.admit(Some("t"), sink.clone()).await.unwrap());
        }
        // subscriber 2 breaks after its ack
        sinks[2].fail.store(true, Ordering::SeqCst);

        let report = fanout.publish("device_data", &json!({"device_id": "d1"})).await;

        assert_eq!(report, FanoutReport { delivered: 4, failed: 1 });
        assert!(!registry.contains(ids[2]).await);
        assert_eq!(registry.len().await, 4);
        for (i, sink) in sinks.iter().enumerate() {
            let expected = if i == 2 { 1 } else { 2 };
            assert_eq!(sink.frames().len(), expected, "subscriber {}", i);
        }
    }

    #[tokio::test]
    async fn test_publish_with_no_subscribers() {
        let report = fanout().publish("device_data", &json!({})).await;
        assert_eq!(report, FanoutReport::default());
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_skipped() {
        let fanout = fanout();
        let sink = Arc::new(RecordingSink::default());
        fanout.registry().admit(Some("t"), sink.clone()).await.unwrap();
        for subscriber in fanout.registry().snapshot().await {
            subscriber.mark_closed();
        }

        let report = fanout.publish("device_data", &json!({})).await;
        assert_eq!(report.delivered, 0);
        assert_eq!(sink.frames().len(), 1);
    }

    #[tokio::test]
    async fn test_sample_envelope_shape() {
        let fanout = fanout();
        let sink = Arc::new(RecordingSink::default());
        fanout.registry().admit(Some("t"), sink.clone()).await.unwrap();

        let sample = TelemetrySample {
            device_id: "esp32_001".to_string(),
            temperature: 24.5,
            humidity: 55.2,
            weight: 1.2,
            battery: 91.0,
            timestamp: None,
        };
        fanout.publish_sample(&sample).await;

        let frames = sink.frames();
        let event: serde_json::Value = serde_json::from_str(&frames[1]).unwrap();
        assert_eq!(event["type"], "device_data");
        assert_eq!(event["data"]["device_id"], "esp32_001");
        assert_eq!(event["data"]["temperature"], 24.5);
        assert!(event.get("message").is_none());
    }
}
