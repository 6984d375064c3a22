use crate::errors::{Error, Result};
use crate::fanout::BroadcastFanout;
use crate::metrics::{CHANNEL_FULL_TOTAL, INVALID_MESSAGES_TOTAL, MESSAGES_TOTAL, VALID_MESSAGES_TOTAL};
use crate::model::TelemetrySample;
use crate::topics::device_id_from_telemetry_topic;
use crate::validate::parse_sample;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Turns raw broker publishes into fan-out events and persistence jobs.
///
/// Messages are handled one at a time in broker order, so samples from one
/// device reach subscribers in the order the broker delivered them.
/// Persistence runs behind a channel and overlaps with later messages.
#[derive(Clone)]
pub struct TelemetryIngestor {
    namespace: String,
    fanout: BroadcastFanout,
    persist_tx: mpsc::Sender<TelemetrySample>,
}

impl TelemetryIngestor {
    pub fn new(
        namespace: impl Into<String>,
        fanout: BroadcastFanout,
        persist_tx: mpsc::Sender<TelemetrySample>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            fanout,
            persist_tx,
        }
    }

    /// Handles one publish. Malformed payloads are dropped with an error
    /// result; nothing is broadcast or stored for them.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> Result<TelemetrySample> {
        MESSAGES_TOTAL.inc();
        debug!(
            "Received message on topic {}, size: {} bytes",
            topic,
            payload.len()
        );

        let sample = match parse_sample(payload) {
            Ok(sample) => sample,
            Err(e) => {
                INVALID_MESSAGES_TOTAL.inc();
                warn!("Dropping malformed telemetry on {}: {}", topic, e);
                return Err(e);
            }
        };

        if let Some(topic_device) = device_id_from_telemetry_topic(&self.namespace, topic) {
            if topic_device != sample.device_id {
                warn!(
                    "Topic device {} does not match payload device {}",
                    topic_device, sample.device_id
                );
            }
        }

        VALID_MESSAGES_TOTAL.inc();

        self.fanout.publish_sample(&sample).await;

        if let Err(e) = self.enqueue_for_persistence(sample.clone()) {
            warn!("Sample for {} not persisted: {}", sample.device_id, e);
        }

        Ok(sample)
    }

    /// Never waits: a full channel means storage is behind, and the sample is
    /// dropped rather than stalling the broker loop.
    fn enqueue_for_persistence(&self, sample: TelemetrySample) -> Result<()> {
        match self.persist_tx.try_send(sample) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                CHANNEL_FULL_TOTAL.inc();
                Err(Error::ChannelFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ChannelClosed),
        }
    }
}
