//! Admitted realtime subscribers.
//!
//! A subscriber only enters the registry after its bearer token verified and
//! its `connected` acknowledgement was handed to its sink. Removal is
//! idempotent: the connection task and the fan-out may both try to remove
//! the same entry.

use crate::auth::{AuthError, AuthorizationGate, Claims};
use crate::metrics::SUBSCRIBERS;
use crate::model::Envelope;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

pub type SubscriberId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("subscriber send buffer full")]
    Full,
    #[error("subscriber transport closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
    #[error("acknowledgement failed: {0}")]
    Ack(#[from] SendError),
}

/// Outbound half of a subscriber's transport. Sends never block: a frame is
/// either accepted right away or the send fails.
pub trait SubscriberSink: Send + Sync {
    fn try_send(&self, frame: Arc<str>) -> Result<(), SendError>;
}

/// Sink backed by a bounded channel, drained by the connection's writer task.
pub struct ChannelSink {
    tx: mpsc::Sender<Arc<str>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Arc<str>>) -> Self {
        Self { tx }
    }
}

impl SubscriberSink for ChannelSink {
    fn try_send(&self, frame: Arc<str>) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

pub struct Subscriber {
    id: SubscriberId,
    claims: Claims,
    sink: Arc<dyn SubscriberSink>,
    open: AtomicBool,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn send(&self, frame: Arc<str>) -> Result<(), SendError> {
        self.sink.try_send(frame)
    }
}

pub struct ConnectionRegistry {
    gate: Arc<dyn AuthorizationGate>,
    subscribers: RwLock<HashMap<SubscriberId, Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(gate: Arc<dyn AuthorizationGate>) -> Self {
        Self {
            gate,
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Verifies a connection-time token without touching the registry.
    pub fn authorize(&self, token: Option<&str>) -> Result<Claims, AdmitError> {
        let token = token.ok_or(AuthError::MissingToken)?;
        Ok(self.gate.verify(token)?)
    }

    /// Verifies `token`, then registers `sink` as a subscriber.
    pub async fn admit(
        &self,
        token: Option<&str>,
        sink: Arc<dyn SubscriberSink>,
    ) -> Result<SubscriberId, AdmitError> {
        let claims = self.authorize(token).map_err(|e| {
            warn!("Rejected subscriber: {}", e);
            e
        })?;
        self.admit_verified(claims, sink).await
    }

    /// Registers an already verified connection. The acknowledgement is
    /// queued before insertion so it is always the first frame the
    /// subscriber sees.
    pub async fn admit_verified(
        &self,
        claims: Claims,
        sink: Arc<dyn SubscriberSink>,
    ) -> Result<SubscriberId, AdmitError> {
        let ack: Arc<str> = match serde_json::to_string(&Envelope::connected()) {
            Ok(s) => s.into(),
            Err(_) => return Err(AdmitError::Ack(SendError::Closed)),
        };
        sink.try_send(ack)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let subscriber = Arc::new(Subscriber {
            id,
            claims,
            sink,
            open: AtomicBool::new(true),
        });

        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(id, subscriber.clone());
        SUBSCRIBERS.set(subscribers.len() as f64);
        drop(subscribers);

        info!(
            "Subscriber {} admitted for user '{}'",
            id,
            subscriber.claims().username
        );
        Ok(id)
    }

    /// Removes a subscriber. Returns false if it was already gone.
    pub async fn remove(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write().await;
        match subscribers.remove(&id) {
            Some(subscriber) => {
                subscriber.mark_closed();
                SUBSCRIBERS.set(subscribers.len() as f64);
                debug!("Subscriber {} removed", id);
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Current members, taken under the read lock and released before the
    /// caller does any I/O with them.
    pub async fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        self.subscribers.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::auth::AuthResult;
    use std::sync::Mutex;

    /// Accepts exactly one token string.
    pub struct StaticGate(pub &'static str);

    impl AuthorizationGate for StaticGate {
        fn verify(&self, token: &str) -> AuthResult<Claims> {
            if token == self.0 {
                Ok(Claims {
                    user_id: Some(1),
                    username: "tester".to_string(),
                    exp: i64::MAX,
                    iat: 0,
                })
            } else {
                Err(AuthError::MissingToken)
            }
        }
    }

    #[derive(Default)]
    pub struct RecordingSink {
        pub frames: Mutex<Vec<String>>,
        pub fail: AtomicBool,
    }

    impl RecordingSink {
        pub fn failing() -> Self {
            let sink = Self::default();
            sink.fail.store(true, Ordering::SeqCst);
            sink
        }

        pub fn frames(&self) -> Vec<String> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl SubscriberSink for RecordingSink {
        fn try_send(&self, frame: Arc<str>) -> Result<(), SendError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SendError::Closed);
            }
            self.frames.lock().unwrap().push(frame.to_string());
            Ok(())
        }
    }
}
