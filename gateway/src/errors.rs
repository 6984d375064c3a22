use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence channel full, sample dropped")]
    ChannelFull,

    #[error("Broker not connected (state: {0:?})")]
    BrokerUnavailable(crate::mqtt::ConnectionState),

    #[error("Persistence channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
