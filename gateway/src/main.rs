use anyhow::Context;
use gateway::auth::JwtGate;
use gateway::config::Config;
use gateway::db::{self, PgStore};
use gateway::dispatcher::CommandDispatcher;
use gateway::fanout::BroadcastFanout;
use gateway::http::{self, AppState};
use gateway::ingest::TelemetryIngestor;
use gateway::metrics;
use gateway::mqtt::{self, ConnectionState, MqttSettings};
use gateway::persist;
use gateway::registry::ConnectionRegistry;
use gateway::topics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    info!("Starting IoT telemetry gateway");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);
    info!(
        "Database: {}",
        config.database_url.split('@').last().unwrap_or("***")
    );

    metrics::init_metrics();

    let pool = db::make_pool(&config.database_url)
        .await
        .context("failed to connect to database")?;
    let store = Arc::new(PgStore::new(pool));

    let gate = Arc::new(JwtGate::new(config.jwt_secret.as_bytes()));
    let registry = Arc::new(ConnectionRegistry::new(gate));
    let fanout = BroadcastFanout::new(registry.clone());

    info!("Persistence channel capacity: {}", config.channel_capacity);
    let (persist_tx, persist_rx) = mpsc::channel(config.channel_capacity);
    let persist_handle = tokio::spawn(persist::run_persister(persist_rx, store));

    let settings = MqttSettings {
        broker: config.mqtt_broker.clone(),
        port: config.mqtt_port,
        client_id: format!("gateway-{}", uuid::Uuid::new_v4()),
        reconnect_delay: config.reconnect_delay,
    };
    let (client, eventloop) = mqtt::connect(&settings);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

    let ingestor = TelemetryIngestor::new(config.mqtt_namespace.clone(), fanout, persist_tx);
    let mqtt_handle = tokio::spawn(mqtt::run_mqtt(
        client.clone(),
        eventloop,
        topics::telemetry_filter(&config.mqtt_namespace),
        settings.reconnect_delay,
        ingestor,
        state_tx,
    ));

    let app = http::create_router(AppState {
        registry,
        dispatcher: CommandDispatcher::new(
            Arc::new(client.clone()),
            config.mqtt_namespace.clone(),
            state_rx.clone(),
        ),
        broker_state: state_rx,
        ws_send_buffer: config.ws_send_buffer,
    });

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;
    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = persist_handle => {
            error!("Persistence worker terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    mqtt::shutdown(&client, Duration::from_millis(500)).await;
    Ok(())
}
