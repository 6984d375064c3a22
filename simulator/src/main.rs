mod telemetry;

use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use telemetry::{DeviceCommand, Telemetry};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "simulator", about = "Simulates ESP32 devices publishing telemetry")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "MQTT_NAMESPACE", default_value = "iot")]
    namespace: String,

    /// Number of simulated devices
    #[arg(long, env = "DEVICES", default_value_t = 3)]
    devices: usize,

    /// Publish interval per device, in milliseconds
    #[arg(long, env = "INTERVAL_MS", default_value_t = 5000)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!(
        "Starting device simulator: {} devices every {}ms via {}:{}",
        args.devices, args.interval_ms, args.broker, args.port
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    let device_ids: Vec<String> = (1..=args.devices)
        .map(|i| format!("esp32_{:03}", i))
        .collect();
    let command_filter = format!("{}/devices/+/commands", args.namespace);

    // Spawn eventloop handler; it also prints commands sent to our devices
    let sub_client = client.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    if let Err(e) = sub_client.try_subscribe(command_filter.as_str(), QoS::AtLeastOnce) {
                        error!("Failed to subscribe to {}: {}", command_filter, e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handle_command(&publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT eventloop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(10)));
    let mut counter = 0u64;
    let mut ticks = 0u64;

    loop {
        ticker.tick().await;
        ticks += 1;

        for device_id in &device_ids {
            let reading = Telemetry::generate(&mut rand::thread_rng(), device_id.clone());
            let topic = format!("{}/devices/{}/telemetry", args.namespace, device_id);
            let payload = match serde_json::to_string(&reading) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialize telemetry: {}", e);
                    continue;
                }
            };

            match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                Ok(_) => counter += 1,
                Err(e) => warn!("Failed to publish for {}: {}", device_id, e),
            }
        }

        if ticks % 20 == 0 {
            info!("Published {} messages", counter);
        }
    }
}

fn handle_command(topic: &str, payload: &[u8]) {
    let device = topic.split('/').nth(2).unwrap_or("?");
    match serde_json::from_slice::<DeviceCommand>(payload) {
        Ok(cmd) => match cmd.command.as_str() {
            "toggle_led" => info!("Device {} toggled its LED", device),
            "reset" => info!("Device {} restarting", device),
            other => info!(
                "Device {} received command '{}' with parameters {:?}",
                device, other, cmd.parameters
            ),
        },
        Err(e) => warn!("Device {} got unreadable command: {}", device, e),
    }
}
