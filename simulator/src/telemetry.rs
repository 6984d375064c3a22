use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telemetry {
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub weight: f64,
    pub battery: f64,
    pub timestamp: DateTime<Utc>,
}

impl Telemetry {
    /// Readings in the ranges an ESP32 sensor node reports.
    pub fn generate(rng: &mut impl Rng, device_id: String) -> Self {
        Self {
            device_id,
            temperature: round_to(rng.gen_range(20.0..35.0), 1),
            humidity: round_to(rng.gen_range(40.0..80.0), 1),
            weight: round_to(rng.gen_range(0.0..10.0), 2),
            battery: rng.gen_range(85..=100) as f64,
            timestamp: Utc::now(),
        }
    }
}

/// Inbound command as published by the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCommand {
    pub command: String,
    #[serde(default)]
    pub parameters: Option<serde_json::Map<String, serde_json::Value>>,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_values_in_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let t = Telemetry::generate(&mut rng, "sim_001".to_string());
            assert!((20.0..=35.0).contains(&t.temperature));
            assert!((40.0..=80.0).contains(&t.humidity));
            assert!((0.0..=10.0).contains(&t.weight));
            assert!((85.0..=100.0).contains(&t.battery));
        }
    }

    #[test]
    fn test_command_parsing() {
        let cmd: DeviceCommand = serde_json::from_str(r#"{"command":"toggle_led"}"#).unwrap();
        assert_eq!(cmd.command, "toggle_led");
        assert!(cmd.parameters.is_none());
    }
}
