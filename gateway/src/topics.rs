//! Broker topic layout: `<ns>/devices/<device_id>/{telemetry,commands}`.

pub const TELEMETRY_SUFFIX: &str = "telemetry";
pub const COMMANDS_SUFFIX: &str = "commands";

/// Wildcard filter matching every device's telemetry topic.
pub fn telemetry_filter(namespace: &str) -> String {
    format!("{}/devices/+/{}", namespace, TELEMETRY_SUFFIX)
}

pub fn telemetry_topic(namespace: &str, device_id: &str) -> String {
    format!("{}/devices/{}/{}", namespace, device_id, TELEMETRY_SUFFIX)
}

pub fn command_topic(namespace: &str, device_id: &str) -> String {
    format!("{}/devices/{}/{}", namespace, device_id, COMMANDS_SUFFIX)
}

/// Extracts the device segment from a telemetry topic, if the topic has the
/// expected shape under `namespace`.
pub fn device_id_from_telemetry_topic<'a>(namespace: &str, topic: &'a str) -> Option<&'a str> {
    let rest = topic.strip_prefix(namespace)?.strip_prefix("/devices/")?;
    let device_id = rest.strip_suffix(TELEMETRY_SUFFIX)?.strip_suffix('/')?;
    if device_id.is_empty() || device_id.contains('/') {
        return None;
    }
    Some(device_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_layout() {
        assert_eq!(telemetry_filter("iot"), "iot/devices/+/telemetry");
        assert_eq!(telemetry_topic("iot", "esp32_001"), "iot/devices/esp32_001/telemetry");
        assert_eq!(command_topic("iot", "esp32_001"), "iot/devices/esp32_001/commands");
    }

    #[test]
    fn test_device_id_from_topic() {
        assert_eq!(
            device_id_from_telemetry_topic("iot", "iot/devices/esp32_001/telemetry"),
            Some("esp32_001")
        );
        assert_eq!(device_id_from_telemetry_topic("iot", "iot/devices//telemetry"), None);
        assert_eq!(device_id_from_telemetry_topic("iot", "iot/devices/a/b/telemetry"), None);
        assert_eq!(device_id_from_telemetry_topic("iot", "other/devices/a/telemetry"), None);
        assert_eq!(device_id_from_telemetry_topic("iot", "iot/devices/a/commands"), None);
    }
}
