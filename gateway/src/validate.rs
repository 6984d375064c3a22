use crate::errors::{Error, Result};
use crate::model::TelemetrySample;

/// Parses and validates a raw telemetry payload.
pub fn parse_sample(payload: &[u8]) -> Result<TelemetrySample> {
    let sample = serde_json::from_slice::<TelemetrySample>(payload)?;

    validate(&sample)?;

    Ok(sample)
}

/// Structural checks only. Sensor values are passed through unchanged,
/// whatever their range.
pub fn validate(sample: &TelemetrySample) -> Result<()> {
    if sample.device_id.trim().is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    let fields = [
        ("temperature", sample.temperature),
        ("humidity", sample.humidity),
        ("weight", sample.weight),
        ("battery", sample.battery),
    ];
    for (name, value) in fields {
        if !value.is_finite() {
            return Err(Error::Validation(format!(
                "Field {} is not a finite number",
                name
            )));
        }
    }

    Ok(())
}
