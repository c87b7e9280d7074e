use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Good,
    Bad,
}

/// One register observation. A `value` of `None` always carries `Bad`
/// quality. All samples of one poll iteration share a single timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(rename = "deviceId", alias = "device_id")]
    pub device_id: String,
    #[serde(rename = "registerId", alias = "register_id")]
    pub register_id: String,
    pub value: Option<u16>,
    pub timestamp: String,
    pub quality: Quality,
}

impl Sample {
    pub fn good(device_id: &str, register_id: &str, value: u16, timestamp: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            register_id: register_id.to_string(),
            value: Some(value),
            timestamp: timestamp.to_string(),
            quality: Quality::Good,
        }
    }

    pub fn bad(device_id: &str, register_id: &str, timestamp: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            register_id: register_id.to_string(),
            value: None,
            timestamp: timestamp.to_string(),
            quality: Quality::Bad,
        }
    }

    /// ISO-8601 UTC with millisecond precision, generated once per poll
    /// iteration and shared by every register read in it.
    pub fn iteration_timestamp() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_sample_has_null_value() {
        let sample = Sample::bad("dev-1", "r1", "2026-01-01T00:00:00.000Z");
        assert_eq!(sample.value, None);
        assert_eq!(sample.quality, Quality::Bad);

        let json = serde_json::to_value(&sample).unwrap();
        assert!(json["value"].is_null());
        assert_eq!(json["quality"], "bad");
        assert_eq!(json["deviceId"], "dev-1");
    }

    #[test]
    fn test_iteration_timestamp_is_iso8601_millis_utc() {
        let ts = Sample::iteration_timestamp();
        assert!(ts.ends_with('Z'), "timestamp not UTC: {}", ts);
        // e.g. 2026-08-02T10:11:12.345Z
        assert_eq!(ts.len(), 24, "unexpected precision: {}", ts);
        chrono::DateTime::parse_from_rfc3339(&ts).unwrap();
    }

    #[test]
    fn test_sample_round_trips_snake_case_aliases() {
        let json = serde_json::json!({
            "device_id": "dev-2",
            "register_id": "r9",
            "value": 42,
            "timestamp": "2026-01-01T00:00:00.000Z",
            "quality": "good"
        });
        let sample: Sample = serde_json::from_value(json).unwrap();
        assert_eq!(sample.value, Some(42));
    }
}
