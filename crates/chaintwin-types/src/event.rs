//! Ingestion events and their strict decoder.
//!
//! Telemetry and ERP feeds deliver JSON of the form:
//!
//! ```json
//! { "nodeId": "wh-1", "timestamp": "2026-03-01T12:00:03Z", "sensorType": "rfid",
//!   "metrics": { "currentInventory": 480, "utilizationRate": 0.48 },
//!   "source": "manual-entry", "messageId": "m-9" }
//! ```
//!
//! [`RawEvent`] mirrors that shape with every field optional so that a
//! missing field can be named precisely. [`IngestEvent`] is the validated
//! form; the only way to obtain one is through [`IngestEvent::decode`] or
//! `TryFrom<RawEvent>`, which fail closed on anything that does not match.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::NodeId;
use crate::node::NodeMetrics;

/// Reasons an ingestion event is rejected before it reaches storage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The payload is not JSON or does not match the event shape.
    #[error("malformed event: {0}")]
    Malformed(String),

    /// A required field is absent.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A required string field is present but empty.
    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),

    /// A field is present but its value is unacceptable.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Undecoded metrics block of an ingestion event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawMetrics {
    /// Units on hand. Kept as a JSON value so non-integers can be reported.
    pub current_inventory: Option<serde_json::Value>,
    /// Fraction of capacity in use.
    pub utilization_rate: Option<f64>,
}

/// Undecoded ingestion event as received from a feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawEvent {
    /// Target node.
    pub node_id: Option<String>,
    /// ISO-8601 / RFC 3339 observation time.
    pub timestamp: Option<String>,
    /// Kind of sensor or feed that produced the reading.
    pub sensor_type: Option<String>,
    /// Reported metrics.
    pub metrics: Option<RawMetrics>,
    /// Originating system.
    pub source: Option<String>,
    /// Transport-level message identifier, used for tracing only.
    pub message_id: Option<String>,
}

impl RawEvent {
    /// Best-effort node id for error reporting, even when validation fails.
    pub fn node_id_hint(&self) -> Option<&str> {
        self.node_id.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// Best-effort source for error reporting, even when validation fails.
    pub fn source_hint(&self) -> Option<&str> {
        self.source.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// A validated metrics reading from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsUpdate {
    /// Units on hand.
    pub current_inventory: u64,
    /// Fraction of capacity in use, 0.0 to 1.0.
    pub utilization_rate: f64,
    /// When the source observed the reading.
    pub timestamp: DateTime<Utc>,
    /// Originating system.
    pub source: String,
}

impl MetricsUpdate {
    /// Convert the reading into a node metrics unit, keeping its own source label.
    pub fn to_metrics(&self) -> NodeMetrics {
        NodeMetrics::new(
            self.current_inventory,
            self.utilization_rate,
            self.timestamp,
            self.source.clone(),
        )
    }
}

/// A validated ingestion event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestEvent {
    /// Target node.
    pub node_id: NodeId,
    /// The metrics reading carried by the event.
    pub update: MetricsUpdate,
    /// Kind of sensor or feed, if reported.
    pub sensor_type: Option<String>,
    /// Transport message identifier, if reported.
    pub message_id: Option<String>,
}

impl IngestEvent {
    /// Decode and validate a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Malformed`] if the bytes are not a JSON
    /// object of the expected shape (unknown fields included), or any other
    /// [`ValidationError`] variant for missing or invalid required fields.
    pub fn decode(bytes: &[u8]) -> Result<Self, ValidationError> {
        let raw: RawEvent = serde_json::from_slice(bytes)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        Self::try_from(raw)
    }
}

impl TryFrom<RawEvent> for IngestEvent {
    type Error = ValidationError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let node_id = required_string(raw.node_id, "nodeId")?;
        let node_id = NodeId::new(node_id).map_err(|_empty| ValidationError::EmptyField("nodeId"))?;

        let timestamp = required_string(raw.timestamp, "timestamp")?;
        let timestamp = DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| ValidationError::InvalidField {
                field: "timestamp",
                reason: e.to_string(),
            })?
            .with_timezone(&Utc);

        let metrics = raw.metrics.ok_or(ValidationError::MissingField("metrics"))?;
        let current_inventory = decode_inventory(metrics.current_inventory)?;
        let utilization_rate = decode_utilization(metrics.utilization_rate)?;

        let source = required_string(raw.source, "source")?;

        Ok(Self {
            node_id,
            update: MetricsUpdate {
                current_inventory,
                utilization_rate,
                timestamp,
                source,
            },
            sensor_type: raw.sensor_type,
            message_id: raw.message_id,
        })
    }
}

fn required_string(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    let value = value.ok_or(ValidationError::MissingField(field))?;
    if value.trim().is_empty() {
        return Err(ValidationError::EmptyField(field));
    }
    Ok(value)
}

/// Largest integer an `f64` holds exactly (2^53).
const MAX_EXACT_FLOAT_INT: f64 = 9_007_199_254_740_992.0;

/// Accepts JSON integers and integral floats such as `480.0`, which some
/// serializers emit for every number.
fn decode_inventory(value: Option<serde_json::Value>) -> Result<u64, ValidationError> {
    let value = value.ok_or(ValidationError::MissingField("metrics.currentInventory"))?;
    value
        .as_u64()
        .or_else(|| value.as_f64().and_then(integral_float))
        .ok_or_else(|| ValidationError::InvalidField {
            field: "metrics.currentInventory",
            reason: format!("expected a non-negative integer, got {value}"),
        })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn integral_float(n: f64) -> Option<u64> {
    // Range and fraction are checked, so the cast is exact.
    (n.fract() == 0.0 && (0.0..=MAX_EXACT_FLOAT_INT).contains(&n)).then_some(n as u64)
}

fn decode_utilization(value: Option<f64>) -> Result<f64, ValidationError> {
    let rate = value.ok_or(ValidationError::MissingField("metrics.utilizationRate"))?;
    if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
        return Err(ValidationError::InvalidField {
            field: "metrics.utilizationRate",
            reason: format!("expected a value between 0.0 and 1.0, got {rate}"),
        });
    }
    Ok(rate)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "nodeId": "wh-1",
        "timestamp": "2026-03-01T12:00:03Z",
        "sensorType": "rfid",
        "metrics": { "currentInventory": 480, "utilizationRate": 0.48 },
        "source": "manual-entry",
        "messageId": "m-9"
    }"#;

    #[test]
    fn decodes_a_complete_event() {
        let event = IngestEvent::decode(VALID.as_bytes()).unwrap();
        assert_eq!(event.node_id.as_str(), "wh-1");
        assert_eq!(event.update.current_inventory, 480);
        assert_eq!(event.update.utilization_rate, 0.48);
        assert_eq!(event.update.source, "manual-entry");
        assert_eq!(event.message_id.as_deref(), Some("m-9"));
        assert_eq!(event.update.timestamp.to_rfc3339(), "2026-03-01T12:00:03+00:00");
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let json = r#"{"nodeId":"n1","timestamp":"2026-03-01T12:00:00+01:00",
            "metrics":{"currentInventory":0,"utilizationRate":0},"source":"erp"}"#;
        let event = IngestEvent::decode(json.as_bytes()).unwrap();
        assert!(event.sensor_type.is_none());
        assert!(event.message_id.is_none());
        assert_eq!(event.update.timestamp.to_rfc3339(), "2026-03-01T11:00:00+00:00");
    }

    #[test]
    fn missing_node_id_is_named() {
        let json = r#"{"timestamp":"2026-03-01T12:00:00Z",
            "metrics":{"currentInventory":1,"utilizationRate":0.1},"source":"erp"}"#;
        assert_eq!(
            IngestEvent::decode(json.as_bytes()),
            Err(ValidationError::MissingField("nodeId"))
        );
    }

    #[test]
    fn missing_metrics_is_named() {
        let raw = RawEvent {
            node_id: Some("n1".to_owned()),
            timestamp: Some("2026-03-01T12:00:00Z".to_owned()),
            source: Some("erp".to_owned()),
            ..RawEvent::default()
        };
        assert_eq!(
            IngestEvent::try_from(raw),
            Err(ValidationError::MissingField("metrics"))
        );
    }

    #[test]
    fn blank_source_is_rejected() {
        let raw = RawEvent {
            node_id: Some("n1".to_owned()),
            timestamp: Some("2026-03-01T12:00:00Z".to_owned()),
            metrics: Some(RawMetrics {
                current_inventory: Some(serde_json::json!(3)),
                utilization_rate: Some(0.2),
            }),
            source: Some("  ".to_owned()),
            ..RawEvent::default()
        };
        assert_eq!(
            IngestEvent::try_from(raw),
            Err(ValidationError::EmptyField("source"))
        );
    }

    #[test]
    fn unparseable_timestamp_is_rejected() {
        let json = VALID.replace("2026-03-01T12:00:03Z", "yesterday");
        assert!(matches!(
            IngestEvent::decode(json.as_bytes()),
            Err(ValidationError::InvalidField { field: "timestamp", .. })
        ));
    }

    #[test]
    fn fractional_or_negative_inventory_is_rejected() {
        for bad in ["480.5", "-1", "\"480\""] {
            let json = VALID.replace("480", bad);
            assert!(
                matches!(
                    IngestEvent::decode(json.as_bytes()),
                    Err(ValidationError::InvalidField { field: "metrics.currentInventory", .. })
                ),
                "inventory {bad} should be rejected"
            );
        }
    }

    #[test]
    fn integral_float_inventory_is_accepted() {
        for (text, expected) in [("480.0", 480), ("0.0", 0), ("4.8e2", 480)] {
            let json = VALID.replace("480", text);
            let event = IngestEvent::decode(json.as_bytes()).unwrap();
            assert_eq!(event.update.current_inventory, expected, "inventory {text}");
        }

        let json = VALID.replace("480", "1e300");
        assert!(matches!(
            IngestEvent::decode(json.as_bytes()),
            Err(ValidationError::InvalidField { field: "metrics.currentInventory", .. })
        ));
    }

    #[test]
    fn utilization_out_of_range_is_rejected() {
        let json = VALID.replace("0.48", "1.5");
        assert!(matches!(
            IngestEvent::decode(json.as_bytes()),
            Err(ValidationError::InvalidField { field: "metrics.utilizationRate", .. })
        ));
    }

    #[test]
    fn unknown_fields_fail_closed() {
        let json = VALID.replace("\"messageId\"", "\"priority\": 1, \"messageId\"");
        assert!(matches!(
            IngestEvent::decode(json.as_bytes()),
            Err(ValidationError::Malformed(_))
        ));
        assert!(matches!(
            IngestEvent::decode(b"not json"),
            Err(ValidationError::Malformed(_))
        ));
    }
}
