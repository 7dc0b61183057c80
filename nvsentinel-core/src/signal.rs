//! Producer signal schema
//!
//! Producers (NVML pollers, syslog scrapers, cloud-maintenance pollers) are
//! external processes; this module pins the wire contract they must emit.
//! Signals carry exactly the producer-owned subset of the HealthEvent spec;
//! the publisher assigns name, uid and all status fields.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::event::{HealthEventSpec, Overrides, RecommendedAction};

/// Current signal schema version.
pub const SIGNAL_SCHEMA_VERSION: &str = "v1";

fn default_version() -> String {
    SIGNAL_SCHEMA_VERSION.to_string()
}

/// One health observation from a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSignal {
    /// Schema version tag; unknown versions are rejected by the publisher.
    #[serde(default = "default_version")]
    pub version: String,

    pub source: String,
    pub node_name: String,

    #[serde(default)]
    pub component_class: String,

    #[serde(default)]
    pub check_name: String,

    #[serde(default)]
    pub is_fatal: bool,

    #[serde(default)]
    pub is_healthy: bool,

    #[serde(default)]
    pub error_codes: Vec<u64>,

    #[serde(default)]
    pub recommended_action: RecommendedAction,

    #[serde(default)]
    pub overrides: Overrides,

    /// Wall-clock instant the producer observed the fault. Accepts RFC 3339
    /// strings or integer epoch seconds on the wire; anything else is
    /// dropped rather than guessed at.
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub detected_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub message: String,

    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

impl HealthSignal {
    /// Deterministic de-duplication signature over the fields that identify
    /// a distinct fault: producer, node, check, and the sorted code set.
    /// `message` is deliberately excluded.
    pub fn signature(&self) -> String {
        let mut codes = self.error_codes.clone();
        codes.sort_unstable();
        codes.dedup();

        let mut hasher = Sha256::new();
        hasher.update(self.source.as_bytes());
        hasher.update([0]);
        hasher.update(self.node_name.as_bytes());
        hasher.update([0]);
        hasher.update(self.check_name.as_bytes());
        hasher.update([0]);
        for code in &codes {
            hasher.update(code.to_be_bytes());
        }

        let digest = hasher.finalize();
        digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
    }

    /// Build the spec of a fresh HealthEvent from this signal. Unknown wire
    /// fields ride along unharmed.
    pub fn to_event_spec(&self, received_at: DateTime<Utc>) -> HealthEventSpec {
        let mut codes = self.error_codes.clone();
        dedup_preserving_order(&mut codes);

        HealthEventSpec {
            source: self.source.clone(),
            node_name: self.node_name.clone(),
            component_class: self.component_class.clone(),
            check_name: self.check_name.clone(),
            is_fatal: self.is_fatal,
            is_healthy: self.is_healthy,
            error_codes: codes,
            recommended_action: self.recommended_action,
            overrides: self.overrides,
            detected_at: Some(self.detected_at.unwrap_or(received_at)),
            message: self.message.clone(),
            unknown: self.unknown.clone(),
        }
    }
}

/// Drop later duplicates, keeping first-seen order.
pub fn dedup_preserving_order(codes: &mut Vec<u64>) {
    let mut seen = std::collections::BTreeSet::new();
    codes.retain(|c| seen.insert(*c));
}

/// Parse a wire timestamp value: integer epoch seconds or an RFC 3339
/// string. Floats and other shapes are rejected, not coerced.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_i64()?;
            Utc.timestamp_opt(secs, 0).single()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(parse_timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signal(node: &str, check: &str, codes: &[u64]) -> HealthSignal {
        HealthSignal {
            version: SIGNAL_SCHEMA_VERSION.to_string(),
            source: "nvml".to_string(),
            node_name: node.to_string(),
            component_class: "GPU".to_string(),
            check_name: check.to_string(),
            is_fatal: true,
            is_healthy: false,
            error_codes: codes.to_vec(),
            recommended_action: RecommendedAction::RestartVm,
            overrides: Overrides::default(),
            detected_at: None,
            message: String::new(),
            unknown: BTreeMap::new(),
        }
    }

    #[test]
    fn test_signature_is_deterministic() {
        let a = signal("n1", "GpuXidError", &[79]);
        let b = signal("n1", "GpuXidError", &[79]);
        assert_eq!(a.signature(), b.signature());
        assert_eq!(a.signature().len(), 16);
    }

    #[test]
    fn test_signature_ignores_code_order_and_duplicates() {
        let a = signal("n1", "GpuXidError", &[79, 48]);
        let b = signal("n1", "GpuXidError", &[48, 79, 48]);
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn test_signature_ignores_message() {
        let mut a = signal("n1", "GpuXidError", &[79]);
        let mut b = signal("n1", "GpuXidError", &[79]);
        a.message = "first occurrence".to_string();
        b.message = "second occurrence".to_string();
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn test_signature_differs_across_identity_fields() {
        let base = signal("n1", "GpuXidError", &[79]);
        assert_ne!(base.signature(), signal("n2", "GpuXidError", &[79]).signature());
        assert_ne!(base.signature(), signal("n1", "GpuMemoryError", &[79]).signature());
        assert_ne!(base.signature(), signal("n1", "GpuXidError", &[48]).signature());

        let mut other_source = signal("n1", "GpuXidError", &[79]);
        other_source.source = "syslog".to_string();
        assert_ne!(base.signature(), other_source.signature());
    }

    #[test]
    fn test_parse_timestamp_epoch_seconds() {
        let ts = parse_timestamp(&json!(1640000000_i64)).unwrap();
        assert_eq!(ts.timestamp(), 1640000000);
    }

    #[test]
    fn test_parse_timestamp_rfc3339() {
        let ts = parse_timestamp(&json!("2025-06-01T12:00:00Z")).unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-06-01T12:00:00+00:00");
    }

    #[test]
    fn test_parse_timestamp_rejects_other_shapes() {
        assert!(parse_timestamp(&json!("not a timestamp")).is_none());
        assert!(parse_timestamp(&json!(1640000000.5)).is_none());
        assert!(parse_timestamp(&json!({"secs": 1640000000})).is_none());
        assert!(parse_timestamp(&json!(null)).is_none());
    }

    #[test]
    fn test_wire_decoding_with_epoch_timestamp_and_unknown_fields() {
        let wire = json!({
            "source": "syslog",
            "nodeName": "n1",
            "checkName": "GpuXidError",
            "isFatal": true,
            "errorCodes": [79],
            "recommendedAction": "RestartVM",
            "detectedAt": 1640000000_i64,
            "rackId": "rack-7"
        });

        let signal: HealthSignal = serde_json::from_value(wire).unwrap();
        assert_eq!(signal.version, SIGNAL_SCHEMA_VERSION);
        assert_eq!(signal.detected_at.unwrap().timestamp(), 1640000000);
        assert_eq!(signal.unknown["rackId"], "rack-7");
    }

    #[test]
    fn test_to_event_spec_carries_unknown_fields_and_dedups_codes() {
        let mut sig = signal("n1", "GpuXidError", &[79, 48, 79]);
        sig.unknown.insert("rackId".to_string(), json!("rack-7"));

        let now = Utc::now();
        let spec = sig.to_event_spec(now);

        assert_eq!(spec.error_codes, vec![79, 48]);
        assert_eq!(spec.detected_at, Some(now));
        assert_eq!(spec.unknown["rackId"], "rack-7");
    }
}
