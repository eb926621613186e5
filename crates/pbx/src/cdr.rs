//! CDR payloads
//!
//! The same record shape arrives from the webhook and from `cdrapi`. Numbers
//! are sometimes sent as strings and empty strings stand in for absent
//! values, so every field is parsed leniently.
//!
//! `cdrapi` returns either flat records or, for transferred and conferenced
//! calls, objects holding a `main_cdr` and numbered `sub_cdr_N` legs. Only
//! one leg per logical call is ingested; which one is decided by a
//! [`LegRule`].

use crate::client::PBX_TIME_FORMAT;
use callscope_common::config::PbxConfig;
use callscope_common::db::models::Disposition;
use callscope_common::db::NewCdr;
use callscope_common::errors::{AppError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

/// One call leg as reported by the PBX
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CdrPayload {
    #[serde(default, deserialize_with = "lenient_string")]
    pub uniqueid: Option<String>,

    #[serde(default, deserialize_with = "lenient_string")]
    pub src: Option<String>,

    #[serde(default, deserialize_with = "lenient_string")]
    pub dst: Option<String>,

    #[serde(default, deserialize_with = "lenient_string")]
    pub caller_name: Option<String>,

    #[serde(default, deserialize_with = "lenient_string")]
    pub clid: Option<String>,

    #[serde(default, deserialize_with = "lenient_string")]
    pub start: Option<String>,

    #[serde(default, deserialize_with = "lenient_string")]
    pub answer: Option<String>,

    #[serde(default, deserialize_with = "lenient_string")]
    pub end: Option<String>,

    #[serde(default, deserialize_with = "lenient_i64")]
    pub duration: i64,

    #[serde(default, deserialize_with = "lenient_i64")]
    pub billsec: i64,

    #[serde(default, deserialize_with = "lenient_string")]
    pub disposition: Option<String>,

    #[serde(default, deserialize_with = "lenient_string")]
    pub recordfiles: Option<String>,
}

impl CdrPayload {
    /// Parse one record
    pub fn from_value(value: &Value) -> Result<Self> {
        let payload: CdrPayload =
            serde_json::from_value(value.clone()).map_err(|e| AppError::InvalidFormat {
                message: format!("CDR payload: {}", e),
            })?;

        if payload.uniqueid.is_none() {
            return Err(AppError::MissingField {
                field: "uniqueid".into(),
            });
        }

        Ok(payload)
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
            .as_deref()
            .map(Disposition::parse)
            .unwrap_or(Disposition::Unknown)
    }

    /// Whether this leg carries a recording reference
    pub fn has_recording(&self) -> bool {
        self.recordfiles
            .as_deref()
            .is_some_and(|r| r.split('@').any(|part| !part.trim().is_empty()))
    }

    /// Convert into a row to insert
    pub fn into_new_cdr(self, tenant_id: Uuid, source: &str, raw: Value) -> Result<NewCdr> {
        let disposition = self.disposition();
        let uniqueid = self.uniqueid.ok_or_else(|| AppError::MissingField {
            field: "uniqueid".into(),
        })?;

        Ok(NewCdr {
            tenant_id,
            uniqueid,
            source: source.to_string(),
            src: self.src,
            dst: self.dst,
            caller_name: self.caller_name.or(self.clid),
            start_time: self.start.as_deref().and_then(parse_timestamp),
            answer_time: self.answer.as_deref().and_then(parse_timestamp),
            end_time: self.end.as_deref().and_then(parse_timestamp),
            duration: clamp_secs(self.duration),
            billsec: clamp_secs(self.billsec),
            disposition,
            recordfiles: self.recordfiles,
            quota_exceeded: false,
            raw_payload: Some(raw),
        })
    }
}

fn clamp_secs(value: i64) -> i32 {
    value.clamp(0, i64::from(i32::MAX)) as i32
}

/// Parse a PBX timestamp (`YYYY-MM-DD HH:MM:SS`, taken as UTC) or RFC 3339
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    NaiveDateTime::parse_from_str(raw, PBX_TIME_FORMAT)
        .map(|naive| naive.and_utc())
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        })
}

fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_i64<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<f64>().map(|f| f as i64).unwrap_or(0),
        _ => 0,
    })
}

// ============================================================================
// Leg selection
// ============================================================================

/// Which leg of a multi-leg call is authoritative
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegRule {
    /// First leg carrying a recording reference, `main_cdr` first
    Recording,
    /// A fixed leg key such as `sub_cdr_3`, falling back to `Recording`
    Key(String),
}

impl FromStr for LegRule {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("recording") {
            return Ok(LegRule::Recording);
        }
        match s.strip_prefix("key:") {
            Some(key) if !key.trim().is_empty() => Ok(LegRule::Key(key.trim().to_string())),
            _ => Err(AppError::Configuration {
                message: format!("pbx.leg_rule must be `recording` or `key:<leg>`, got `{}`", s),
            }),
        }
    }
}

impl LegRule {
    pub fn from_config(config: &PbxConfig) -> Result<Self> {
        config.leg_rule.parse()
    }

    /// Pick the authoritative leg out of a nested record
    fn select<'a>(&self, legs: &[(&'a str, &'a Value)]) -> Option<&'a Value> {
        if let LegRule::Key(key) = self {
            if let Some((_, leg)) = legs.iter().find(|(name, _)| name == key) {
                return Some(leg);
            }
        }

        legs.iter()
            .find(|(_, leg)| leg_has_recording(leg))
            .or_else(|| legs.iter().find(|(name, _)| *name == "main_cdr"))
            .or_else(|| legs.first())
            .map(|(_, leg)| *leg)
    }
}

fn leg_has_recording(leg: &Value) -> bool {
    leg.get("recordfiles")
        .and_then(Value::as_str)
        .is_some_and(|r| r.split('@').any(|part| !part.trim().is_empty()))
}

/// Numeric index of a `sub_cdr_N` key
fn sub_leg_index(key: &str) -> Option<u32> {
    key.strip_prefix("sub_cdr_")?.parse().ok()
}

/// Legs of a nested record: `main_cdr` first, then `sub_cdr_N` by N
fn nested_legs(record: &serde_json::Map<String, Value>) -> Vec<(&str, &Value)> {
    let mut subs: Vec<(u32, &str, &Value)> = record
        .iter()
        .filter_map(|(key, leg)| sub_leg_index(key).map(|n| (n, key.as_str(), leg)))
        .filter(|(_, _, leg)| leg.is_object())
        .collect();
    subs.sort_by_key(|(n, _, _)| *n);

    let mut legs = Vec::with_capacity(subs.len() + 1);
    if let Some(main) = record.get("main_cdr").filter(|v| v.is_object()) {
        legs.push(("main_cdr", main));
    }
    legs.extend(subs.into_iter().map(|(_, key, leg)| (key, leg)));
    legs
}

/// One authoritative record per logical call from a `cdr_root` value
pub fn extract_calls(cdr_root: &Value, rule: &LegRule) -> Vec<Value> {
    let records: Vec<&Value> = match cdr_root {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![cdr_root],
        _ => Vec::new(),
    };

    records
        .into_iter()
        .filter_map(|record| {
            let object = record.as_object()?;
            let legs = nested_legs(object);
            if legs.is_empty() {
                Some(record.clone())
            } else {
                rule.select(&legs).cloned()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;
    use chrono::{Datelike, Timelike};
    use serde_json::json;

    #[test]
    fn test_lenient_parsing() {
        let payload = CdrPayload::from_value(&json!({
            "uniqueid": 1700000000.123,
            "src": 1001,
            "dst": "5551234",
            "duration": "61",
            "billsec": 55,
            "disposition": "ANSWERED",
            "recordfiles": "",
            "caller_name": "   ",
            "clid": "\"Alice\" <1001>"
        }))
        .unwrap();

        assert_eq!(payload.uniqueid.as_deref(), Some("1700000000.123"));
        assert_eq!(payload.src.as_deref(), Some("1001"));
        assert_eq!(payload.duration, 61);
        assert_eq!(payload.billsec, 55);
        assert_eq!(payload.disposition(), Disposition::Answered);
        assert!(payload.recordfiles.is_none());
        assert!(payload.caller_name.is_none());
        assert!(!payload.has_recording());
    }

    #[test]
    fn test_missing_uniqueid_rejected() {
        let err = CdrPayload::from_value(&json!({"src": "1001"})).unwrap_err();
        assert!(matches!(err, AppError::MissingField { .. }));
    }

    #[test]
    fn test_into_new_cdr() {
        let raw = json!({
            "uniqueid": "abc-123",
            "disposition": "ANSWERED",
            "start": "2026-02-10 14:03:22",
            "duration": 90,
            "recordfiles": "2026-02/rec.wav@",
            "clid": "Alice"
        });
        let tenant = Uuid::new_v4();
        let cdr = CdrPayload::from_value(&raw)
            .unwrap()
            .into_new_cdr(tenant, "webhook", raw.clone())
            .unwrap();

        assert_eq!(cdr.uniqueid, "abc-123");
        assert_eq!(cdr.disposition, Disposition::Answered);
        assert_eq!(cdr.caller_name.as_deref(), Some("Alice"));
        assert_eq!(cdr.duration, 90);
        assert_eq!(cdr.raw_payload, Some(raw));
        let start = cdr.start_time.unwrap();
        assert_eq!((start.month(), start.day(), start.hour()), (2, 10, 14));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2026-02-10 14:03:22").is_some());
        assert!(parse_timestamp("2026-02-10T14:03:22+02:00").is_some());
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_leg_rule_parse() {
        assert_eq!("recording".parse::<LegRule>().unwrap(), LegRule::Recording);
        assert_eq!(
            "key:sub_cdr_3".parse::<LegRule>().unwrap(),
            LegRule::Key("sub_cdr_3".into())
        );
        assert_err!("key:".parse::<LegRule>());
        assert_err!("whatever".parse::<LegRule>());
    }

    #[test]
    fn test_flat_records_pass_through() {
        let root = json!([
            {"uniqueid": "a", "disposition": "ANSWERED"},
            {"uniqueid": "b", "disposition": "NO ANSWER"},
            "garbage"
        ]);
        let calls = extract_calls(&root, &LegRule::Recording);
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn test_nested_record_yields_recording_leg() {
        let root = json!([{
            "main_cdr": {"uniqueid": "m", "recordfiles": ""},
            "sub_cdr_10": {"uniqueid": "s10", "recordfiles": "x/late.wav@"},
            "sub_cdr_2": {"uniqueid": "s2", "recordfiles": "x/rec.wav@"},
            "sub_cdr_1": {"uniqueid": "s1", "recordfiles": "@"}
        }]);

        let calls = extract_calls(&root, &LegRule::Recording);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["uniqueid"], "s2");
    }

    #[test]
    fn test_nested_record_without_recording_uses_main() {
        let root = json!([{
            "main_cdr": {"uniqueid": "m"},
            "sub_cdr_1": {"uniqueid": "s1"}
        }]);
        let calls = extract_calls(&root, &LegRule::Recording);
        assert_eq!(calls[0]["uniqueid"], "m");
    }

    #[test]
    fn test_key_rule_with_fallback() {
        let root = json!([
            {
                "main_cdr": {"uniqueid": "m1"},
                "sub_cdr_3": {"uniqueid": "s3"}
            },
            {
                "main_cdr": {"uniqueid": "m2", "recordfiles": "a/b.wav@"},
                "sub_cdr_1": {"uniqueid": "s1"}
            }
        ]);
        let rule = LegRule::Key("sub_cdr_3".into());
        let calls = extract_calls(&root, &rule);

        assert_eq!(calls[0]["uniqueid"], "s3");
        assert_eq!(calls[1]["uniqueid"], "m2");
    }

    #[test]
    fn test_single_object_root() {
        let calls = extract_calls(&json!({"uniqueid": "solo"}), &LegRule::Recording);
        assert_eq!(calls.len(), 1);
        assert!(extract_calls(&Value::Null, &LegRule::Recording).is_empty());
    }
}
