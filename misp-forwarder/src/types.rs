use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
  Critical,
  High,
  Medium,
  Low,
}

impl Severity {
  /// MISP `threat_level_id`: 1..=4, anything else is treated as HIGH.
  pub fn from_threat_level(level: Option<&str>) -> Self {
    match level.map(str::trim) {
      Some("1") => Severity::Critical,
      Some("2") => Severity::High,
      Some("3") => Severity::Medium,
      Some("4") => Severity::Low,
      _ => Severity::High,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
  DomainName,
  IpAddress,
  Url,
  File,
}

/// One MISP attribute as returned by `/attributes/restSearch`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawIndicator {
  #[serde(rename = "type", default)]
  pub kind: String,

  #[serde(default)]
  pub value: String,

  #[serde(default, deserialize_with = "de_opt_epoch")]
  pub timestamp: Option<i64>,

  #[serde(default)]
  pub uuid: Option<String>,

  #[serde(default)]
  pub comment: Option<String>,

  #[serde(rename = "Event", default)]
  pub event: Option<EventContext>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventContext {
  #[serde(default)]
  pub info: Option<String>,

  #[serde(default, deserialize_with = "de_opt_string_or_number")]
  pub threat_level_id: Option<String>,

  #[serde(rename = "Orgc", default)]
  pub orgc: Option<Organisation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Organisation {
  #[serde(default)]
  pub name: Option<String>,
}

/// Sink-ready entity context record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedEntity {
  pub metadata: EntityMetadata,
  pub entity: EntityValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityValue {
  Hostname(String),
  Ip(String),
  Url(String),
  File(BTreeMap<String, String>),
}

impl EntityValue {
  pub fn display_value(&self) -> &str {
    match self {
      EntityValue::Hostname(v) | EntityValue::Ip(v) | EntityValue::Url(v) => v,
      EntityValue::File(hashes) => hashes.values().next().map(String::as_str).unwrap_or("N/A"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityMetadata {
  pub collected_timestamp: String,
  pub vendor_name: String,
  pub product_name: String,
  pub entity_type: EntityType,
  pub source_type: String,
  pub interval: ValidityInterval,
  pub threat: Vec<ThreatDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidityInterval {
  pub start_time: String,
  pub end_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreatDescriptor {
  pub category: String,
  pub severity: Severity,
  pub summary: String,
  pub threat_id: String,
  pub description: String,
}

fn de_opt_string_or_number<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
  D: Deserializer<'de>,
{
  let v = Option::<serde_json::Value>::deserialize(de)?;
  Ok(match v {
    Some(serde_json::Value::String(s)) => Some(s),
    Some(serde_json::Value::Number(n)) => Some(n.to_string()),
    _ => None,
  })
}

// MISP sends epoch seconds as a string; tolerate both.
fn de_opt_epoch<'de, D>(de: D) -> Result<Option<i64>, D::Error>
where
  D: Deserializer<'de>,
{
  Ok(de_opt_string_or_number(de)?.and_then(|s| s.trim().parse::<i64>().ok()))
}

pub fn now_unix_s() -> i64 {
  chrono::Utc::now().timestamp()
}

pub fn rfc3339_seconds(ts: chrono::DateTime<chrono::Utc>) -> String {
  ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn raw_indicator_accepts_string_and_numeric_fields() {
    let raw = r#"{
      "type": "ip-src",
      "value": "1.2.3.4",
      "timestamp": "1600000000",
      "Event": { "info": "x", "threat_level_id": 3, "Orgc": { "name": "Org" } }
    }"#;
    let ind: RawIndicator = serde_json::from_str(raw).unwrap();
    assert_eq!(ind.timestamp, Some(1_600_000_000));
    let ev = ind.event.unwrap();
    assert_eq!(ev.threat_level_id.as_deref(), Some("3"));
    assert_eq!(ev.orgc.unwrap().name.as_deref(), Some("Org"));
  }

  #[test]
  fn unknown_threat_level_defaults_to_high() {
    assert_eq!(Severity::from_threat_level(Some("9")), Severity::High);
    assert_eq!(Severity::from_threat_level(None), Severity::High);
    assert_eq!(Severity::from_threat_level(Some("1")), Severity::Critical);
    assert_eq!(Severity::from_threat_level(Some("4")), Severity::Low);
  }

  #[test]
  fn entity_value_serializes_as_single_keyed_object() {
    let mut hashes = BTreeMap::new();
    hashes.insert("md5".to_string(), "abc".to_string());
    let json = serde_json::to_value(EntityValue::File(hashes)).unwrap();
    assert_eq!(json, serde_json::json!({ "file": { "md5": "abc" } }));

    let json = serde_json::to_value(EntityValue::Ip("1.2.3.4".into())).unwrap();
    assert_eq!(json, serde_json::json!({ "ip": "1.2.3.4" }));
  }
}
