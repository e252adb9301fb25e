use crate::types::{
  rfc3339_seconds, EntityMetadata, EntityType, EntityValue, NormalizedEntity, RawIndicator,
  Severity, ThreatDescriptor, ValidityInterval,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};

pub const VALIDITY_DAYS: i64 = 90;
pub const PRODUCT_NAME: &str = "MISP";
pub const SOURCE_TYPE: &str = "ENTITY_CONTEXT";
pub const THREAT_CATEGORY: &str = "NETWORK_SUSPICIOUS";

const DEFAULT_VENDOR: &str = "Unknown";
const DEFAULT_SUMMARY: &str = "MISP IoC";

pub fn entity_type_for(kind: &str) -> Option<EntityType> {
  match kind {
    "domain" | "hostname" => Some(EntityType::DomainName),
    "ip-src" | "ip-dst" => Some(EntityType::IpAddress),
    "url" => Some(EntityType::Url),
    "md5" | "sha1" | "sha256" => Some(EntityType::File),
    _ => None,
  }
}

/// Maps one attribute to a sink entity. Returns `None` for kinds the sink has no
/// entity shape for.
pub fn translate(indicator: &RawIndicator, now: DateTime<Utc>) -> Option<NormalizedEntity> {
  let entity_type = entity_type_for(&indicator.kind)?;
  let value = indicator.value.clone();

  let entity = match entity_type {
    EntityType::DomainName => EntityValue::Hostname(value),
    EntityType::IpAddress => EntityValue::Ip(value),
    EntityType::Url => EntityValue::Url(value),
    EntityType::File => {
      let mut hashes = BTreeMap::new();
      hashes.insert(indicator.kind.clone(), value);
      EntityValue::File(hashes)
    }
  };

  let event = indicator.event.as_ref();
  let vendor = event
    .and_then(|e| e.orgc.as_ref())
    .and_then(|o| o.name.clone())
    .unwrap_or_else(|| DEFAULT_VENDOR.to_string());
  let summary = event
    .and_then(|e| e.info.clone())
    .unwrap_or_else(|| DEFAULT_SUMMARY.to_string());
  let severity = Severity::from_threat_level(event.and_then(|e| e.threat_level_id.as_deref()));

  Some(NormalizedEntity {
    metadata: EntityMetadata {
      collected_timestamp: rfc3339_seconds(now),
      vendor_name: vendor,
      product_name: PRODUCT_NAME.to_string(),
      entity_type,
      source_type: SOURCE_TYPE.to_string(),
      interval: ValidityInterval {
        start_time: rfc3339_seconds(now),
        end_time: rfc3339_seconds(now + Duration::days(VALIDITY_DAYS)),
      },
      threat: vec![ThreatDescriptor {
        category: THREAT_CATEGORY.to_string(),
        severity,
        summary,
        threat_id: indicator.uuid.clone().unwrap_or_default(),
        description: indicator.comment.clone().unwrap_or_default(),
      }],
    },
    entity,
  })
}

/// Result of translating one page of attributes.
#[derive(Debug, Default)]
pub struct PageTranslation {
  pub entities: Vec<NormalizedEntity>,
  pub skipped: HashMap<String, usize>,
}

impl PageTranslation {
  pub fn skipped_total(&self) -> usize {
    self.skipped.values().sum()
  }
}

pub fn translate_page(indicators: &[RawIndicator], now: DateTime<Utc>) -> PageTranslation {
  let mut out = PageTranslation::default();
  for ind in indicators {
    match translate(ind, now) {
      Some(entity) => out.entities.push(entity),
      None => *out.skipped.entry(ind.kind.clone()).or_default() += 1,
    }
  }
  out
}
