//! Serde-deserializable types matching the catalog API responses.
//!
//! These types are separate from domain types to allow lenient deserialization
//! while keeping [`Record`] focused on what the query layer needs.

use serde::Deserialize;

use super::types::Record;

// ============================================================================
// Record payload
// ============================================================================

/// Record ids arrive as either numbers or strings depending on the backend.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiId {
  Number(u64),
  Text(String),
}

impl ApiId {
  fn into_string(self) -> String {
    match self {
      ApiId::Number(n) => n.to_string(),
      ApiId::Text(s) => s,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiRecord {
  pub id: ApiId,
  pub name: String,
  #[serde(default, alias = "type")]
  pub species: String,
  #[serde(default)]
  pub effects: Vec<String>,
  #[serde(default, alias = "flavours")]
  pub flavors: Vec<String>,
  #[serde(default, alias = "thcPercent")]
  pub thc: Option<f64>,
  #[serde(default, alias = "updatedAt")]
  pub updated_at: String,
}

impl From<ApiRecord> for Record {
  fn from(api: ApiRecord) -> Self {
    Record {
      id: api.id.into_string(),
      name: api.name,
      species: api.species,
      effects: api.effects,
      flavors: api.flavors,
      thc: api.thc,
      updated_at: api.updated_at,
    }
  }
}

// ============================================================================
// List endpoints
// ============================================================================

/// `GET /records` response.
#[derive(Debug, Deserialize)]
pub struct ApiPageResponse {
  #[serde(default)]
  pub items: Vec<ApiRecord>,
  #[serde(default, alias = "hasMore")]
  pub has_more: Option<bool>,
  /// Some deployments only report a total count
  pub total: Option<u64>,
}

impl ApiPageResponse {
  /// Whether another page follows `page`, falling back to `total` when the
  /// server omits `has_more`.
  pub fn has_more(&self, page: u32, limit: u32) -> bool {
    match (self.has_more, self.total) {
      (Some(has_more), _) => has_more,
      (None, Some(total)) => u64::from(page) * u64::from(limit) < total,
      (None, None) => self.items.len() as u64 >= u64::from(limit),
    }
  }
}

/// `GET /records/changes` response.
#[derive(Debug, Deserialize)]
pub struct ApiChangesResponse {
  #[serde(default)]
  pub items: Vec<ApiRecord>,
  #[serde(default, alias = "isLast")]
  pub is_last: bool,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_record_accepts_numeric_id_and_camel_case() {
    let json = r#"{"id": 42, "name": "Blue Dream", "type": "hybrid", "thcPercent": 18.5, "updatedAt": "2024-03-01T10:00:00Z"}"#;
    let api: ApiRecord = serde_json::from_str(json).unwrap();
    let record = Record::from(api);

    assert_eq!(record.id, "42");
    assert_eq!(record.species, "hybrid");
    assert_eq!(record.thc, Some(18.5));
    assert!(record.effects.is_empty());
  }

  #[test]
  fn test_has_more_falls_back_to_total() {
    let resp: ApiPageResponse = serde_json::from_str(r#"{"items": [], "total": 45}"#).unwrap();
    assert!(resp.has_more(2, 20));
    assert!(!resp.has_more(3, 20));

    let resp: ApiPageResponse = serde_json::from_str(r#"{"items": [], "hasMore": true}"#).unwrap();
    assert!(resp.has_more(9, 20));
  }
}
