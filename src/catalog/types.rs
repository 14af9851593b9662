//! Domain types for catalog queries.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Default number of records per page.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// A single catalog record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub id: String,
  pub name: String,
  pub species: String,
  #[serde(default)]
  pub effects: Vec<String>,
  #[serde(default)]
  pub flavors: Vec<String>,
  pub thc: Option<f64>,
  /// Last modification timestamp (ISO 8601)
  pub updated_at: String,
}

/// Immutable set of filter parameters for a catalog query.
///
/// Text fields are trimmed and lowercased when set, empty optional filters
/// collapse to `None`, and THC bounds are normalised, so two criteria compare
/// equal exactly when they select the same records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterCriteria {
  search: String,
  species: Option<String>,
  effect: Option<String>,
  flavor: Option<String>,
  min_thc: Option<f64>,
  max_thc: Option<f64>,
  page_size: u32,
}

impl Default for FilterCriteria {
  fn default() -> Self {
    Self::new(DEFAULT_PAGE_SIZE)
  }
}

impl FilterCriteria {
  pub fn new(page_size: u32) -> Self {
    Self {
      search: String::new(),
      species: None,
      effect: None,
      flavor: None,
      min_thc: None,
      max_thc: None,
      page_size: page_size.max(1),
    }
  }

  pub fn with_search(mut self, search: impl AsRef<str>) -> Self {
    self.search = normalize_text(search.as_ref());
    self
  }

  pub fn with_species(mut self, species: impl AsRef<str>) -> Self {
    self.species = normalize_optional(species.as_ref());
    self
  }

  pub fn with_effect(mut self, effect: impl AsRef<str>) -> Self {
    self.effect = normalize_optional(effect.as_ref());
    self
  }

  pub fn with_flavor(mut self, flavor: impl AsRef<str>) -> Self {
    self.flavor = normalize_optional(flavor.as_ref());
    self
  }

  /// Set the inclusive THC range. Non-finite bounds are ignored.
  pub fn with_thc_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
    self.min_thc = min.and_then(normalize_bound);
    self.max_thc = max.and_then(normalize_bound);
    self
  }

  pub fn with_page_size(mut self, page_size: u32) -> Self {
    self.page_size = page_size.max(1);
    self
  }

  pub fn search(&self) -> &str {
    &self.search
  }

  pub fn species(&self) -> Option<&str> {
    self.species.as_deref()
  }

  pub fn effect(&self) -> Option<&str> {
    self.effect.as_deref()
  }

  pub fn flavor(&self) -> Option<&str> {
    self.flavor.as_deref()
  }

  pub fn min_thc(&self) -> Option<f64> {
    self.min_thc
  }

  pub fn max_thc(&self) -> Option<f64> {
    self.max_thc
  }

  pub fn page_size(&self) -> u32 {
    self.page_size
  }

  /// The filter predicate shared by the remote and local query paths.
  pub fn matches(&self, record: &Record) -> bool {
    if !self.search.is_empty() && !record.name.to_lowercase().contains(&self.search) {
      return false;
    }

    if let Some(species) = &self.species {
      if record.species.to_lowercase() != *species {
        return false;
      }
    }

    if let Some(effect) = &self.effect {
      if !record.effects.iter().any(|e| e.to_lowercase() == *effect) {
        return false;
      }
    }

    if let Some(flavor) = &self.flavor {
      if !record.flavors.iter().any(|f| f.to_lowercase() == *flavor) {
        return false;
      }
    }

    if self.min_thc.is_some() || self.max_thc.is_some() {
      let Some(thc) = record.thc else {
        return false;
      };
      if self.min_thc.is_some_and(|min| thc < min) || self.max_thc.is_some_and(|max| thc > max) {
        return false;
      }
    }

    true
  }

  /// Filter parameters as sent to the remote API.
  ///
  /// Carries the same field set that [`FilterCriteria::matches`] checks.
  pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
    let mut pairs = Vec::new();
    if !self.search.is_empty() {
      pairs.push(("search", self.search.clone()));
    }
    if let Some(species) = &self.species {
      pairs.push(("species", species.clone()));
    }
    if let Some(effect) = &self.effect {
      pairs.push(("effect", effect.clone()));
    }
    if let Some(flavor) = &self.flavor {
      pairs.push(("flavor", flavor.clone()));
    }
    if let Some(min) = self.min_thc {
      pairs.push(("min_thc", min.to_string()));
    }
    if let Some(max) = self.max_thc {
      pairs.push(("max_thc", max.to_string()));
    }
    pairs
  }

  /// Canonical cache key for these criteria.
  pub fn query_key(&self) -> QueryKey {
    QueryKey::from(self)
  }
}

fn normalize_text(s: &str) -> String {
  s.trim().to_lowercase()
}

fn normalize_optional(s: &str) -> Option<String> {
  let s = normalize_text(s);
  (!s.is_empty()).then_some(s)
}

fn normalize_bound(v: f64) -> Option<f64> {
  if !v.is_finite() {
    return None;
  }
  // -0.0 == 0.0 but would encode differently
  Some(if v == 0.0 { 0.0 } else { v })
}

/// Deterministic encoding of [`FilterCriteria`] used to identify cache entries.
///
/// Fields are written in sorted order as a JSON object, so the key does not
/// depend on the order in which filters were applied and distinct criteria
/// always produce distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(String);

impl QueryKey {
  /// SHA256 hex of the canonical key, for logs and diagnostics.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.0.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl From<&FilterCriteria> for QueryKey {
  fn from(criteria: &FilterCriteria) -> Self {
    let mut fields: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
    fields.insert("search", criteria.search.clone().into());
    fields.insert("species", criteria.species.clone().into());
    fields.insert("effect", criteria.effect.clone().into());
    fields.insert("flavor", criteria.flavor.clone().into());
    fields.insert("min_thc", criteria.min_thc.into());
    fields.insert("max_thc", criteria.max_thc.into());
    fields.insert("page_size", criteria.page_size.into());

    // A BTreeMap of JSON values always serializes
    let encoded = serde_json::to_string(&fields).unwrap_or_default();
    QueryKey(encoded)
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let digest = self.digest();
    f.write_str(&digest[..12])
  }
}

/// One page of query results. `cursor` is 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
  pub items: Vec<Record>,
  pub has_more: bool,
  pub cursor: u32,
}

#[cfg(test)]
pub(crate) fn record(id: &str, name: &str, species: &str, thc: Option<f64>) -> Record {
  Record {
    id: id.to_string(),
    name: name.to_string(),
    species: species.to_string(),
    effects: vec!["relaxed".to_string()],
    flavors: vec!["berry".to_string()],
    thc,
    updated_at: "2024-01-01T00:00:00Z".to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn test_text_filters_are_normalized() {
    let a = FilterCriteria::default()
      .with_search("  Blue ")
      .with_species("Indica")
      .with_effect("");
    let b = FilterCriteria::default().with_search("blue").with_species("indica");

    assert_eq!(a, b);
    assert_eq!(a.effect(), None);
    assert_eq!(a.query_key(), b.query_key());
  }

  #[test]
  fn test_key_independent_of_builder_order() {
    let a = FilterCriteria::default()
      .with_flavor("citrus")
      .with_species("sativa")
      .with_thc_range(Some(10.0), None);
    let b = FilterCriteria::default()
      .with_thc_range(Some(10.0), None)
      .with_species("sativa")
      .with_flavor("citrus");

    assert_eq!(a.query_key(), b.query_key());
  }

  #[test]
  fn test_swapped_fields_do_not_collide() {
    let a = FilterCriteria::default().with_effect("sweet");
    let b = FilterCriteria::default().with_flavor("sweet");
    assert_ne!(a.query_key(), b.query_key());

    let a = FilterCriteria::default().with_thc_range(Some(15.0), None);
    let b = FilterCriteria::default().with_thc_range(None, Some(15.0));
    assert_ne!(a.query_key(), b.query_key());
  }

  #[test]
  fn test_negative_zero_and_nan_bounds() {
    let a = FilterCriteria::default().with_thc_range(Some(-0.0), Some(f64::NAN));
    let b = FilterCriteria::default().with_thc_range(Some(0.0), None);
    assert_eq!(a, b);
    assert_eq!(a.query_key(), b.query_key());
  }

  #[test]
  fn test_matches_search_and_species() {
    let blue = record("1", "Blue Dream", "Hybrid", Some(18.0));
    let haze = record("2", "Super Lemon Haze", "Sativa", Some(21.0));

    let criteria = FilterCriteria::default().with_search("blue");
    assert!(criteria.matches(&blue));
    assert!(!criteria.matches(&haze));

    let criteria = FilterCriteria::default().with_species("sativa");
    assert!(!criteria.matches(&blue));
    assert!(criteria.matches(&haze));
  }

  #[test]
  fn test_matches_effect_and_flavor() {
    let blue = record("1", "Blue Dream", "Hybrid", Some(18.0));

    assert!(FilterCriteria::default().with_effect("Relaxed").matches(&blue));
    assert!(!FilterCriteria::default().with_effect("energetic").matches(&blue));
    assert!(FilterCriteria::default().with_flavor("berry").matches(&blue));
    assert!(!FilterCriteria::default().with_flavor("pine").matches(&blue));
  }

  #[test]
  fn test_matches_non_ascii_case() {
    let mut record = record("1", "Óscar's Kush", "Índica", Some(20.0));
    record.effects = vec!["Énergetic".to_string()];
    record.flavors = vec!["Çitrus".to_string()];

    assert!(FilterCriteria::default().with_search("ÓSCAR").matches(&record));
    assert!(FilterCriteria::default().with_species("ÍNDICA").matches(&record));
    assert!(FilterCriteria::default().with_effect("énergetic").matches(&record));
    assert!(FilterCriteria::default().with_flavor("çITRUS").matches(&record));
    assert!(!FilterCriteria::default().with_species("indica").matches(&record));
  }

  #[test]
  fn test_matches_thc_range_inclusive() {
    let criteria = FilterCriteria::default().with_thc_range(Some(18.0), Some(20.0));

    assert!(criteria.matches(&record("1", "a", "hybrid", Some(18.0))));
    assert!(criteria.matches(&record("2", "b", "hybrid", Some(20.0))));
    assert!(!criteria.matches(&record("3", "c", "hybrid", Some(20.5))));
    assert!(!criteria.matches(&record("4", "d", "hybrid", None)));
  }

  #[test]
  fn test_query_pairs_cover_filters() {
    let criteria = FilterCriteria::default()
      .with_search("blue")
      .with_species("hybrid")
      .with_thc_range(None, Some(22.5));

    assert_eq!(
      criteria.query_pairs(),
      vec![
        ("search", "blue".to_string()),
        ("species", "hybrid".to_string()),
        ("max_thc", "22.5".to_string()),
      ]
    );
  }

  fn criteria_strategy() -> impl Strategy<Value = FilterCriteria> {
    (
      prop::sample::select(vec!["", "blue", " Blue", "haze"]),
      prop::option::of(prop::sample::select(vec!["indica", "sativa", "HYBRID"])),
      prop::option::of(prop::sample::select(vec!["relaxed", "happy"])),
      prop::option::of(prop::sample::select(vec!["berry", "happy"])),
      prop::option::of(0u8..4),
      prop::option::of(0u8..4),
      prop::sample::select(vec![10u32, 20]),
    )
      .prop_map(|(search, species, effect, flavor, min, max, page_size)| {
        let mut c = FilterCriteria::new(page_size)
          .with_search(search)
          .with_thc_range(min.map(f64::from), max.map(f64::from));
        if let Some(species) = species {
          c = c.with_species(species);
        }
        if let Some(effect) = effect {
          c = c.with_effect(effect);
        }
        if let Some(flavor) = flavor {
          c = c.with_flavor(flavor);
        }
        c
      })
  }

  proptest! {
    #[test]
    fn prop_key_equal_iff_criteria_equal(a in criteria_strategy(), b in criteria_strategy()) {
      prop_assert_eq!(a == b, a.query_key() == b.query_key());
    }
  }
}
