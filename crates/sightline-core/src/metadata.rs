//! Free-form string metadata attached to sightings, identifiers and devices.

use std::collections::BTreeMap;

/// Ordered so that serialised metadata is stable across runs.
pub type Metadata = BTreeMap<String, String>;

/// Keys that mark a device as deleted when set to `"true"`.
pub const DELETION_KEYS: [&str; 2] = ["_deleted", "deleted"];

/// Legacy pointer key; the merge pointer lives in its own column.
pub const MERGED_INTO_KEY: &str = "_merged_into";

/// Shallow union of two maps; keys from `incoming` override `existing`.
/// Blank keys are dropped.
pub fn union(existing: &Metadata, incoming: &Metadata) -> Metadata {
  let mut merged = existing.clone();
  for (key, value) in incoming {
    let key = key.trim();
    if key.is_empty() {
      continue;
    }
    merged.insert(key.to_owned(), value.clone());
  }
  merged
}

/// Shallow union where `existing` keeps every key it already has.
pub fn fill(existing: &Metadata, incoming: &Metadata) -> Metadata {
  let mut merged = existing.clone();
  for (key, value) in incoming {
    let key = key.trim();
    if key.is_empty() {
      continue;
    }
    merged.entry(key.to_owned()).or_insert_with(|| value.clone());
  }
  merged
}

/// Case-insensitive `"true"` check on a metadata key.
pub fn is_true(metadata: &Metadata, key: &str) -> bool {
  metadata
    .get(key)
    .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// True when `metadata` explicitly asserts deletion.
pub fn asserts_deletion(metadata: &Metadata) -> bool {
  DELETION_KEYS.iter().any(|key| is_true(metadata, key))
}

/// Trimmed, non-empty value for the first of `keys` that has one.
pub fn first_non_empty<'a>(metadata: &'a Metadata, keys: &[&str]) -> Option<&'a str> {
  keys
    .iter()
    .filter_map(|key| metadata.get(*key))
    .map(|v| v.trim())
    .find(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn md(pairs: &[(&str, &str)]) -> Metadata {
    pairs
      .iter()
      .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
      .collect()
  }

  #[test]
  fn union_prefers_incoming() {
    let merged = union(&md(&[("a", "1"), ("b", "2")]), &md(&[("b", "3"), (" ", "x")]));
    assert_eq!(merged, md(&[("a", "1"), ("b", "3")]));
  }

  #[test]
  fn fill_keeps_existing() {
    let merged = fill(&md(&[("a", "1")]), &md(&[("a", "9"), ("c", "4")]));
    assert_eq!(merged, md(&[("a", "1"), ("c", "4")]));
  }

  #[test]
  fn deletion_assertion_is_case_insensitive() {
    assert!(asserts_deletion(&md(&[("_deleted", "TRUE")])));
    assert!(asserts_deletion(&md(&[("deleted", "true")])));
    assert!(!asserts_deletion(&md(&[("_deleted", "false")])));
    assert!(!asserts_deletion(&md(&[])));
  }
}
