//! Canonical fingerprints for cacheable step identities
//!
//! A fingerprint is a SHA-256 digest over (step kind, canonicalized inputs,
//! schema version). Canonical JSON sorts object keys so semantically identical
//! inputs digest identically regardless of incidental ordering. For query
//! steps the validated, normalized SQL is the input contribution; raw agent
//! text never reaches a fingerprint.

use crate::plan::types::StepKind;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// A cache key: schema version prefix plus content digest
///
/// The version prefix makes every entry from an older schema unreachable the
/// moment the version changes, and gives invalidate-by-prefix a handle on
/// whole generations of entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// The full cache key string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize a JSON value to its canonical form: objects with sorted keys,
/// no insignificant whitespace
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let items: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", items.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Fingerprint a step by its kind and resolved input bindings
pub fn step_fingerprint(
    kind: StepKind,
    inputs: &BTreeMap<String, Value>,
    schema_version: &str,
) -> Fingerprint {
    let inputs_value = Value::Object(
        inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    let canonical = canonical_json(&inputs_value);
    Fingerprint(format!(
        "{}:step:{}",
        schema_version,
        digest(&[kind.as_str(), &canonical, schema_version])
    ))
}

/// Fingerprint a validated query by its normalized SQL
///
/// Only SQL that has passed grounding is fingerprinted this way, so two
/// differently formatted generations of the same query share one entry.
pub fn query_fingerprint(normalized_sql: &str, schema_version: &str) -> Fingerprint {
    Fingerprint(format!(
        "{}:query:{}",
        schema_version,
        digest(&[StepKind::Query.as_str(), normalized_sql, schema_version])
    ))
}

/// Key prefix covering every entry computed under a schema version
pub fn version_prefix(schema_version: &str) -> String {
    format!("{}:", schema_version)
}
