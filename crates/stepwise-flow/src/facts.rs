use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Facts collected from the user in one conversation thread.
///
/// Keys are fact names; values are JSON. A `null` value counts as absent.
/// Later writes replace earlier ones, which is how corrections land.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactStore {
    facts: BTreeMap<String, serde_json::Value>,
}

impl FactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(facts: BTreeMap<String, serde_json::Value>) -> Self {
        Self { facts }
    }

    /// Get a fact, treating `null` as missing.
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.facts.get(name).filter(|v| !v.is_null())
    }

    /// Get a fact as a string, if it's a string.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Write a fact, returning the value it replaced.
    pub(crate) fn record(
        &mut self,
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> Option<serde_json::Value> {
        self.facts.insert(name.into(), value)
    }

    /// Names from `required` that have no non-null value, in the given order.
    pub fn missing(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|name| !self.contains(name))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.facts.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.facts
    }
}

impl std::fmt::Display for FactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.facts.is_empty() {
            return write!(f, "(none)");
        }
        let parts: Vec<String> = self
            .facts
            .iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => format!("{}={}", k, s),
                other => format!("{}={}", k, other),
            })
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_counts_as_missing() {
        let mut facts = FactStore::new();
        facts.record("warranty_status", serde_json::Value::Null);
        assert!(!facts.contains("warranty_status"));
        assert_eq!(facts.get("warranty_status"), None);
        assert_eq!(facts.len(), 1);
    }

    #[test]
    fn later_writes_overwrite() {
        let mut facts = FactStore::new();
        assert_eq!(facts.record("warranty_status", json!("in_warranty")), None);
        let previous = facts.record("warranty_status", json!("out_of_warranty"));
        assert_eq!(previous, Some(json!("in_warranty")));
        assert_eq!(facts.get_str("warranty_status"), Some("out_of_warranty"));
    }

    #[test]
    fn missing_preserves_required_order() {
        let mut facts = FactStore::new();
        facts.record("issue_type", json!("hardware"));
        let required = vec![
            "warranty_status".to_string(),
            "issue_type".to_string(),
            "serial".to_string(),
        ];
        assert_eq!(facts.missing(&required), vec!["warranty_status", "serial"]);
    }

    #[test]
    fn serializes_as_plain_map() {
        let mut facts = FactStore::new();
        facts.record("issue_type", json!("software"));
        let json = serde_json::to_value(&facts).unwrap();
        assert_eq!(json, json!({"issue_type": "software"}));
        let back: FactStore = serde_json::from_value(json).unwrap();
        assert_eq!(back, facts);
    }

    #[test]
    fn display_lists_facts() {
        let mut facts = FactStore::new();
        assert_eq!(facts.to_string(), "(none)");
        facts.record("issue_type", json!("hardware"));
        facts.record("attempts", json!(2));
        assert_eq!(facts.to_string(), "attempts=2, issue_type=hardware");
    }
}
