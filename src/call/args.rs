//! Explicit, ordered argument records for wrapped calls.
//!
//! Callers bind every argument by name up front, so call-site syntax can
//! never affect cache identity. Two records carrying the same name/value
//! pairs are equal regardless of the order they were built in.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An ordered record of named arguments for one wrapped call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    entries: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an argument, replacing any existing value bound to the same name.
    pub fn set(&mut self, name: &str, value: Value) {
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
        } else {
            self.entries.push((name.to_string(), value));
        }
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Entries in name order, independent of insertion order. This is the
    /// view cache-key derivation consumes.
    pub fn canonical_entries(&self) -> Vec<(&str, &Value)> {
        let mut entries: Vec<(&str, &Value)> = self.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

impl FromIterator<(String, Value)> for CallArgs {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut args = CallArgs::new();
        for (name, value) in iter {
            args.set(&name, value);
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insertion_order_does_not_affect_canonical_view() {
        let a = CallArgs::new()
            .with("prompt", json!("hi"))
            .with("temperature", json!(0.7));
        let b = CallArgs::new()
            .with("temperature", json!(0.7))
            .with("prompt", json!("hi"));
        assert_eq!(a.canonical_entries(), b.canonical_entries());
    }

    #[test]
    fn set_replaces_existing_binding() {
        let mut args = CallArgs::new().with("prompt", json!("first"));
        args.set("prompt", json!("second"));
        assert_eq!(args.len(), 1);
        assert_eq!(args.get("prompt"), Some(&json!("second")));
    }
}
