//! Structural diff over JSON values producing path-rooted difference
//! records. Used by the planners and the drift detector to compare desired
//! and live manifests.

use serde_json::Value;

/// A single divergence between two values.
#[derive(Clone, Debug, PartialEq)]
pub struct DiffEntry {
    /// Slash-separated path from the compared root, e.g.
    /// `spec/template/spec/containers/0/image`.
    pub path: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Result of comparing two values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiffResult {
    pub entries: Vec<DiffEntry>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries whose path starts with the given prefix.
    pub fn scoped(&self, prefix: &str) -> DiffResult {
        DiffResult {
            entries: self
                .entries
                .iter()
                .filter(|e| e.path == prefix || e.path.starts_with(&format!("{prefix}/")))
                .cloned()
                .collect(),
        }
    }

    /// Whether every entry lives under one of the given prefixes.
    pub fn only_within(&self, prefixes: &[&str]) -> bool {
        self.entries.iter().all(|e| {
            prefixes
                .iter()
                .any(|p| e.path == *p || e.path.starts_with(&format!("{p}/")))
        })
    }
}

/// Compare two values recursively.
pub fn diff(before: &Value, after: &Value) -> DiffResult {
    let mut entries = Vec::new();
    walk("", Some(before), Some(after), &mut entries);
    DiffResult { entries }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}/{key}")
    }
}

fn walk(path: &str, before: Option<&Value>, after: Option<&Value>, out: &mut Vec<DiffEntry>) {
    match (before, after) {
        (Some(Value::Object(b)), Some(Value::Object(a))) => {
            let mut keys: Vec<&String> = b.keys().chain(a.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                walk(&join(path, key), b.get(key), a.get(key), out);
            }
        }
        (Some(Value::Array(b)), Some(Value::Array(a))) => {
            let len = b.len().max(a.len());
            for i in 0..len {
                walk(&join(path, &i.to_string()), b.get(i), a.get(i), out);
            }
        }
        (Some(b), Some(a)) => {
            if b != a {
                out.push(DiffEntry {
                    path: path.to_string(),
                    before: Some(b.clone()),
                    after: Some(a.clone()),
                });
            }
        }
        (Some(b), None) => out.push(DiffEntry {
            path: path.to_string(),
            before: Some(b.clone()),
            after: None,
        }),
        (None, Some(a)) => out.push(DiffEntry {
            path: path.to_string(),
            before: None,
            after: Some(a.clone()),
        }),
        (None, None) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equal_values_produce_empty_diff() {
        let v = json!({"spec": {"replicas": 3}});
        assert!(diff(&v, &v).is_empty());
    }

    #[test]
    fn test_scalar_change() {
        let before = json!({"spec": {"replicas": 3}});
        let after = json!({"spec": {"replicas": 5}});
        let result = diff(&before, &after);
        assert_eq!(result.len(), 1);
        assert_eq!(result.entries[0].path, "spec/replicas");
        assert_eq!(result.entries[0].before, Some(json!(3)));
        assert_eq!(result.entries[0].after, Some(json!(5)));
    }

    #[test]
    fn test_nested_array_change() {
        let before = json!({"spec": {"containers": [{"image": "app:1.2"}]}});
        let after = json!({"spec": {"containers": [{"image": "app:1.3"}]}});
        let result = diff(&before, &after);
        assert_eq!(result.entries[0].path, "spec/containers/0/image");
    }

    #[test]
    fn test_added_and_removed_fields() {
        let before = json!({"a": 1});
        let after = json!({"b": 2});
        let result = diff(&before, &after);
        assert_eq!(result.len(), 2);
        assert!(result.entries.iter().any(|e| e.path == "a" && e.after.is_none()));
        assert!(result.entries.iter().any(|e| e.path == "b" && e.before.is_none()));
    }

    #[test]
    fn test_scoping() {
        let before = json!({"spec": {"replicas": 3, "template": {"x": 1}}, "status": {"y": 1}});
        let after = json!({"spec": {"replicas": 5, "template": {"x": 2}}, "status": {"y": 2}});
        let result = diff(&before, &after);
        let scoped = result.scoped("spec/template");
        assert_eq!(scoped.len(), 1);
        assert!(result.scoped("spec").only_within(&["spec"]));
        assert!(!result.only_within(&["spec"]));
    }
}
