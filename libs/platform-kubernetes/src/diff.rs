//! Diff helpers scoped to what the planner and the drift detector care
//! about: workload templates, replica counts and container images.

use piped_model::diff::{diff, DiffResult};
use piped_model::Manifest;

use serde_json::Value;

pub const WORKLOAD_KIND: &str = "Deployment";
pub const TEMPLATE_PATH: &str = "spec/template";
pub const REPLICAS_PATH: &str = "spec/replicas";

/// The first workload manifest of the set.
pub fn find_workload(manifests: &[Manifest]) -> Option<&Manifest> {
    manifests.iter().find(|m| m.key.kind == WORKLOAD_KIND)
}

/// A container image change between two workload revisions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageChange {
    pub name: String,
    pub before_tag: String,
    pub after_tag: String,
}

fn split_image(image: &str) -> (String, String) {
    match image.rsplit_once(':') {
        // a colon inside a registry port would contain '/', which never
        // appears in a tag
        Some((name, tag)) if !tag.contains('/') => (name.to_string(), tag.to_string()),
        _ => (image.to_string(), "latest".to_string()),
    }
}

/// Image changes between the old and new workload, matched by container
/// position.
pub fn image_changes(workload_diff: &DiffResult) -> Vec<ImageChange> {
    workload_diff
        .entries
        .iter()
        .filter(|e| e.path.starts_with("spec/template/spec/containers/") && e.path.ends_with("/image"))
        .filter_map(|e| {
            let before = e.before.as_ref()?.as_str()?;
            let after = e.after.as_ref()?.as_str()?;
            let (before_name, before_tag) = split_image(before);
            let (after_name, after_tag) = split_image(after);
            let name = if before_name == after_name {
                before_name
            } else {
                format!("{before_name} -> {after_name}")
            };
            Some(ImageChange {
                name,
                before_tag,
                after_tag,
            })
        })
        .collect()
}

/// Diff of the workloads of two manifest sets, or None when either side
/// has no workload.
pub fn workload_diff(old: &[Manifest], new: &[Manifest]) -> Option<DiffResult> {
    let old_workload = find_workload(old)?;
    let new_workload = find_workload(new)?;
    Some(diff(&old_workload.body, &new_workload.body))
}

/// Compare a desired object against the live object, looking only at the
/// fields the desired state specifies. Defaulted and server-populated
/// fields on the live object are ignored.
pub fn subset_diff(desired: &Value, live: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    walk_subset("", desired, live, &mut paths);
    paths
}

fn walk_subset(path: &str, desired: &Value, live: &Value, out: &mut Vec<String>) {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => {
            for (key, desired_value) in d {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}/{key}")
                };
                match l.get(key) {
                    Some(live_value) => walk_subset(&child, desired_value, live_value, out),
                    None => out.push(child),
                }
            }
        }
        (Value::Array(d), Value::Array(l)) => {
            if d.len() != l.len() {
                out.push(path.to_string());
                return;
            }
            for (index, desired_value) in d.iter().enumerate() {
                walk_subset(
                    &format!("{path}/{index}"),
                    desired_value,
                    &l[index],
                    out,
                );
            }
        }
        (d, l) => {
            if !values_equivalent(d, l) {
                out.push(path.to_string());
            }
        }
    }
}

/// Numeric-tolerant equality: the API server normalizes `1` and `1.0`,
/// and quantities like ports may round-trip through different number
/// representations.
fn values_equivalent(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
