//! Pure trigger decisions, separated from the Git walking for testing.

use piped_config::CommitMatcher;

use regex::Regex;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitForce {
    QuickSync,
    Pipeline,
}

/// Whether the commit message forces a trigger regardless of the changed
/// paths. The quick-sync matcher wins when both match.
pub fn commit_force(matcher: &CommitMatcher, message: &str) -> Option<CommitForce> {
    if matches_pattern(matcher.quick_sync.as_deref(), message) {
        return Some(CommitForce::QuickSync);
    }
    if matches_pattern(matcher.pipeline.as_deref(), message) {
        return Some(CommitForce::Pipeline);
    }
    None
}

fn matches_pattern(pattern: Option<&str>, message: &str) -> bool {
    let Some(pattern) = pattern else {
        return false;
    };
    match Regex::new(pattern) {
        Ok(re) => re.is_match(message),
        Err(e) => {
            // validated at load time; a broken pattern never forces
            warn!(msg = "invalid commit matcher", pattern = %pattern, err = %e);
            false
        }
    }
}

/// Whether any changed path belongs to the application: inside the app
/// directory or under one of its extra trigger paths.
pub fn touches_application(
    changed_files: &[String],
    app_dir: &str,
    trigger_paths: &[String],
) -> bool {
    let mut prefixes: Vec<&str> = vec![app_dir];
    prefixes.extend(trigger_paths.iter().map(String::as_str));
    changed_files.iter().any(|file| {
        prefixes.iter().any(|prefix| {
            let prefix = prefix.trim_end_matches('/');
            if prefix.is_empty() || prefix == "." {
                return true;
            }
            file == prefix || file.starts_with(&format!("{prefix}/"))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_touches_application_by_directory() {
        assert!(touches_application(
            &changed(&["services/api/deployment.yaml"]),
            "services/api",
            &[],
        ));
        assert!(!touches_application(
            &changed(&["services/web/deployment.yaml"]),
            "services/api",
            &[],
        ));
        // sibling directory sharing a prefix is not inside the app dir
        assert!(!touches_application(
            &changed(&["services/api-gateway/deployment.yaml"]),
            "services/api",
            &[],
        ));
    }

    #[test]
    fn test_touches_application_by_trigger_path() {
        assert!(touches_application(
            &changed(&["shared/base.yaml"]),
            "services/api",
            &["shared".to_string()],
        ));
    }

    #[test]
    fn test_commit_force() {
        let matcher = CommitMatcher {
            quick_sync: Some("^/quick-sync".to_string()),
            pipeline: Some("^/pipeline".to_string()),
        };
        assert_eq!(
            commit_force(&matcher, "/quick-sync please"),
            Some(CommitForce::QuickSync)
        );
        assert_eq!(
            commit_force(&matcher, "/pipeline full rollout"),
            Some(CommitForce::Pipeline)
        );
        assert_eq!(commit_force(&matcher, "regular change"), None);
    }

    #[test]
    fn test_commit_force_without_patterns() {
        assert_eq!(
            commit_force(&CommitMatcher::default(), "anything"),
            None
        );
    }
}
