use crate::error::{Error, Result};

use std::path::PathBuf;

/// Resolves the external binaries the executors invoke (`kubectl`, `helm`,
/// `kustomize`, `terraform`, `gcloud`, `aws`).
///
/// Lookup order: the configured tools directory, then `$PATH`. Installing
/// tools is an operator concern; a missing binary is reported as a
/// configuration error naming it.
pub struct ToolRegistry {
    tools_dir: PathBuf,
}

impl ToolRegistry {
    pub fn new(tools_dir: impl Into<PathBuf>) -> Self {
        Self {
            tools_dir: tools_dir.into(),
        }
    }

    /// Default location: `$HOME/.piped/tools`.
    pub fn default_dir() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".piped")
            .join("tools")
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let candidate = self.tools_dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if let Some(paths) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&paths) {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }
        Err(Error::Config(format!(
            "required tool {name:?} was found neither in {} nor in PATH",
            self.tools_dir.display()
        )))
    }

    pub fn kubectl(&self) -> Result<PathBuf> {
        self.resolve("kubectl")
    }

    pub fn kustomize(&self) -> Result<PathBuf> {
        self.resolve("kustomize")
    }

    pub fn helm(&self) -> Result<PathBuf> {
        self.resolve("helm")
    }

    pub fn terraform(&self) -> Result<PathBuf> {
        self.resolve("terraform")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tools_dir_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("kubectl");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();

        let registry = ToolRegistry::new(dir.path());
        assert_eq!(registry.kubectl().unwrap(), tool);
    }

    #[test]
    fn test_missing_tool_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path());
        let err = registry.resolve("definitely-not-a-real-tool").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
