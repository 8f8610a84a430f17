//! Thin wrapper over the `terraform` binary.

use piped_runner::error::{Error, Result};

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Result of `terraform plan -detailed-exitcode`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanResult {
    pub has_changes: bool,
    /// Tail of the human-readable plan output, e.g.
    /// `Plan: 1 to add, 2 to change, 0 to destroy.`
    pub summary: String,
}

pub struct Terraform {
    bin: PathBuf,
    dir: PathBuf,
    vars: Vec<String>,
    var_files: Vec<String>,
}

impl Terraform {
    pub fn new(
        bin: PathBuf,
        dir: impl Into<PathBuf>,
        vars: Vec<String>,
        var_files: Vec<String>,
    ) -> Self {
        Self {
            bin,
            dir: dir.into(),
            vars,
            var_files,
        }
    }

    fn var_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for var in &self.vars {
            args.push("-var".to_string());
            args.push(var.clone());
        }
        for file in &self.var_files {
            args.push("-var-file".to_string());
            args.push(file.clone());
        }
        args
    }

    pub async fn init(&self) -> Result<()> {
        self.run(&["init", "-no-color", "-input=false"], true)
            .await?;
        Ok(())
    }

    pub async fn select_workspace(&self, workspace: &str) -> Result<()> {
        self.run(
            &["workspace", "select", "-no-color", workspace],
            true,
        )
        .await?;
        Ok(())
    }

    pub async fn plan(&self) -> Result<PlanResult> {
        let mut args: Vec<String> = vec![
            "plan".to_string(),
            "-no-color".to_string(),
            "-input=false".to_string(),
            "-detailed-exitcode".to_string(),
        ];
        args.extend(self.var_args());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let (code, stdout, stderr) = self.run_raw(&arg_refs).await?;
        match code {
            Some(0) => Ok(PlanResult {
                has_changes: false,
                summary: "No changes. Infrastructure is up-to-date.".to_string(),
            }),
            Some(2) => Ok(PlanResult {
                has_changes: true,
                summary: parse_plan_summary(&stdout)
                    .unwrap_or_else(|| "Terraform plan detected changes".to_string()),
            }),
            _ => Err(Error::Internal(format!(
                "terraform plan failed: {}",
                stderr.trim()
            ))),
        }
    }

    pub async fn apply(&self) -> Result<String> {
        let mut args: Vec<String> = vec![
            "apply".to_string(),
            "-no-color".to_string(),
            "-input=false".to_string(),
            "-auto-approve".to_string(),
        ];
        args.extend(self.var_args());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&arg_refs, false).await
    }

    async fn run(&self, args: &[&str], quiet: bool) -> Result<String> {
        let (code, stdout, stderr) = self.run_raw(args).await?;
        if code != Some(0) {
            return Err(Error::Internal(format!(
                "terraform {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        if !quiet {
            debug!(msg = "terraform finished", command = args.first().copied().unwrap_or_default());
        }
        Ok(stdout)
    }

    async fn run_raw(&self, args: &[&str]) -> Result<(Option<i32>, String, String)> {
        let output = Command::new(&self.bin)
            .args(args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Io("run terraform".to_string(), e))?;
        Ok((
            output.status.code(),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Pick the `Plan: ...` line out of the plan output.
pub fn parse_plan_summary(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with("Plan:"))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan_summary() {
        let out = "\nTerraform will perform the following actions:\n\n  # null_resource.a will be created\n\nPlan: 1 to add, 0 to change, 0 to destroy.\n";
        assert_eq!(
            parse_plan_summary(out),
            Some("Plan: 1 to add, 0 to change, 0 to destroy.".to_string())
        );
        assert_eq!(parse_plan_summary("No changes."), None);
    }
}
