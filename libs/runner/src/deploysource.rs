//! A deploy source is a working tree pinned at one commit plus the
//! application configuration found inside it.

use crate::error::{Error, Result};

use piped_config::Config;
use piped_git::{Repo, RepoClone};
use piped_model::GitPath;

use std::path::{Path, PathBuf};

pub struct DeploySource {
    pub commit_hash: String,
    pub repo_dir: PathBuf,
    pub app_dir: PathBuf,
    pub config: Config,
    // keeps the detached clone alive for the lifetime of the source
    _clone: Option<RepoClone>,
}

impl DeploySource {
    /// Check out an independent tree at the given commit and load the
    /// application configuration from it.
    pub async fn prepare(
        repo: &Repo,
        git_path: &GitPath,
        commit_hash: &str,
        dest: impl AsRef<Path>,
    ) -> Result<Self> {
        let clone = repo
            .clone_at(commit_hash, dest.as_ref())
            .await
            .map_err(|e| Error::Git(format!("prepare deploy source at {commit_hash}"), e))?;
        let repo_dir = clone.dir().to_path_buf();
        let mut source = Self::from_dir(repo_dir, git_path, commit_hash)?;
        source._clone = Some(clone);
        Ok(source)
    }

    /// Build a source over an existing tree. Used by the drift detector
    /// (which owns a head checkout) and by tests.
    pub fn from_dir(
        repo_dir: impl Into<PathBuf>,
        git_path: &GitPath,
        commit_hash: &str,
    ) -> Result<Self> {
        let repo_dir = repo_dir.into();
        let app_dir = repo_dir.join(&git_path.path);
        let config_path = app_dir.join(git_path.config_file());
        let config = piped_config::load_from_file(&config_path)
            .map_err(|e| Error::Config(format!("{}: {e}", config_path.display())))?;
        if matches!(config, Config::Piped(_)) {
            return Err(Error::Config(format!(
                "{} holds a Piped configuration, expected an application kind",
                config_path.display()
            )));
        }
        Ok(Self {
            commit_hash: commit_hash.to_string(),
            repo_dir,
            app_dir,
            config,
            _clone: None,
        })
    }

    pub fn generic(&self) -> &piped_config::GenericAppSpec {
        // checked at construction: the config is always an application kind
        self.config
            .generic()
            .expect("deploy source config is an application kind")
    }
}
