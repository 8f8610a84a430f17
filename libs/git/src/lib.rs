//! Git plumbing for the agent.
//!
//! Repositories are mirrored under a working directory and mutated in place
//! by checkout, so every mutating operation holds the per-repository lock.
//! Planners and executors that need a tree at a fixed commit take a cheap
//! local clone instead of holding the lock for the whole deployment.

mod error;

pub use error::{Error, Result};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

/// A commit observed on a repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub hash: String,
    pub author: String,
    pub message: String,
}

/// Hands out per-repository handles rooted under one working directory.
pub struct GitClient {
    workdir: PathBuf,
    repos: Mutex<HashMap<String, Arc<Repo>>>,
}

impl GitClient {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            repos: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the handle for a configured repository.
    pub async fn repo(&self, repo_id: &str, remote: &str, branch: &str) -> Arc<Repo> {
        let mut repos = self.repos.lock().await;
        repos
            .entry(repo_id.to_string())
            .or_insert_with(|| {
                Arc::new(Repo {
                    dir: self.workdir.join(repo_id),
                    remote: remote.to_string(),
                    branch: branch.to_string(),
                    lock: Mutex::new(()),
                })
            })
            .clone()
    }
}

/// A single cloned repository. Checkout mutates the tree in place, so all
/// operations that touch the tree serialize on the internal lock.
pub struct Repo {
    dir: PathBuf,
    remote: String,
    branch: String,
    lock: Mutex<()>,
}

impl Repo {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Clone the repository if it is not present yet, then fetch the branch.
    pub async fn sync(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        if !self.dir.join(".git").exists() {
            debug!(msg = "cloning repository", remote = %self.remote, dir = %self.dir.display());
            if let Some(parent) = self.dir.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(Error::Io)?;
            }
            run_git(
                None,
                &[
                    "clone",
                    "--branch",
                    &self.branch,
                    &self.remote,
                    &self.dir.to_string_lossy(),
                ],
            )
            .await?;
        } else {
            run_git(Some(&self.dir), &["fetch", "origin", &self.branch]).await?;
        }
        Ok(())
    }

    /// Head commit of the remote branch as of the last sync.
    pub async fn head_commit(&self) -> Result<Commit> {
        let _guard = self.lock.lock().await;
        self.commit_info(&format!("origin/{}", self.branch)).await
    }

    /// Details of a single commit. Callers holding a [`RepoClone`] may use
    /// plain hashes; `origin/<branch>` style refs also work.
    pub async fn commit_info(&self, rev: &str) -> Result<Commit> {
        let out = run_git(
            Some(&self.dir),
            &["log", "-1", "--format=%H%x1f%an%x1f%B", rev],
        )
        .await?;
        parse_commit(&out).ok_or_else(|| Error::Parse(format!("unexpected log output for {rev}")))
    }

    /// Content of a file at a revision, without touching the working tree.
    pub async fn show_file(&self, rev: &str, path: &str) -> Result<String> {
        let _guard = self.lock.lock().await;
        run_git(Some(&self.dir), &["show", &format!("{rev}:{path}")]).await
    }

    /// Check out the tree of the remote branch head in place.
    pub async fn checkout_head(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        run_git(
            Some(&self.dir),
            &[
                "checkout",
                "--force",
                "--detach",
                &format!("origin/{}", self.branch),
            ],
        )
        .await?;
        Ok(())
    }

    /// File paths changed between two commits.
    pub async fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let out = run_git(
            Some(&self.dir),
            &["diff", "--name-only", &format!("{from}..{to}")],
        )
        .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Produce an independent working tree checked out at the given commit.
    /// The clone shares objects with the mirror, so it is cheap and does not
    /// take the mirror lock beyond the clone itself.
    pub async fn clone_at(&self, commit: &str, dest: impl AsRef<Path>) -> Result<RepoClone> {
        let dest = dest.as_ref().to_path_buf();
        {
            let _guard = self.lock.lock().await;
            run_git(
                None,
                &[
                    "clone",
                    "--shared",
                    &self.dir.to_string_lossy(),
                    &dest.to_string_lossy(),
                ],
            )
            .await?;
        }
        run_git(Some(&dest), &["checkout", "--detach", commit]).await?;
        Ok(RepoClone { dir: dest })
    }
}

/// A detached working tree produced by [`Repo::clone_at`].
#[derive(Debug)]
pub struct RepoClone {
    dir: PathBuf,
}

impl RepoClone {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn checkout(&self, commit: &str) -> Result<()> {
        run_git(Some(&self.dir), &["checkout", "--detach", commit]).await?;
        Ok(())
    }
}

fn parse_commit(out: &str) -> Option<Commit> {
    let mut parts = out.splitn(3, '\u{1f}');
    let hash = parts.next()?.trim().to_string();
    let author = parts.next()?.trim().to_string();
    let message = parts.next()?.trim().to_string();
    if hash.is_empty() {
        return None;
    }
    Some(Commit {
        hash,
        author,
        message,
    })
}

async fn run_git(cwd: Option<&Path>, args: &[&str]) -> Result<String> {
    let mut command = Command::new("git");
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    let output = command
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(Error::Io)?;
    if !output.status.success() {
        return Err(Error::Command {
            args: args.join(" "),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    String::from_utf8(output.stdout).map_err(|e| Error::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn git(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git")
            .current_dir(dir)
            .args([
                "-c",
                "user.name=test",
                "-c",
                "user.email=test@example.com",
            ])
            .args(args)
            .status()
            .expect("git runs");
        assert!(status.success(), "git {args:?} failed");
    }

    fn seed_origin(dir: &Path) {
        git(dir, &["init"]);
        git(dir, &["checkout", "-b", "main"]);
        std::fs::create_dir_all(dir.join("app")).unwrap();
        std::fs::write(dir.join("app/deployment.yaml"), "v: 1\n").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-m", "initial"]);
    }

    #[tokio::test]
    async fn test_sync_and_head_commit() {
        let origin = tempfile::tempdir().unwrap();
        seed_origin(origin.path());

        let workdir = tempfile::tempdir().unwrap();
        let client = GitClient::new(workdir.path());
        let repo = client
            .repo("main", &origin.path().to_string_lossy(), "main")
            .await;
        repo.sync().await.unwrap();

        let head = repo.head_commit().await.unwrap();
        assert_eq!(head.message, "initial");
        assert_eq!(head.author, "test");
        assert_eq!(head.hash.len(), 40);
    }

    #[tokio::test]
    async fn test_changed_files_between_commits() {
        let origin = tempfile::tempdir().unwrap();
        seed_origin(origin.path());

        let workdir = tempfile::tempdir().unwrap();
        let client = GitClient::new(workdir.path());
        let repo = client
            .repo("main", &origin.path().to_string_lossy(), "main")
            .await;
        repo.sync().await.unwrap();
        let first = repo.head_commit().await.unwrap();

        std::fs::write(origin.path().join("app/deployment.yaml"), "v: 2\n").unwrap();
        std::fs::write(origin.path().join("unrelated.txt"), "x\n").unwrap();
        git(origin.path(), &["add", "."]);
        git(origin.path(), &["commit", "-m", "bump"]);

        repo.sync().await.unwrap();
        let second = repo.head_commit().await.unwrap();
        let changed = repo.changed_files(&first.hash, &second.hash).await.unwrap();
        assert_eq!(
            changed,
            vec!["app/deployment.yaml".to_string(), "unrelated.txt".to_string()]
        );
    }

    #[tokio::test]
    async fn test_clone_at_fixed_commit() {
        let origin = tempfile::tempdir().unwrap();
        seed_origin(origin.path());

        let workdir = tempfile::tempdir().unwrap();
        let client = GitClient::new(workdir.path());
        let repo = client
            .repo("main", &origin.path().to_string_lossy(), "main")
            .await;
        repo.sync().await.unwrap();
        let first = repo.head_commit().await.unwrap();

        std::fs::write(origin.path().join("app/deployment.yaml"), "v: 2\n").unwrap();
        git(origin.path(), &["add", "."]);
        git(origin.path(), &["commit", "-m", "bump"]);
        repo.sync().await.unwrap();

        let dest = tempfile::tempdir().unwrap();
        let clone = repo
            .clone_at(&first.hash, dest.path().join("tree"))
            .await
            .unwrap();
        let content =
            std::fs::read_to_string(clone.dir().join("app/deployment.yaml")).unwrap();
        assert_eq!(content, "v: 1\n");
    }
}
