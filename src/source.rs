//! Source fetch (git) driver
//!
//! Keeps one working copy per site under the apps directory and builds it
//! in place. The registry is not involved in this step.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::SourceConfig;
use crate::exec::{CommandRunner, CommandSpec};
use crate::fsutil::sanitize_domain;

/// A fetched working copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkout {
    pub dir: PathBuf,
    pub commit: String,
}

/// Driver for the source-fetch collaborator
#[derive(Clone)]
pub struct SourceFetcher {
    config: SourceConfig,
    runner: Arc<dyn CommandRunner>,
}

impl SourceFetcher {
    pub fn new(config: SourceConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    pub fn checkout_dir(&self, domain: &str) -> PathBuf {
        self.config.apps_dir.join(sanitize_domain(domain))
    }

    /// Command the supervisor should run from the checkout
    pub fn start_command(&self) -> &str {
        &self.config.start_command
    }

    fn git(&self) -> Result<CommandSpec> {
        CommandSpec::parse(&self.config.git)
    }

    /// Clone the repository, or bring an existing checkout to the tip of `branch`
    pub fn fetch(&self, domain: &str, repo: &str, branch: &str) -> Result<Checkout> {
        let dir = self.checkout_dir(domain);
        let dir_str = dir.to_string_lossy().into_owned();

        if dir.join(".git").exists() {
            info!(domain, repo, branch, dir = %dir.display(), "Updating checkout");
            let upstream = format!("origin/{}", branch);
            for args in [
                vec!["remote", "set-url", "origin", repo],
                vec!["fetch", "--prune", "origin", branch],
                vec!["checkout", branch],
                vec!["reset", "--hard", upstream.as_str()],
            ] {
                let spec = self.git()?.arg("-C").arg(dir_str.as_str()).args(args);
                self.runner.run_checked(&spec)?;
            }
        } else {
            info!(domain, repo, branch, dir = %dir.display(), "Cloning repository");
            std::fs::create_dir_all(&self.config.apps_dir).with_context(|| {
                format!("Failed to create {}", self.config.apps_dir.display())
            })?;
            let spec = self
                .git()?
                .args(["clone", "--branch", branch, "--single-branch", repo])
                .arg(dir_str.as_str());
            self.runner
                .run_checked(&spec)
                .with_context(|| format!("Failed to clone {}", repo))?;
        }

        let head = self
            .git()?
            .arg("-C")
            .arg(dir_str.as_str())
            .args(["rev-parse", "HEAD"]);
        let commit = self.runner.run_checked(&head)?.stdout.trim().to_string();

        info!(domain, commit = %commit, "Source fetched");
        Ok(Checkout { dir, commit })
    }

    /// Run the configured build command in the checkout, if any
    pub fn build(&self, checkout: &Checkout) -> Result<bool> {
        let Some(command) = &self.config.build_command else {
            return Ok(false);
        };

        info!(dir = %checkout.dir.display(), command = %command, "Building");
        let spec = CommandSpec::new("sh")
            .arg("-c")
            .arg(command.as_str())
            .current_dir(&checkout.dir);
        self.runner.run_checked(&spec).context("Build failed")?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::exec::RecordingRunner;

    fn fetcher(dir: &Path, build: Option<&str>, runner: Arc<RecordingRunner>) -> SourceFetcher {
        let config = SourceConfig {
            apps_dir: dir.to_path_buf(),
            build_command: build.map(str::to_string),
            ..SourceConfig::default()
        };
        SourceFetcher::new(config, runner)
    }

    #[test]
    fn test_fresh_clone() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new().with_stdout("rev-parse", "abc123\n"));
        let src = fetcher(tmp.path(), None, runner.clone());

        let checkout = src.fetch("a.com", "https://git.example.com/a.git", "main").unwrap();
        assert_eq!(checkout.commit, "abc123");
        assert_eq!(checkout.dir, tmp.path().join("a.com"));

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("git clone --branch main --single-branch https://git.example.com/a.git"));
        assert!(calls[1].ends_with("rev-parse HEAD"));
    }

    #[test]
    fn test_update_existing_checkout() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("a.com").join(".git")).unwrap();
        let runner = Arc::new(RecordingRunner::new().with_stdout("rev-parse", "def456\n"));
        let src = fetcher(tmp.path(), None, runner.clone());

        let checkout = src.fetch("a.com", "https://git.example.com/moved.git", "prod").unwrap();
        assert_eq!(checkout.commit, "def456");

        // The origin follows the repository asked for
        let calls = runner.calls();
        assert_eq!(calls.len(), 5);
        assert!(calls[0].ends_with("remote set-url origin https://git.example.com/moved.git"));
        assert!(calls[1].ends_with("fetch --prune origin prod"));
        assert!(calls[2].ends_with("checkout prod"));
        assert!(calls[3].ends_with("reset --hard origin/prod"));
    }

    #[test]
    fn test_clone_failure() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new().failing("clone"));
        let src = fetcher(tmp.path(), None, runner);

        let err = format!("{:#}", src.fetch("a.com", "repo", "main").unwrap_err());
        assert!(err.contains("Failed to clone repo"));
    }

    #[test]
    fn test_build() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let checkout = Checkout {
            dir: tmp.path().join("a.com"),
            commit: "abc".to_string(),
        };

        assert!(!fetcher(tmp.path(), None, runner.clone()).build(&checkout).unwrap());
        assert!(runner.calls().is_empty());

        let src = fetcher(tmp.path(), Some("npm ci && npm run build"), runner.clone());
        assert!(src.build(&checkout).unwrap());

        let specs = runner.specs();
        assert_eq!(specs[0].args, vec!["-c", "npm ci && npm run build"]);
        assert_eq!(specs[0].cwd.as_deref(), Some(checkout.dir.as_path()));
    }
}
