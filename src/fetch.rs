//! Shallow repository checkout.
//!
//! [`GitFetcher`] runs `git clone --depth 1 --single-branch --branch <b>`
//! into a caller-owned directory with interactive prompts disabled and a
//! hard wall-clock timeout. The child process is killed if the timeout
//! fires or the future is dropped.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::FetchError;

/// Materializes a repository snapshot at `dest`.
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    async fn fetch(&self, url: &str, branch: &str, dest: &Path) -> Result<(), FetchError>;
}

pub struct GitFetcher {
    timeout: Duration,
}

impl GitFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl RepoFetcher for GitFetcher {
    async fn fetch(&self, url: &str, branch: &str, dest: &Path) -> Result<(), FetchError> {
        debug!(url, branch, dest = %dest.display(), "cloning");

        let child = Command::new("git")
            .args(["clone", "--depth", "1", "--single-branch", "--branch", branch, url])
            .arg(dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => return Err(FetchError::Timeout(self.timeout.as_secs())),
        };

        if !output.status.success() {
            return Err(FetchError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_clone_of_missing_source_fails() {
        let tmp = TempDir::new().unwrap();
        let fetcher = GitFetcher::new(Duration::from_secs(30));
        let missing = tmp.path().join("does-not-exist");
        let result = fetcher
            .fetch(&missing.to_string_lossy(), "main", &tmp.path().join("out"))
            .await;
        // Either git is absent (spawn error) or the clone itself fails.
        assert!(matches!(
            result,
            Err(FetchError::Failed { .. }) | Err(FetchError::Spawn(_))
        ));
    }
}
