use crate::settings::GitSettings;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// The repository holding the service manifests
#[async_trait]
pub trait ConfigRepo: Send + Sync {
    /// Clone into `dir`, which must exist and be empty
    async fn checkout_to(&self, dir: &Path) -> Result<()>;

    /// Directory with the manifests inside a checkout at `dir`
    fn checkout_path(&self, dir: &Path) -> PathBuf;

    /// Commit every change in the checkout and push it. An empty string
    /// means the push went through without anything worth reporting.
    async fn commit_and_push(&self, dir: &Path, message: &str) -> Result<String>;
}

/// [`ConfigRepo`] backed by the `git` command line
#[derive(Debug, Clone)]
pub struct GitRepo {
    url: String,
    branch: String,
    path: String,
    ssh_key: Option<String>,
    user_name: String,
    user_email: String,
}

impl GitRepo {
    pub fn new(settings: &GitSettings) -> Self {
        Self {
            url: settings.url.clone(),
            branch: settings.branch.clone(),
            path: settings.path.clone(),
            ssh_key: settings.ssh_key.clone().filter(|key| !key.is_empty()),
            user_name: settings.user_name.clone(),
            user_email: settings.user_email.clone(),
        }
    }

    async fn git(&self, dir: Option<&Path>, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("git");
        if let Some(dir) = dir {
            cmd.arg("-C").arg(dir);
        }
        cmd.arg("-c")
            .arg(format!("user.name={}", self.user_name))
            .arg("-c")
            .arg(format!("user.email={}", self.user_email))
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0");
        if let Some(key) = &self.ssh_key {
            cmd.env(
                "GIT_SSH_COMMAND",
                format!("ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=no", key),
            );
        }

        debug!("Executing command: git {}", args.join(" "));

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to execute git {}", args[0]))?;

        if !output.status.success() {
            bail!(
                "git {} failed with status {}: {}",
                args[0],
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ConfigRepo for GitRepo {
    async fn checkout_to(&self, dir: &Path) -> Result<()> {
        let target = dir.to_string_lossy();
        self.git(
            None,
            &["clone", "--quiet", "--branch", &self.branch, &self.url, &target],
        )
        .await
        .with_context(|| format!("Failed to clone {}", self.url))?;
        info!(url = %self.url, branch = %self.branch, "Cloned config repo");
        Ok(())
    }

    fn checkout_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.path)
    }

    async fn commit_and_push(&self, dir: &Path, message: &str) -> Result<String> {
        self.git(Some(dir), &["add", "--all", "--", "."]).await?;

        let status = self.git(Some(dir), &["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            return Ok("No changes to commit.".to_string());
        }

        self.git(Some(dir), &["commit", "--quiet", "-m", message])
            .await
            .context("Failed to commit manifest changes")?;
        self.git(Some(dir), &["push", "--quiet", "origin", &self.branch])
            .await
            .with_context(|| format!("Failed to push to {}", self.url))?;

        info!(branch = %self.branch, "Pushed config repo");
        Ok(String::new())
    }
}
