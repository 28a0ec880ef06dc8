use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

use super::{failure_detail, wipe, AuthenticatedRemote, CheckoutPlan, Git};

/// Brings a checkout directory to the remote tip of one branch.
///
/// The pipeline never commits, so the working tree is expected to be a
/// mirror of the remote: updates are fast-forward only and anything else
/// is reported instead of merged.
#[derive(Debug, Clone, Copy)]
pub struct CheckoutReconciler {
    git: Git,
}

impl CheckoutReconciler {
    pub fn new(git: Git) -> Self {
        Self { git }
    }

    /// Apply `plan` and return the commit checked out afterwards.
    pub fn reconcile(
        &self,
        path: &Path,
        remote: &AuthenticatedRemote,
        branch: &str,
        plan: CheckoutPlan,
    ) -> Result<String> {
        match plan {
            CheckoutPlan::FreshClone => self.fresh_clone(path, remote, branch)?,
            CheckoutPlan::UpdateExisting => self.update_existing(path, remote, branch)?,
        }

        self.git.head(path).ok_or_else(|| {
            Error::git_reconcile_failed(branch, "rev-parse", "checkout has no HEAD commit")
        })
    }

    fn fresh_clone(&self, path: &Path, remote: &AuthenticatedRemote, branch: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::internal_io(e.to_string(), Some(format!("create {}", parent.display())))
            })?;
        }

        let target = path.to_string_lossy();
        let timeout = self.git.clone_timeout();
        let output = self.git.run(
            None,
            &[
                "clone",
                "--depth",
                "1",
                "--branch",
                branch,
                remote.url(),
                target.as_ref(),
            ],
            timeout,
        );

        let failure = match output {
            Ok(out) if out.success => return Ok(()),
            Ok(out) => failure_detail(&out, timeout),
            Err(e) => e.message,
        };

        wipe(path);
        Err(Error::git_clone_failed(branch, failure))
    }

    fn update_existing(&self, path: &Path, remote: &AuthenticatedRemote, branch: &str) -> Result<()> {
        self.ensure_origin(path, remote, branch)?;

        let timeout = self.git.remote_timeout();
        let fetch = self
            .git
            .run(Some(path), &["fetch", "--prune", "origin"], timeout)?;
        if !fetch.success {
            return Err(Error::git_fetch_failed(failure_detail(&fetch, timeout)));
        }

        let local_ref = format!("refs/heads/{}", branch);
        let upstream = format!("origin/{}", branch);

        if self
            .git
            .succeeds(path, &["rev-parse", "--verify", "--quiet", &local_ref])
        {
            self.step(path, branch, "checkout", &["checkout", branch], timeout)?;
            let set_upstream = format!("--set-upstream-to={}", upstream);
            if !self.git.succeeds(path, &["branch", &set_upstream, branch]) {
                tracing::warn!(branch, "Could not set upstream tracking branch");
            }
        } else {
            self.step(
                path,
                branch,
                "checkout",
                &["checkout", "-b", branch, "--track", &upstream],
                timeout,
            )?;
        }

        self.step(
            path,
            branch,
            "pull",
            &["pull", "--ff-only", "origin", branch],
            timeout,
        )
    }

    /// Point `origin` at the current authenticated URL, replacing it when it
    /// differs (for example after a token rotation).
    fn ensure_origin(&self, path: &Path, remote: &AuthenticatedRemote, branch: &str) -> Result<()> {
        let current = self.git.config_value(path, "remote.origin.url");

        if current.as_deref() == Some(remote.url()) {
            return Ok(());
        }

        if current.is_some() {
            let _ = self.git.run(Some(path), &["remote", "remove", "origin"], None);
        }
        self.step(
            path,
            branch,
            "remote",
            &["remote", "add", "origin", remote.url()],
            None,
        )
    }

    fn step(
        &self,
        path: &Path,
        branch: &str,
        operation: &str,
        args: &[&str],
        timeout: Option<std::time::Duration>,
    ) -> Result<()> {
        let output = self.git.run(Some(path), args, timeout)?;
        if output.success {
            Ok(())
        } else {
            Err(Error::git_reconcile_failed(
                branch,
                operation,
                failure_detail(&output, timeout),
            ))
        }
    }
}
