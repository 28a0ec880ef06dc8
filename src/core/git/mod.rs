//! Everything the pipeline does to a git remote or a local checkout.
//!
//! Git is driven through its CLI with a fixed locale and prompts disabled.
//! Failures are classified here, once, from the exit status and stderr of
//! the git process; callers only see [`Error`] codes.

mod auth;
mod reconcile;
mod remote;
mod snapshot;

pub use auth::*;
pub use reconcile::*;
pub use remote::*;
pub use snapshot::*;

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use crate::config::StageTimeouts;
use crate::error::{Error, Result};
use crate::repository::Provider;
use crate::utils::command::{self, ProcessOutput};

/// Git CLI handle carrying the per-stage time limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct Git {
    timeouts: StageTimeouts,
}

impl Git {
    pub fn new(timeouts: StageTimeouts) -> Self {
        Self { timeouts }
    }

    pub fn remote_timeout(&self) -> Option<Duration> {
        self.timeouts.remote()
    }

    pub fn clone_timeout(&self) -> Option<Duration> {
        self.timeouts.clone_limit()
    }

    /// Run git in `dir` (or the current directory). Credentials are
    /// redacted from the captured output before it is returned.
    pub fn run(&self, dir: Option<&Path>, args: &[&str], timeout: Option<Duration>) -> Result<ProcessOutput> {
        let mut output = self.spawn(dir, args, timeout)?;
        output.stdout = redact(&output.stdout);
        output.stderr = redact(&output.stderr);
        Ok(output)
    }

    /// Local config value as stored, credentials included. Never log it.
    pub(crate) fn config_value(&self, dir: &Path, key: &str) -> Option<String> {
        let output = self.spawn(Some(dir), &["config", "--get", key], None).ok()?;
        let value = output.stdout.trim();
        (output.success && !value.is_empty()).then(|| value.to_string())
    }

    fn spawn(&self, dir: Option<&Path>, args: &[&str], timeout: Option<Duration>) -> Result<ProcessOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .env("LC_ALL", "C")
            .env("GIT_TERMINAL_PROMPT", "0");
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        let context = format!("git {}", args.first().copied().unwrap_or_default());
        command::run_captured(cmd, timeout, &context)
            .map_err(|e| Error::git_command_failed(redact(&e.message)))
    }

    /// Trimmed stdout of a successful git call, `None` otherwise.
    pub fn query(&self, dir: &Path, args: &[&str]) -> Option<String> {
        let output = self.run(Some(dir), args, self.remote_timeout()).ok()?;
        output.success.then(|| output.stdout.trim().to_string())
    }

    pub fn succeeds(&self, dir: &Path, args: &[&str]) -> bool {
        self.run(Some(dir), args, self.remote_timeout())
            .map(|o| o.success)
            .unwrap_or(false)
    }

    /// Commit checked out in `dir`.
    pub fn head(&self, dir: &Path) -> Option<String> {
        self.query(dir, &["rev-parse", "HEAD"])
    }
}

/// What a failed remote operation says about the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFailure {
    AuthFailed,
    RepoNotFound,
    Unreachable,
}

const AUTH_SIGNALS: &[&str] = &[
    "authentication failed",
    "could not read username",
    "could not read password",
    "terminal prompts disabled",
    "invalid username or password",
    "http basic: access denied",
    "permission denied",
    "the requested url returned error: 401",
    "the requested url returned error: 403",
];

const NOT_FOUND_SIGNALS: &[&str] = &[
    "repository not found",
    "does not appear to be a git repository",
    "the requested url returned error: 404",
    "project you were looking for could not be found",
];

pub fn classify_remote_failure(stderr: &str) -> RemoteFailure {
    let text = stderr.to_ascii_lowercase();
    if AUTH_SIGNALS.iter().any(|s| text.contains(s)) {
        RemoteFailure::AuthFailed
    } else if NOT_FOUND_SIGNALS.iter().any(|s| text.contains(s)) {
        RemoteFailure::RepoNotFound
    } else {
        RemoteFailure::Unreachable
    }
}

/// Map a failed ls-remote (or other remote call) to its error kind.
pub(crate) fn remote_error(provider: Provider, url: &str, output: &ProcessOutput, timeout: Option<Duration>) -> Error {
    if output.timed_out {
        let secs = timeout.map(|t| t.as_secs()).unwrap_or_default();
        return Error::remote_unreachable(url, format!("timed out after {}s", secs));
    }

    let detail = output.error_text();
    match classify_remote_failure(&detail) {
        RemoteFailure::AuthFailed => Error::remote_auth_failed(provider, url, detail),
        RemoteFailure::RepoNotFound => Error::remote_repo_not_found(provider, url, detail),
        RemoteFailure::Unreachable => Error::remote_unreachable(url, detail),
    }
}

/// Error text of a failed local git step, naming the limit on timeout.
pub(crate) fn failure_detail(output: &ProcessOutput, timeout: Option<Duration>) -> String {
    if output.timed_out {
        let secs = timeout.map(|t| t.as_secs()).unwrap_or_default();
        format!("timed out after {}s", secs)
    } else {
        output.error_text()
    }
}
