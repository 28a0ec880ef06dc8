use std::collections::BTreeSet;

use crate::error::{Error, Result};

use super::{remote_error, AuthenticatedRemote, Git};

/// Read-only check that a branch exists on the remote. Runs before anything
/// touches the checkout directory.
#[derive(Debug, Clone, Copy)]
pub struct RemoteBranchVerifier {
    git: Git,
}

impl RemoteBranchVerifier {
    pub fn new(git: Git) -> Self {
        Self { git }
    }

    /// Branch names advertised by the remote, sorted.
    pub fn list(&self, remote: &AuthenticatedRemote) -> Result<BTreeSet<String>> {
        let timeout = self.git.remote_timeout();
        let output = self
            .git
            .run(None, &["ls-remote", "--heads", remote.url()], timeout)?;

        if !output.success {
            return Err(remote_error(
                remote.provider(),
                &remote.redacted(),
                &output,
                timeout,
            ));
        }

        let branches = parse_heads(&output.stdout);
        if branches.is_empty() {
            return Err(Error::remote_unreachable(
                remote.redacted(),
                "the remote advertised no branches",
            ));
        }
        Ok(branches)
    }

    /// Fails with `remote.branch_not_found` carrying every remote branch
    /// when `branch` is absent.
    pub fn verify(&self, remote: &AuthenticatedRemote, branch: &str) -> Result<BTreeSet<String>> {
        let branches = self.list(remote)?;
        if !branches.contains(branch) {
            return Err(Error::remote_branch_not_found(
                branch,
                branches.into_iter().collect(),
            ));
        }
        Ok(branches)
    }
}

/// Parse `<sha>\trefs/heads/<name>` lines; anything else is skipped.
fn parse_heads(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let (sha, reference) = line.split_once('\t')?;
            if sha.trim().is_empty() {
                return None;
            }
            reference
                .trim()
                .strip_prefix("refs/heads/")
                .filter(|name| !name.is_empty())
                .map(str::to_string)
        })
        .collect()
}
