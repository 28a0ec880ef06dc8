//! Canonical webhook events, as produced by the provider-specific ingress.

use serde::{Deserialize, Serialize};

use crate::deployment::CommitInfo;
use crate::repository::Provider;

const BRANCH_REF_PREFIX: &str = "refs/heads/";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEvent {
    pub provider: Provider,
    /// Repository name as the provider reports it.
    pub repository: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub commits: Vec<CommitInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_commit: Option<CommitInfo>,
}

impl PushEvent {
    /// Pushed branch name. Refs outside `refs/heads/` are returned as is.
    pub fn branch(&self) -> &str {
        self.git_ref
            .strip_prefix(BRANCH_REF_PREFIX)
            .unwrap_or(&self.git_ref)
    }

    /// Head commit, falling back to the first listed commit.
    pub fn commit(&self) -> Option<&CommitInfo> {
        self.head_commit.as_ref().or_else(|| self.commits.first())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestAction {
    Opened,
    Reopened,
    Synchronize,
    Closed,
    Merged,
    /// Any action the bot does not report (labels, review requests, ...).
    #[serde(other)]
    Other,
}

impl PullRequestAction {
    pub fn is_relevant(&self) -> bool {
        !matches!(self, PullRequestAction::Other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PullRequestAction::Opened => "opened",
            PullRequestAction::Reopened => "reopened",
            PullRequestAction::Synchronize => "synchronize",
            PullRequestAction::Closed => "closed",
            PullRequestAction::Merged => "merged",
            PullRequestAction::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestEvent {
    pub provider: Provider,
    pub repository: String,
    pub action: PullRequestAction,
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub url: String,
    pub base_branch: String,
    pub head_branch: String,
    pub author: String,
    #[serde(default)]
    pub merged: bool,
}
