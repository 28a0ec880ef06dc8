use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// `PENDING → BUILDING → DEPLOYING → SUCCESS`, with `FAILED` reachable from
/// every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Deploying,
    Success,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "PENDING",
            DeploymentStatus::Building => "BUILDING",
            DeploymentStatus::Deploying => "DEPLOYING",
            DeploymentStatus::Success => "SUCCESS",
            DeploymentStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "PENDING" => Ok(DeploymentStatus::Pending),
            "BUILDING" => Ok(DeploymentStatus::Building),
            "DEPLOYING" => Ok(DeploymentStatus::Deploying),
            "SUCCESS" => Ok(DeploymentStatus::Success),
            "FAILED" => Ok(DeploymentStatus::Failed),
            other => Err(Error::internal_unexpected(format!(
                "Unknown deployment status '{}'",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Success | DeploymentStatus::Failed)
    }

    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Pending, Building)
                | (Building, Deploying)
                | (Deploying, Success)
                | (Pending | Building | Deploying, Failed)
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitAuthor {
    pub name: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub id: String,
    #[serde(default)]
    pub message: String,
    pub author: CommitAuthor,
}

/// One pipeline execution for a (repository, branch, commit) triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub repository_id: String,
    pub branch: String,
    pub commit: String,
    pub commit_message: String,
    pub author: String,
    pub status: DeploymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_log: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy_log: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields for a new PENDING deployment.
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub repository_id: String,
    pub branch: String,
    pub commit: String,
    pub commit_message: String,
    pub author: String,
}

impl NewDeployment {
    pub fn for_commit(repository_id: &str, branch: &str, commit: &CommitInfo) -> Self {
        Self {
            repository_id: repository_id.to_string(),
            branch: branch.to_string(),
            commit: commit.id.clone(),
            commit_message: commit.message.clone(),
            author: commit.author.name.clone(),
        }
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentUpdate {
    pub status: Option<DeploymentStatus>,
    pub build_log: Option<String>,
    pub deploy_log: Option<String>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeploymentUpdate {
    pub fn status(status: DeploymentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_build_log(mut self, log: impl Into<String>) -> Self {
        self.build_log = Some(log.into());
        self
    }

    pub fn with_deploy_log(mut self, log: impl Into<String>) -> Self {
        self.deploy_log = Some(log.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn completed_now(mut self) -> Self {
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
