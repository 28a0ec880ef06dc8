use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::validation;

/// Git hosting providers the bot knows how to authenticate against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Provider {
    Github,
    Gitlab,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Github => "GITHUB",
            Provider::Gitlab => "GITLAB",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Github => "GitHub",
            Provider::Gitlab => "GitLab",
        }
    }

    /// Environment variable operators set to give the bot access.
    pub fn token_env_var(&self) -> &'static str {
        match self {
            Provider::Github => "GITHUB_TOKEN",
            Provider::Gitlab => "GITLAB_TOKEN",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(Provider::Github),
            "gitlab" => Ok(Provider::Gitlab),
            other => Err(Error::validation_invalid_argument(
                "provider",
                format!("Unknown provider '{}'", other),
                None,
                Some(vec!["github".to_string(), "gitlab".to_string()]),
            )),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monitoring rule for one branch of one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchConfig {
    pub branch: String,
    pub discord_channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl BranchConfig {
    /// Environment label passed to build/deploy commands.
    pub fn environment_label(&self) -> &str {
        self.environment
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or(&self.branch)
    }

    /// Channel for pull-request notices, falling back to the deployment channel.
    pub fn pull_request_channel(&self) -> &str {
        self.pr_channel_id
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(&self.discord_channel_id)
    }

    pub fn validate(&self) -> Result<()> {
        validation::require_branch_name(&self.branch)?;
        validation::require_non_empty(
            &self.discord_channel_id,
            "channel",
            "Deployment channel id cannot be empty",
        )?;
        Ok(())
    }
}

/// Ordered branch rules of a repository. Branch names are unique: writes go
/// through [`BranchList::upsert`], which replaces an existing entry in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchList(Vec<BranchConfig>);

impl BranchList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build from stored entries, rejecting duplicates and invalid rules.
    pub fn from_entries(entries: Vec<BranchConfig>) -> Result<Self> {
        let mut list = Self::new();
        for entry in entries {
            if list.find(&entry.branch).is_some() {
                return Err(Error::validation_invalid_argument(
                    "branches",
                    format!("Duplicate branch config '{}'", entry.branch),
                    None,
                    None,
                ));
            }
            entry.validate()?;
            list.0.push(entry);
        }
        Ok(list)
    }

    pub fn find(&self, branch: &str) -> Option<&BranchConfig> {
        self.0.iter().find(|b| b.branch == branch)
    }

    /// Replace the rule with the same branch name, or append. Returns true
    /// when an existing rule was replaced.
    pub fn upsert(&mut self, config: BranchConfig) -> Result<bool> {
        config.validate()?;
        match self.0.iter_mut().find(|b| b.branch == config.branch) {
            Some(existing) => {
                *existing = config;
                Ok(true)
            }
            None => {
                self.0.push(config);
                Ok(false)
            }
        }
    }

    pub fn remove(&mut self, branch: &str) -> Option<BranchConfig> {
        let idx = self.0.iter().position(|b| b.branch == branch)?;
        Some(self.0.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &BranchConfig> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub git_url: String,
    pub provider: Provider,
    pub is_active: bool,
    pub branches: BranchList,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    pub fn branch(&self, branch: &str) -> Option<&BranchConfig> {
        self.branches.find(branch)
    }

    /// Whether a webhook naming `repository` refers to this repository:
    /// exact display-name match, or the name appears in the clone URL.
    pub fn matches_event_name(&self, repository: &str) -> bool {
        !repository.is_empty() && (self.name == repository || self.git_url.contains(repository))
    }
}

/// Input for creating a repository record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRepository {
    pub name: String,
    pub git_url: String,
    pub provider: Provider,
}

impl NewRepository {
    pub fn validate(&self) -> Result<()> {
        validation::require_non_empty(&self.name, "name", "Repository name cannot be empty")?;
        validation::require_remote_url(&self.git_url)?;
        Ok(())
    }
}
