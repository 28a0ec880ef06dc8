use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::repository::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigInvalidJson,
    ConfigInvalidValue,

    ValidationInvalidArgument,
    ValidationInvalidJson,

    RepositoryNotFound,
    RepositoryNameTaken,
    BranchNotConfigured,
    DeploymentNotFound,
    DeploymentInvalidTransition,

    RemoteUnreachable,
    RemoteBranchNotFound,
    RemoteAuthFailed,
    RemoteRepoNotFound,

    GitCloneFailed,
    GitFetchFailed,
    GitReconcileFailed,
    GitCommandFailed,

    CommandFailed,
    CommandTimeout,

    NotificationFailed,

    InternalIoError,
    InternalJsonError,
    InternalDatabaseError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigInvalidJson => "config.invalid_json",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",

            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",
            ErrorCode::ValidationInvalidJson => "validation.invalid_json",

            ErrorCode::RepositoryNotFound => "repository.not_found",
            ErrorCode::RepositoryNameTaken => "repository.name_taken",
            ErrorCode::BranchNotConfigured => "branch.not_configured",
            ErrorCode::DeploymentNotFound => "deployment.not_found",
            ErrorCode::DeploymentInvalidTransition => "deployment.invalid_transition",

            ErrorCode::RemoteUnreachable => "remote.unreachable",
            ErrorCode::RemoteBranchNotFound => "remote.branch_not_found",
            ErrorCode::RemoteAuthFailed => "remote.auth_failed",
            ErrorCode::RemoteRepoNotFound => "remote.repo_not_found",

            ErrorCode::GitCloneFailed => "git.clone_failed",
            ErrorCode::GitFetchFailed => "git.fetch_failed",
            ErrorCode::GitReconcileFailed => "git.reconcile_failed",
            ErrorCode::GitCommandFailed => "git.command_failed",

            ErrorCode::CommandFailed => "command.failed",
            ErrorCode::CommandTimeout => "command.timeout",

            ErrorCode::NotificationFailed => "notification.failed",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalDatabaseError => "internal.database_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotFoundDetails {
    pub id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tried: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchNotFoundDetails {
    pub branch: String,
    pub available: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFailureDetails {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitFailureDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub operation: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFailedDetails {
    pub stage: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub output: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidTransitionDetails {
    pub id: String,
    pub from: String,
    pub to: String,
}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
        }
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        id: Option<String>,
        tried: Option<Vec<String>>,
    ) -> Self {
        let problem = problem.into();
        let details = to_details(InvalidArgumentDetails {
            field: field.into(),
            problem: problem.clone(),
            id,
            tried,
        });

        Self::new(
            ErrorCode::ValidationInvalidArgument,
            format!("Invalid argument: {}", problem),
            details,
        )
    }

    pub fn validation_invalid_json(err: serde_json::Error, context: Option<String>) -> Self {
        let details = serde_json::json!({
            "error": err.to_string(),
            "context": context,
        });

        Self::new(ErrorCode::ValidationInvalidJson, "Invalid JSON", details)
    }

    pub fn config_invalid_json(path: impl Into<String>, err: serde_json::Error) -> Self {
        Self::new(
            ErrorCode::ConfigInvalidJson,
            "Invalid JSON in configuration",
            serde_json::json!({ "path": path.into(), "error": err.to_string() }),
        )
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        let key = key.into();
        let problem = problem.into();
        let message = format!("Invalid configuration value for '{}': {}", key, problem);
        let details = to_details(ConfigInvalidValueDetails {
            key,
            value,
            problem,
        });

        Self::new(ErrorCode::ConfigInvalidValue, message, details)
    }

    pub fn repository_not_found(name: impl Into<String>) -> Self {
        Self::not_found(ErrorCode::RepositoryNotFound, "Repository not found", name)
            .with_hint("Run 'deploybot repo list' to see monitored repositories")
    }

    pub fn repository_name_taken(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            ErrorCode::RepositoryNameTaken,
            format!("Repository '{}' already exists", name),
            to_details(NotFoundDetails { id: name.clone() }),
        )
        .with_hint(format!(
            "Run 'deploybot repo remove {}' first or pick another name",
            name
        ))
    }

    pub fn branch_not_configured(repository: impl Into<String>, branch: impl Into<String>) -> Self {
        let repository = repository.into();
        let branch = branch.into();
        Self::new(
            ErrorCode::BranchNotConfigured,
            format!(
                "Branch '{}' is not configured for repository '{}'",
                branch, repository
            ),
            serde_json::json!({ "repository": repository, "branch": branch }),
        )
        .with_hint(format!(
            "Run 'deploybot branch set {} {} --channel <id>'",
            repository, branch
        ))
    }

    pub fn deployment_not_found(id: impl Into<String>) -> Self {
        Self::not_found(ErrorCode::DeploymentNotFound, "Deployment not found", id)
    }

    fn not_found(code: ErrorCode, message: &str, id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(
            code,
            format!("{}: {}", message, id),
            to_details(NotFoundDetails { id }),
        )
    }

    pub fn deployment_invalid_transition(
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        let details = InvalidTransitionDetails {
            id: id.into(),
            from: from.into(),
            to: to.into(),
        };
        Self::new(
            ErrorCode::DeploymentInvalidTransition,
            format!(
                "Deployment {} cannot move from {} to {}",
                details.id, details.from, details.to
            ),
            to_details(details),
        )
    }

    pub fn remote_unreachable(url: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            ErrorCode::RemoteUnreachable,
            format!("Could not list branches of the remote repository: {}", reason),
            to_details(RemoteFailureDetails {
                url: url.into(),
                provider: None,
                error: reason,
            }),
        )
        .with_hint("Check network access to the git host and that the repository is reachable")
        .retryable(true)
    }

    pub fn remote_branch_not_found(branch: impl Into<String>, available: Vec<String>) -> Self {
        let branch = branch.into();
        let listed = if available.is_empty() {
            "(none)".to_string()
        } else {
            available.join(", ")
        };
        Self::new(
            ErrorCode::RemoteBranchNotFound,
            format!(
                "Branch '{}' does not exist on the remote repository. Available branches: {}",
                branch, listed
            ),
            to_details(BranchNotFoundDetails { branch, available }),
        )
    }

    pub fn remote_auth_failed(provider: Provider, url: impl Into<String>, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::new(
            ErrorCode::RemoteAuthFailed,
            format!(
                "Authentication to the {} remote failed: {}",
                provider.display_name(),
                detail
            ),
            to_details(RemoteFailureDetails {
                url: url.into(),
                provider: Some(provider),
                error: detail,
            }),
        )
        .with_hint(format!(
            "Check that {} is set and grants read access to the repository",
            provider.token_env_var()
        ))
    }

    pub fn remote_repo_not_found(provider: Provider, url: impl Into<String>, detail: impl Into<String>) -> Self {
        let url = url.into();
        let detail = detail.into();
        Self::new(
            ErrorCode::RemoteRepoNotFound,
            format!(
                "The {} repository was not found or is not accessible: {}",
                provider.display_name(),
                detail
            ),
            to_details(RemoteFailureDetails {
                url: url.clone(),
                provider: Some(provider),
                error: detail,
            }),
        )
        .with_hint(format!("Verify the repository URL '{}'", url))
        .with_hint(format!(
            "Private repositories also need {} to be set",
            provider.token_env_var()
        ))
    }

    pub fn git_clone_failed(branch: impl Into<String>, detail: impl Into<String>) -> Self {
        let branch = branch.into();
        let detail = detail.into();
        Self::new(
            ErrorCode::GitCloneFailed,
            format!("Cloning branch '{}' failed: {}", branch, detail),
            to_details(GitFailureDetails {
                branch: Some(branch),
                operation: "clone".to_string(),
                error: detail,
            }),
        )
    }

    pub fn git_fetch_failed(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::new(
            ErrorCode::GitFetchFailed,
            format!("Fetching from origin failed: {}", detail),
            to_details(GitFailureDetails {
                branch: None,
                operation: "fetch".to_string(),
                error: detail,
            }),
        )
        .retryable(true)
    }

    pub fn git_reconcile_failed(
        branch: impl Into<String>,
        operation: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        let branch = branch.into();
        let operation = operation.into();
        let detail = detail.into();
        Self::new(
            ErrorCode::GitReconcileFailed,
            format!("Updating branch '{}' failed ({}): {}", branch, operation, detail),
            to_details(GitFailureDetails {
                branch: Some(branch),
                operation,
                error: detail,
            }),
        )
    }

    pub fn git_command_failed(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::GitCommandFailed,
            message,
            Value::Object(serde_json::Map::new()),
        )
    }

    pub fn command_failed(
        stage: impl Into<String>,
        command: impl Into<String>,
        exit_code: Option<i32>,
        output: impl Into<String>,
    ) -> Self {
        let stage = stage.into();
        let output = output.into();
        let status = match exit_code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        };
        let message = if output.trim().is_empty() {
            format!("{} command failed ({})", capitalize(&stage), status)
        } else {
            format!(
                "{} command failed ({}):\n{}",
                capitalize(&stage),
                status,
                output.trim_end()
            )
        };

        Self::new(
            ErrorCode::CommandFailed,
            message,
            to_details(CommandFailedDetails {
                stage,
                command: command.into(),
                exit_code,
                timeout_secs: None,
                output,
            }),
        )
    }

    pub fn command_timeout(
        stage: impl Into<String>,
        command: impl Into<String>,
        timeout_secs: u64,
        output: impl Into<String>,
    ) -> Self {
        let stage = stage.into();
        let output = output.into();
        let mut message = format!(
            "{} command timed out after {}s",
            capitalize(&stage),
            timeout_secs
        );
        if !output.trim().is_empty() {
            message.push_str(":\n");
            message.push_str(output.trim_end());
        }

        Self::new(
            ErrorCode::CommandTimeout,
            message,
            to_details(CommandFailedDetails {
                stage,
                command: command.into(),
                exit_code: None,
                timeout_secs: Some(timeout_secs),
                output,
            }),
        )
    }

    pub fn notification_failed(
        channel_id: impl Into<String>,
        status: Option<u16>,
        detail: impl Into<String>,
    ) -> Self {
        let channel_id = channel_id.into();
        let detail = detail.into();
        Self::new(
            ErrorCode::NotificationFailed,
            format!("Sending notification to channel {} failed: {}", channel_id, detail),
            serde_json::json!({ "channelId": channel_id, "status": status, "error": detail }),
        )
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        let error = error.into();
        Self::new(
            ErrorCode::InternalIoError,
            format!("IO error: {}", error),
            to_details(InternalErrorDetails { error, context }),
        )
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        let error = error.into();
        Self::new(
            ErrorCode::InternalJsonError,
            format!("JSON error: {}", error),
            to_details(InternalErrorDetails { error, context }),
        )
    }

    pub fn internal_database(error: impl Into<String>, context: Option<String>) -> Self {
        let error = error.into();
        Self::new(
            ErrorCode::InternalDatabaseError,
            format!("Database error: {}", error),
            to_details(InternalErrorDetails { error, context }),
        )
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        let error = error.into();
        Self::new(
            ErrorCode::InternalUnexpected,
            format!("Unexpected error: {}", error),
            serde_json::json!({ "error": error }),
        )
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    /// Message followed by hints, one per line. This is what gets stored on a
    /// failed deployment and shown to operators.
    pub fn report(&self) -> String {
        let mut text = self.message.clone();
        for hint in &self.hints {
            text.push_str("\nHint: ");
            text.push_str(&hint.message);
        }
        text
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::internal_database(err.to_string(), None)
    }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_not_found_lists_available_branches_in_message() {
        let err = Error::remote_branch_not_found(
            "staging",
            vec!["develop".to_string(), "main".to_string()],
        );
        assert_eq!(err.code, ErrorCode::RemoteBranchNotFound);
        assert!(err
            .message
            .contains("Available branches: develop, main"));
        assert_eq!(err.details["available"], serde_json::json!(["develop", "main"]));
    }

    #[test]
    fn auth_failure_hint_names_provider_token() {
        let err = Error::remote_auth_failed(Provider::Gitlab, "https://gitlab.com/a/b.git", "denied");
        assert!(err.hints.iter().any(|h| h.message.contains("GITLAB_TOKEN")));

        let err = Error::remote_auth_failed(Provider::Github, "https://github.com/a/b.git", "denied");
        assert!(err.hints.iter().any(|h| h.message.contains("GITHUB_TOKEN")));
    }

    #[test]
    fn command_failed_message_keeps_output() {
        let err = Error::command_failed("build", "make", Some(2), "compiling\nerror: boom\n");
        assert_eq!(err.code, ErrorCode::CommandFailed);
        assert!(err.message.starts_with("Build command failed (exit code 2)"));
        assert!(err.message.contains("error: boom"));
        assert_eq!(err.details["output"], "compiling\nerror: boom\n");
    }

    #[test]
    fn report_appends_hints() {
        let err = Error::internal_unexpected("x").with_hint("try again");
        assert_eq!(err.report(), "Unexpected error: x\nHint: try again");
    }
}
