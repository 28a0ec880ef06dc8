//! Human-facing reports of pipeline outcomes and pull-request activity.
//!
//! Sinks are best-effort: every failure is logged inside the sink and never
//! returned to the pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::blocking::Client;
use serde_json::{json, Value};

use crate::config::{BotConfig, NotificationLimits};
use crate::deployment::{CommitInfo, DeploymentStatus};
use crate::error::{Error, Result};
use crate::events::PullRequestAction;
use crate::utils::parser::{short_sha, truncate_chars};

const COLOR_SUCCESS: u32 = 0x00ff00;
const COLOR_FAILURE: u32 = 0xff0000;
const COLOR_OPENED: u32 = 0x00aaff;
const COLOR_UPDATED: u32 = 0x0099ff;
const COLOR_CLOSED: u32 = 0xff9900;

const PR_BODY_CHARS: usize = 500;
const MISSING_PERMISSIONS: i64 = 50013;

/// Terminal outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentNotice {
    pub channel_id: String,
    pub deployment_id: String,
    pub repository: String,
    pub branch: String,
    pub environment: String,
    pub commit: CommitInfo,
    /// `Success` or `Failed`.
    pub status: DeploymentStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestNotice {
    pub channel_id: String,
    pub repository: String,
    pub action: PullRequestAction,
    pub number: u64,
    pub title: String,
    pub body: String,
    pub url: String,
    pub base_branch: String,
    pub head_branch: String,
    pub author: String,
    pub merged: bool,
}

pub trait NotificationSink: Send + Sync {
    fn deployment_finished(&self, notice: &DeploymentNotice);
    fn pull_request(&self, notice: &PullRequestNotice);
}

/// Sink for the configured environment: Discord when a bot token is set,
/// the log otherwise.
pub fn from_config(config: &BotConfig) -> Arc<dyn NotificationSink> {
    let token = config.discord.bot_token.as_deref();
    match token.map(|t| DiscordNotifier::new(&config.discord.api_base, t, config.notifications)) {
        Some(Ok(discord)) => Arc::new(discord),
        Some(Err(e)) => {
            tracing::error!(error = %e, "Discord client unavailable; notifications go to the log");
            Arc::new(TracingNotifier)
        }
        None => {
            tracing::info!("DISCORD_BOT_TOKEN not set; notifications go to the log");
            Arc::new(TracingNotifier)
        }
    }
}

// =============================================================================
// Discord
// =============================================================================

pub struct DiscordNotifier {
    client: Client,
    api_base: String,
    token: String,
    limits: NotificationLimits,
}

impl DiscordNotifier {
    pub fn new(api_base: &str, token: &str, limits: NotificationLimits) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::internal_unexpected(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            limits,
        })
    }

    fn send(&self, channel_id: &str, embed: Value) -> Result<()> {
        let url = format!("{}/channels/{}/messages", self.api_base, channel_id);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bot {}", self.token))
            .json(&json!({ "embeds": [embed] }))
            .send()
            .map_err(|e| Error::notification_failed(channel_id, None, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().unwrap_or_default();
        let code = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("code").and_then(Value::as_i64));

        let err = Error::notification_failed(channel_id, Some(status.as_u16()), body);
        if status.as_u16() == 403 || code == Some(MISSING_PERMISSIONS) {
            Err(err.with_hint(format!(
                "The bot needs Send Messages and Embed Links permissions in channel {}",
                channel_id
            )))
        } else {
            Err(err)
        }
    }

    fn deliver(&self, channel_id: &str, embed: Value, what: &str) {
        if let Err(e) = self.send(channel_id, embed) {
            match e.hints.first() {
                Some(hint) => tracing::error!(channel = channel_id, "{}: {}", what, hint.message),
                None => tracing::error!(channel = channel_id, error = %e, "{} failed", what),
            }
        }
    }
}

impl NotificationSink for DiscordNotifier {
    fn deployment_finished(&self, notice: &DeploymentNotice) {
        let embed = deployment_embed(notice, &self.limits);
        self.deliver(&notice.channel_id, embed, "Deployment notice");
    }

    fn pull_request(&self, notice: &PullRequestNotice) {
        let embed = pull_request_embed(notice);
        self.deliver(&notice.channel_id, embed, "Pull request notice");
    }
}

/// Discord embed for a finished deployment.
pub fn deployment_embed(notice: &DeploymentNotice, limits: &NotificationLimits) -> Value {
    let succeeded = notice.status == DeploymentStatus::Success;
    let (title, color) = if succeeded {
        ("✅ Deployment Succeeded", COLOR_SUCCESS)
    } else {
        ("❌ Deployment Failed", COLOR_FAILURE)
    };

    let mut fields = vec![
        field("📦 Repository", &notice.repository, true),
        field("🌿 Branch", &notice.branch, true),
        field("🌍 Environment", &notice.environment, true),
        field("💬 Commit", &format!("`{}`", short_sha(&notice.commit.id)), true),
        field("👤 Author", &notice.commit.author.name, true),
        field(
            "📝 Message",
            &truncate_chars(&notice.commit.message, limits.commit_message_chars, "..."),
            false,
        ),
    ];

    if let Some(error) = notice.error.as_deref().filter(|e| !e.is_empty()) {
        fields.push(field(
            "❌ Error",
            &format!("```{}```", truncate_chars(error, limits.error_chars, "")),
            false,
        ));
    }

    json!({
        "title": title,
        "description": format!("**{}** → `{}`", notice.repository, notice.branch),
        "color": color,
        "fields": fields,
        "footer": { "text": format!("Deployment {}", notice.deployment_id) },
        "timestamp": Utc::now().to_rfc3339(),
    })
}

/// Discord embed for pull-request activity.
pub fn pull_request_embed(notice: &PullRequestNotice) -> Value {
    let (title, color) = match notice.action {
        PullRequestAction::Opened => ("🆕 New Pull Request", COLOR_OPENED),
        PullRequestAction::Reopened => ("🔄 Pull Request Reopened", COLOR_OPENED),
        PullRequestAction::Synchronize => ("🔄 Pull Request Updated", COLOR_UPDATED),
        PullRequestAction::Merged => ("✅ Pull Request Merged", COLOR_SUCCESS),
        PullRequestAction::Closed if notice.merged => ("✅ Pull Request Merged", COLOR_SUCCESS),
        PullRequestAction::Closed => ("❌ Pull Request Closed", COLOR_CLOSED),
        PullRequestAction::Other => ("📝 Pull Request", COLOR_UPDATED),
    };

    let state = if notice.merged || notice.action == PullRequestAction::Merged {
        "✅ Merged"
    } else if notice.action == PullRequestAction::Closed {
        "🔴 Closed"
    } else {
        "🟢 Open"
    };

    let mut fields = vec![
        field("📦 Repository", &notice.repository, true),
        field("🔢 PR", &format!("#{}", notice.number), true),
        field(
            "🌿 Branches",
            &format!("`{}` → `{}`", notice.head_branch, notice.base_branch),
            true,
        ),
        field("👤 Author", &notice.author, true),
        field("📊 State", state, true),
    ];
    if !notice.body.trim().is_empty() {
        fields.push(field(
            "📝 Description",
            &truncate_chars(&notice.body, PR_BODY_CHARS, "..."),
            false,
        ));
    }

    json!({
        "title": title,
        "description": format!("**{}**", notice.title),
        "url": notice.url,
        "color": color,
        "fields": fields,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

/// Discord rejects embeds with a blank field value.
const EMPTY_FIELD: &str = "-";

fn field(name: &str, value: &str, inline: bool) -> Value {
    let value = if value.trim().is_empty() { EMPTY_FIELD } else { value };
    json!({ "name": name, "value": value, "inline": inline })
}

// =============================================================================
// Log fallback
// =============================================================================

/// Writes notices to the log. Used when no chat token is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn deployment_finished(&self, notice: &DeploymentNotice) {
        match notice.status {
            DeploymentStatus::Success => tracing::info!(
                deployment_id = %notice.deployment_id,
                repository = %notice.repository,
                branch = %notice.branch,
                commit = %short_sha(&notice.commit.id),
                "Deployment succeeded"
            ),
            _ => tracing::error!(
                deployment_id = %notice.deployment_id,
                repository = %notice.repository,
                branch = %notice.branch,
                commit = %short_sha(&notice.commit.id),
                error = notice.error.as_deref().unwrap_or_default(),
                "Deployment failed"
            ),
        }
    }

    fn pull_request(&self, notice: &PullRequestNotice) {
        tracing::info!(
            repository = %notice.repository,
            number = notice.number,
            action = notice.action.as_str(),
            head = %notice.head_branch,
            base = %notice.base_branch,
            "Pull request {}",
            notice.title
        );
    }
}
