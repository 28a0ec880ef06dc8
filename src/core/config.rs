use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::paths;
use crate::repository::Provider;

/// Root configuration for deploybot.json, after environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_deploy_base_path")]
    pub deploy_base_path: PathBuf,

    /// `None` means the default database under the config directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitlab_token: Option<String>,

    #[serde(default)]
    pub discord: DiscordConfig,

    #[serde(default)]
    pub timeouts: StageTimeouts,

    #[serde(default)]
    pub notifications: NotificationLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,

    #[serde(default = "default_discord_api_base")]
    pub api_base: String,
}

/// Per-stage limits in seconds. Zero disables the limit for that stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimeouts {
    /// ls-remote, fetch and pull.
    #[serde(default = "default_remote_timeout")]
    pub remote: u64,

    #[serde(default = "default_clone_timeout")]
    pub clone: u64,

    #[serde(default = "default_command_timeout")]
    pub build: u64,

    #[serde(default = "default_command_timeout")]
    pub deploy: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationLimits {
    #[serde(default = "default_error_chars")]
    pub error_chars: usize,

    #[serde(default = "default_commit_message_chars")]
    pub commit_message_chars: usize,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            deploy_base_path: default_deploy_base_path(),
            database_path: None,
            github_token: None,
            gitlab_token: None,
            discord: DiscordConfig::default(),
            timeouts: StageTimeouts::default(),
            notifications: NotificationLimits::default(),
        }
    }
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: default_discord_api_base(),
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            remote: default_remote_timeout(),
            clone: default_clone_timeout(),
            build: default_command_timeout(),
            deploy: default_command_timeout(),
        }
    }
}

impl Default for NotificationLimits {
    fn default() -> Self {
        Self {
            error_chars: default_error_chars(),
            commit_message_chars: default_commit_message_chars(),
        }
    }
}

// =============================================================================
// Default value functions
// =============================================================================

fn default_deploy_base_path() -> PathBuf {
    PathBuf::from("/tmp/deployments")
}

fn default_discord_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_remote_timeout() -> u64 {
    120
}

fn default_clone_timeout() -> u64 {
    600
}

fn default_command_timeout() -> u64 {
    1800
}

fn default_error_chars() -> usize {
    1000
}

fn default_commit_message_chars() -> usize {
    100
}

impl StageTimeouts {
    pub fn remote(&self) -> Option<Duration> {
        as_limit(self.remote)
    }

    pub fn clone_limit(&self) -> Option<Duration> {
        as_limit(self.clone)
    }

    pub fn build(&self) -> Option<Duration> {
        as_limit(self.build)
    }

    pub fn deploy(&self) -> Option<Duration> {
        as_limit(self.deploy)
    }
}

fn as_limit(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl BotConfig {
    /// Token used to authenticate clones for `provider`, if configured.
    pub fn token_for(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::Github => self.github_token.as_deref(),
            Provider::Gitlab => self.gitlab_token.as_deref(),
        }
    }

    pub fn database(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => paths::default_database(),
        }
    }

    /// Overlay environment variables on top of file values.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = lookup("DEPLOY_BASE_PATH") {
            self.deploy_base_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("DEPLOYBOT_DATABASE") {
            self.database_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("GITHUB_TOKEN") {
            self.github_token = Some(value);
        }
        if let Some(value) = lookup("GITLAB_TOKEN") {
            self.gitlab_token = Some(value);
        }
        if let Some(value) = lookup("DISCORD_BOT_TOKEN") {
            self.discord.bot_token = Some(value);
        }
        if let Some(value) = lookup("DISCORD_API_BASE") {
            self.discord.api_base = value;
        }

        for (key, slot) in [
            ("DEPLOYBOT_REMOTE_TIMEOUT", &mut self.timeouts.remote),
            ("DEPLOYBOT_CLONE_TIMEOUT", &mut self.timeouts.clone),
            ("DEPLOYBOT_BUILD_TIMEOUT", &mut self.timeouts.build),
            ("DEPLOYBOT_DEPLOY_TIMEOUT", &mut self.timeouts.deploy),
        ] {
            if let Some(value) = lookup(key) {
                *slot = value.trim().parse().map_err(|_| {
                    Error::config_invalid_value(
                        key,
                        Some(value.clone()),
                        "expected a whole number of seconds",
                    )
                })?;
            }
        }

        Ok(())
    }

    fn expand_paths(&mut self) {
        self.deploy_base_path = expand(&self.deploy_base_path);
        self.database_path = self.database_path.as_ref().map(|p| expand(p));
    }

    fn normalize(&mut self) {
        for token in [
            &mut self.github_token,
            &mut self.gitlab_token,
            &mut self.discord.bot_token,
        ] {
            if token.as_deref().is_some_and(|t| t.trim().is_empty()) {
                *token = None;
            }
        }
        let trimmed = self.discord.api_base.trim_end_matches('/').to_string();
        self.discord.api_base = trimmed;
    }

    /// Copy safe to print: tokens keep only their last four characters.
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        copy.github_token = copy.github_token.as_deref().map(mask);
        copy.gitlab_token = copy.gitlab_token.as_deref().map(mask);
        copy.discord.bot_token = copy.discord.bot_token.as_deref().map(mask);
        copy
    }
}

fn expand(path: &std::path::Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

fn mask(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("***{}", tail)
}

// =============================================================================
// Loading functions
// =============================================================================

/// Load deploybot.json (missing file means built-in defaults), then apply
/// the process environment.
pub fn load() -> Result<BotConfig> {
    let mut config = load_file()?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config.normalize();
    config.expand_paths();
    Ok(config)
}

fn load_file() -> Result<BotConfig> {
    let path = paths::deploybot_json()?;

    if !path.exists() {
        return Ok(BotConfig::default());
    }

    let content = fs::read_to_string(&path).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("read {}", path.display())))
    })?;

    parse(&content, &path.display().to_string())
}

fn parse(content: &str, origin: &str) -> Result<BotConfig> {
    serde_json::from_str(content).map_err(|e| Error::config_invalid_json(origin, e))
}

/// Get the path to deploybot.json (for display purposes)
pub fn config_path() -> Result<String> {
    Ok(paths::deploybot_json()?.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = BotConfig::default();
        assert_eq!(config.deploy_base_path, PathBuf::from("/tmp/deployments"));
        assert_eq!(config.discord.api_base, "https://discord.com/api/v10");
        assert_eq!(config.timeouts.remote, 120);
        assert_eq!(config.timeouts.clone, 600);
        assert_eq!(config.notifications.error_chars, 1000);
        assert_eq!(config.notifications.commit_message_chars, 100);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let config = parse(
            r#"{"deploy_base_path": "/srv/apps", "timeouts": {"build": 60}}"#,
            "test",
        )
        .unwrap();
        assert_eq!(config.deploy_base_path, PathBuf::from("/srv/apps"));
        assert_eq!(config.timeouts.build, 60);
        assert_eq!(config.timeouts.deploy, 1800);
    }

    #[test]
    fn invalid_file_is_config_error() {
        let err = parse("{not json", "deploybot.json").unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::ConfigInvalidJson);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = BotConfig::default();
        config.github_token = Some("from-file".to_string());
        config
            .apply_env(env(&[
                ("DEPLOY_BASE_PATH", "/var/deploy"),
                ("GITHUB_TOKEN", "ghp_env"),
                ("GITLAB_TOKEN", "   "),
                ("DEPLOYBOT_BUILD_TIMEOUT", "0"),
            ]))
            .unwrap();

        assert_eq!(config.deploy_base_path, PathBuf::from("/var/deploy"));
        assert_eq!(config.token_for(Provider::Github), Some("ghp_env"));
        assert_eq!(config.token_for(Provider::Gitlab), None);
        assert_eq!(config.timeouts.build(), None);
        assert_eq!(config.timeouts.remote(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn non_numeric_timeout_is_rejected() {
        let mut config = BotConfig::default();
        let err = config
            .apply_env(env(&[("DEPLOYBOT_CLONE_TIMEOUT", "ten")]))
            .unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::ConfigInvalidValue);
        assert_eq!(err.details["key"], "DEPLOYBOT_CLONE_TIMEOUT");
    }

    #[test]
    fn masked_hides_tokens() {
        let mut config = BotConfig::default();
        config.github_token = Some("ghp_abcdefghijkl".to_string());
        config.discord.bot_token = Some("short".to_string());

        let masked = config.masked();
        assert_eq!(masked.github_token.as_deref(), Some("***ijkl"));
        assert_eq!(masked.discord.bot_token.as_deref(), Some("***"));
        assert_eq!(config.github_token.as_deref(), Some("ghp_abcdefghijkl"));
    }

    #[test]
    fn blank_tokens_normalize_to_none() {
        let mut config = BotConfig::default();
        config.discord.bot_token = Some(" ".to_string());
        config.discord.api_base = "http://localhost:9000/".to_string();
        config.normalize();
        assert!(config.discord.bot_token.is_none());
        assert_eq!(config.discord.api_base, "http://localhost:9000");
    }
}
