use serde::de::DeserializeOwned;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use deploybot::config::BotConfig;
use deploybot::dispatch::Dispatcher;
use deploybot::notify;
use deploybot::pipeline::DeploymentPipeline;
use deploybot::store::SqliteStore;

pub type CmdResult<T> = deploybot::Result<(T, i32)>;

pub(crate) struct GlobalArgs {}

// ============================================================================
// Runtime context (CLI layer)
// ============================================================================

/// Loaded configuration plus the record store every command works against.
pub(crate) struct Context {
    pub config: BotConfig,
    pub store: Arc<SqliteStore>,
}

impl Context {
    pub fn load() -> deploybot::Result<Self> {
        let config = deploybot::config::load()?;
        let store = SqliteStore::open(&config.database()?)?;
        Ok(Self {
            config,
            store: Arc::new(store),
        })
    }

    pub fn pipeline(&self) -> Arc<DeploymentPipeline> {
        Arc::new(DeploymentPipeline::from_config(
            &self.config,
            self.store.clone(),
            notify::from_config(&self.config),
        ))
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.store.clone(),
            self.store.clone(),
            notify::from_config(&self.config),
            self.pipeline(),
        )
    }

    pub fn repository(&self, name: &str) -> deploybot::Result<deploybot::Repository> {
        use deploybot::store::RepositoryStore;

        self.store
            .find_repository_by_name(name)?
            .ok_or_else(|| deploybot::Error::repository_not_found(name))
    }
}

// ============================================================================
// JSON Input Parsing (CLI layer)
// ============================================================================

/// Read JSON spec from string, file (@path), or stdin (-).
fn read_json_spec_to_string(spec: &str) -> deploybot::Result<String> {
    use std::io::IsTerminal;

    if spec.trim() == "-" {
        let mut buf = String::new();
        let mut stdin = std::io::stdin();
        if stdin.is_terminal() {
            return Err(deploybot::Error::validation_invalid_argument(
                "json",
                "Cannot read JSON from stdin when stdin is a TTY",
                None,
                None,
            ));
        }
        stdin.read_to_string(&mut buf).map_err(|e| {
            deploybot::Error::internal_io(e.to_string(), Some("read stdin".to_string()))
        })?;
        return Ok(buf);
    }

    if let Some(path) = spec.strip_prefix('@') {
        if path.trim().is_empty() {
            return Err(deploybot::Error::validation_invalid_argument(
                "json",
                "Invalid JSON spec '@' (missing file path)",
                None,
                None,
            ));
        }
        return std::fs::read_to_string(Path::new(path)).map_err(|e| {
            deploybot::Error::internal_io(e.to_string(), Some(format!("read {}", path)))
        });
    }

    Ok(spec.to_string())
}

/// Parse a JSON spec (inline, @file or -) into `T`.
pub fn parse_json_spec<T: DeserializeOwned>(spec: &str, what: &str) -> deploybot::Result<T> {
    let raw = read_json_spec_to_string(spec)?;
    serde_json::from_str(&raw)
        .map_err(|e| deploybot::Error::validation_invalid_json(e, Some(format!("parse {}", what))))
}

pub mod branch;
pub mod config;
pub mod deployment;
pub mod event;
pub mod repo;

/// Dispatch a command to its handler and map result to JSON.
macro_rules! dispatch {
    ($args:expr, $global:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args, $global))
    };
}

pub(crate) fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (deploybot::Result<serde_json::Value>, i32) {
    match command {
        crate::Commands::Repo(args) => dispatch!(args, global, repo),
        crate::Commands::Branch(args) => dispatch!(args, global, branch),
        crate::Commands::Event(args) => dispatch!(args, global, event),
        crate::Commands::Deployment(args) => dispatch!(args, global, deployment),
        crate::Commands::Config(args) => dispatch!(args, global, config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deploybot::ErrorCode;

    #[test]
    fn inline_spec_is_returned_as_is() {
        assert_eq!(read_json_spec_to_string("{\"a\":1}").unwrap(), "{\"a\":1}");
    }

    #[test]
    fn at_prefix_reads_the_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("event.json");
        std::fs::write(&path, "{\"number\": 3}").unwrap();

        let value: serde_json::Value =
            parse_json_spec(&format!("@{}", path.display()), "event").unwrap();
        assert_eq!(value["number"], 3);
    }

    #[test]
    fn bare_at_is_rejected() {
        let err = read_json_spec_to_string("@ ").unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationInvalidArgument);
    }

    #[test]
    fn malformed_json_is_a_validation_error() {
        let err = parse_json_spec::<serde_json::Value>("{nope", "event").unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationInvalidJson);
    }
}
