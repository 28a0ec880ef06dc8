use clap::{Args, Subcommand};
use serde::Serialize;

use deploybot::config::{self, BotConfig};

use super::CmdResult;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Display the effective configuration (file + environment), tokens masked
    Show,
    /// Show the path to deploybot.json
    Path,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOutput {
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<BotConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exists: Option<bool>,
}

pub fn run(args: ConfigArgs, _global: &crate::commands::GlobalArgs) -> CmdResult<ConfigOutput> {
    match args.command {
        ConfigCommand::Show => show(),
        ConfigCommand::Path => path(),
    }
}

fn show() -> CmdResult<ConfigOutput> {
    let config = config::load()?;
    let database = config.database()?.display().to_string();

    Ok((
        ConfigOutput {
            command: "config.show".to_string(),
            config: Some(config.masked()),
            database: Some(database),
            path: None,
            exists: None,
        },
        0,
    ))
}

fn path() -> CmdResult<ConfigOutput> {
    let path = config::config_path()?;
    let exists = std::path::Path::new(&path).exists();

    Ok((
        ConfigOutput {
            command: "config.path".to_string(),
            config: None,
            database: None,
            path: Some(path),
            exists: Some(exists),
        },
        0,
    ))
}
