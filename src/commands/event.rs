use clap::{Args, Subcommand};
use serde::Serialize;

use deploybot::dispatch::{IgnoreReason, PullRequestOutcome, PushOutcome};
use deploybot::events::{PullRequestEvent, PushEvent};
use deploybot::log_status;
use deploybot::store::DeploymentStore;
use deploybot::{Deployment, DeploymentStatus, Error};

use super::{parse_json_spec, CmdResult, Context};

#[derive(Serialize)]
#[serde(tag = "command")]
pub enum EventOutput {
    #[serde(rename = "event.push")]
    Push(PushReport),
    #[serde(rename = "event.pull_request")]
    PullRequest(PullRequestOutcome),
}

#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PushReport {
    Ignored { reason: IgnoreReason },
    Deployed { deployment: Deployment },
}

#[derive(Args)]
pub struct EventArgs {
    #[command(subcommand)]
    command: EventCommand,
}

#[derive(Subcommand)]
enum EventCommand {
    /// Feed a push event and wait for the deployment it starts
    Push {
        /// Event JSON (inline, @file, or - for stdin)
        #[arg(long, value_name = "JSON")]
        json: String,
    },
    /// Feed a pull-request event
    PullRequest {
        /// Event JSON (inline, @file, or - for stdin)
        #[arg(long, value_name = "JSON")]
        json: String,
    },
}

pub fn run(args: EventArgs, _global: &crate::commands::GlobalArgs) -> CmdResult<EventOutput> {
    match args.command {
        EventCommand::Push { json } => {
            let event: PushEvent = parse_json_spec(&json, "push event")?;
            let (report, exit_code) = push(&Context::load()?, &event)?;
            Ok((EventOutput::Push(report), exit_code))
        }
        EventCommand::PullRequest { json } => {
            let event: PullRequestEvent = parse_json_spec(&json, "pull request event")?;
            let outcome = Context::load()?.dispatcher().handle_pull_request(&event)?;
            Ok((EventOutput::PullRequest(outcome), 0))
        }
    }
}

fn push(ctx: &Context, event: &PushEvent) -> CmdResult<PushReport> {
    let handle = match ctx.dispatcher().handle_push(event)? {
        PushOutcome::Ignored(reason) => return Ok((PushReport::Ignored { reason }, 0)),
        PushOutcome::Started(handle) => handle,
    };

    log_status!("deploy", "Waiting for deployment {}", handle.deployment_id);
    let deployment_id = handle.wait()?;
    let deployment = ctx
        .store
        .get_deployment(&deployment_id)?
        .ok_or_else(|| Error::deployment_not_found(&deployment_id))?;

    let exit_code = match deployment.status {
        DeploymentStatus::Success => 0,
        _ => 1,
    };
    log_status!("deploy", "Deployment {} {}", deployment.id, deployment.status.as_str());

    Ok((PushReport::Deployed { deployment }, exit_code))
}
