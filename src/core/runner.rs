//! Build and deploy shell commands.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::utils::command::run_captured;

/// Which configured command is running; used in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Build,
    Deploy,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Build => "build",
            Stage::Deploy => "deploy",
        }
    }
}

/// Environment handed to every command on top of the process environment.
#[derive(Debug, Clone, Default)]
pub struct CommandEnv {
    vars: Vec<(String, String)>,
}

impl CommandEnv {
    /// `NODE_ENV` and `DEPLOYBOT_ENVIRONMENT` both carry the environment label.
    pub fn for_environment(environment: &str) -> Self {
        Self::default()
            .with("NODE_ENV", environment)
            .with("DEPLOYBOT_ENVIRONMENT", environment)
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.vars.push((key.to_string(), value.to_string()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandRunner;

impl CommandRunner {
    /// Run `command` with `sh -c` in `dir`. Returns stdout followed by stderr.
    ///
    /// An absent or blank command is a no-op with empty output. A non-zero
    /// exit or timeout fails with the output captured so far.
    pub fn run(
        &self,
        stage: Stage,
        command: Option<&str>,
        dir: &Path,
        env: &CommandEnv,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let Some(command) = command.map(str::trim).filter(|c| !c.is_empty()) else {
            return Ok(String::new());
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(dir);
        for (key, value) in env.iter() {
            cmd.env(key, value);
        }

        tracing::info!(stage = stage.as_str(), command, "Running command");
        let output = run_captured(cmd, timeout, &format!("{} command", stage.as_str()))?;
        let combined = output.combined();

        if output.timed_out {
            let secs = timeout.map(|t| t.as_secs()).unwrap_or_default();
            return Err(Error::command_timeout(stage.as_str(), command, secs, combined));
        }
        if !output.success {
            return Err(Error::command_failed(
                stage.as_str(),
                command,
                output.exit_code,
                combined,
            ));
        }
        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    fn run(command: Option<&str>, env: &CommandEnv, timeout: Option<Duration>) -> Result<String> {
        let dir = tempfile::TempDir::new().unwrap();
        CommandRunner.run(Stage::Build, command, dir.path(), env, timeout)
    }

    #[test]
    fn absent_command_is_a_no_op() {
        assert_eq!(run(None, &CommandEnv::default(), None).unwrap(), "");
        assert_eq!(run(Some("  "), &CommandEnv::default(), None).unwrap(), "");
    }

    #[test]
    fn output_is_stdout_then_stderr() {
        let out = run(Some("echo one; echo two >&2"), &CommandEnv::default(), None).unwrap();
        assert_eq!(out, "one\ntwo\n");
    }

    #[test]
    fn environment_label_is_exported() {
        let env = CommandEnv::for_environment("staging");
        let out = run(Some("echo $NODE_ENV-$DEPLOYBOT_ENVIRONMENT"), &env, None).unwrap();
        assert_eq!(out, "staging-staging\n");
    }

    #[test]
    fn runs_inside_the_checkout() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker"), "here").unwrap();
        let out = CommandRunner
            .run(
                Stage::Deploy,
                Some("cat marker"),
                dir.path(),
                &CommandEnv::default(),
                None,
            )
            .unwrap();
        assert_eq!(out, "here");
    }

    #[test]
    fn failure_keeps_partial_output() {
        let err = run(
            Some("echo compiling; echo 'error: missing dep' >&2; exit 2"),
            &CommandEnv::default(),
            None,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::CommandFailed);
        assert_eq!(err.details["exitCode"], 2);
        assert!(err.message.contains("compiling"));
        assert!(err.message.contains("error: missing dep"));
    }

    #[test]
    fn timeout_is_its_own_error() {
        let err = run(
            Some("echo started; sleep 30"),
            &CommandEnv::default(),
            Some(Duration::from_millis(300)),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::CommandTimeout);
        assert!(err.message.contains("started"));
    }

    #[test]
    fn background_process_does_not_outlive_the_deploy_limit() {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let dir = tempfile::TempDir::new().unwrap();
            let result = CommandRunner.run(
                Stage::Deploy,
                Some("echo started; sleep 20 &"),
                dir.path(),
                &CommandEnv::default(),
                Some(Duration::from_secs(1)),
            );
            let _ = tx.send(result);
        });

        let err = rx
            .recv_timeout(Duration::from_secs(8))
            .expect("deploy stage ignored its time limit")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CommandTimeout);
        assert!(err.message.contains("started"));
    }
}
