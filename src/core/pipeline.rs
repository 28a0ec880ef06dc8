//! One deployment run: verify, check out, build, deploy, report.
//!
//! The pipeline drives the record through
//! `PENDING → BUILDING → DEPLOYING → SUCCESS`, leaving through `FAILED` on
//! the first error. It never retries; every run that got past loading its
//! record ends in a terminal status and exactly one notification.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::{BotConfig, StageTimeouts};
use crate::deployment::{CommitInfo, Deployment, DeploymentStatus, DeploymentUpdate};
use crate::error::{Error, ErrorCode, Result};
use crate::git::{
    AuthenticatedRemote, CheckoutReconciler, Git, RemoteBranchVerifier, SnapshotResolver,
};
use crate::notify::{DeploymentNotice, NotificationSink};
use crate::paths;
use crate::repository::{BranchConfig, Provider, Repository};
use crate::runner::{CommandEnv, CommandRunner, Stage};

/// Everything a run needs, resolved by the caller before the record exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRequest {
    pub deployment_id: String,
    pub repository: Repository,
    pub branch_config: BranchConfig,
    pub commit: CommitInfo,
}

impl PipelineRequest {
    pub fn branch(&self) -> &str {
        &self.branch_config.branch
    }
}

/// Provider tokens used to derive authenticated clone URLs.
#[derive(Clone, Default)]
pub struct Credentials {
    github: Option<String>,
    gitlab: Option<String>,
}

impl Credentials {
    pub fn new(github: Option<String>, gitlab: Option<String>) -> Self {
        Self { github, gitlab }
    }

    pub fn token_for(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::Github => self.github.as_deref(),
            Provider::Gitlab => self.gitlab.as_deref(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("github", &self.github.as_ref().map(|_| "***"))
            .field("gitlab", &self.gitlab.as_ref().map(|_| "***"))
            .finish()
    }
}

pub struct DeploymentPipeline {
    deployments: Arc<dyn crate::store::DeploymentStore>,
    notifier: Arc<dyn NotificationSink>,
    credentials: Credentials,
    deploy_base_path: PathBuf,
    timeouts: StageTimeouts,
    git: Git,
    runner: CommandRunner,
}

impl DeploymentPipeline {
    pub fn new(
        deployments: Arc<dyn crate::store::DeploymentStore>,
        notifier: Arc<dyn NotificationSink>,
        credentials: Credentials,
        deploy_base_path: PathBuf,
        timeouts: StageTimeouts,
    ) -> Self {
        Self {
            deployments,
            notifier,
            credentials,
            deploy_base_path,
            timeouts,
            git: Git::new(timeouts),
            runner: CommandRunner,
        }
    }

    pub fn from_config(
        config: &BotConfig,
        deployments: Arc<dyn crate::store::DeploymentStore>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self::new(
            deployments,
            notifier,
            Credentials::new(
                config.token_for(Provider::Github).map(str::to_string),
                config.token_for(Provider::Gitlab).map(str::to_string),
            ),
            config.deploy_base_path.clone(),
            config.timeouts,
        )
    }

    /// Checkout directory for a repository branch.
    pub fn checkout_dir(&self, repository_id: &str, branch: &str) -> PathBuf {
        paths::checkout_dir(&self.deploy_base_path, repository_id, branch)
    }

    pub fn remote_for(&self, repository: &Repository) -> AuthenticatedRemote {
        AuthenticatedRemote::new(
            &repository.git_url,
            repository.provider,
            self.credentials.token_for(repository.provider),
        )
    }

    pub fn verifier(&self) -> RemoteBranchVerifier {
        RemoteBranchVerifier::new(self.git)
    }

    /// Execute one run and return the final record.
    ///
    /// Only a record that cannot be loaded, or one that is no longer
    /// PENDING, is returned as `Err`; such runs send no notification.
    /// Stage failures end in a FAILED record and are returned as `Ok`.
    pub fn run(&self, request: &PipelineRequest) -> Result<Deployment> {
        let id = request.deployment_id.as_str();
        let deployment = self
            .deployments
            .get_deployment(id)?
            .ok_or_else(|| Error::deployment_not_found(id))?;
        if deployment.status != DeploymentStatus::Pending {
            return Err(Error::deployment_invalid_transition(
                id,
                deployment.status.as_str(),
                DeploymentStatus::Building.as_str(),
            ));
        }

        info!(
            deployment_id = id,
            repository = %request.repository.name,
            branch = request.branch(),
            commit = %request.commit.id,
            "Deployment started"
        );

        match self.execute(request) {
            Ok(()) => {
                info!(deployment_id = id, "Deployment succeeded");
                self.notify(request, DeploymentStatus::Success, None);
            }
            Err(err) => self.fail(request, &err),
        }

        self.deployments
            .get_deployment(id)?
            .ok_or_else(|| Error::deployment_not_found(id))
    }

    fn execute(&self, request: &PipelineRequest) -> Result<()> {
        let id = request.deployment_id.as_str();
        let branch = request.branch();

        self.update(id, DeploymentUpdate::status(DeploymentStatus::Building))?;

        let remote = self.remote_for(&request.repository);
        self.verifier().verify(&remote, branch)?;

        let path = self.checkout_dir(&request.repository.id, branch);
        let plan = SnapshotResolver::new(self.git).resolve(&path);
        info!(deployment_id = id, path = %path.display(), ?plan, "Reconciling checkout");
        let head = CheckoutReconciler::new(self.git).reconcile(&path, &remote, branch, plan)?;

        let env = CommandEnv::for_environment(request.branch_config.environment_label())
            .with("DEPLOYBOT_BRANCH", branch)
            .with("DEPLOYBOT_COMMIT", &head)
            .with("DEPLOYBOT_DEPLOYMENT_ID", id);

        let build_log = self.runner.run(
            Stage::Build,
            request.branch_config.build_command.as_deref(),
            &path,
            &env,
            self.timeouts.build(),
        )?;
        self.update(
            id,
            DeploymentUpdate::status(DeploymentStatus::Deploying).with_build_log(build_log),
        )?;

        let deploy_log = self.runner.run(
            Stage::Deploy,
            request.branch_config.deploy_command.as_deref(),
            &path,
            &env,
            self.timeouts.deploy(),
        )?;
        self.update(
            id,
            DeploymentUpdate::status(DeploymentStatus::Success)
                .with_deploy_log(deploy_log)
                .completed_now(),
        )
    }

    /// Force a run into FAILED and send the failure notice. Used for stage
    /// errors and by the dispatcher when a worker panics.
    pub fn fail(&self, request: &PipelineRequest, err: &Error) {
        let id = request.deployment_id.as_str();
        let report = err.report();
        error!(
            deployment_id = id,
            repository = %request.repository.name,
            branch = request.branch(),
            code = err.code.as_str(),
            "Deployment failed: {}",
            err.message
        );

        let mut update = DeploymentUpdate::status(DeploymentStatus::Failed)
            .with_error(report.clone())
            .completed_now();
        if let Some((stage, output)) = command_output(err) {
            update = match stage {
                "build" => update.with_build_log(output),
                _ => update.with_deploy_log(output),
            };
        }
        if let Err(e) = self.update(id, update) {
            warn!(deployment_id = id, error = %e, "Could not record failure");
        }

        self.notify(request, DeploymentStatus::Failed, Some(report));
    }

    fn update(&self, id: &str, update: DeploymentUpdate) -> Result<()> {
        self.deployments.update_deployment(id, &update)
    }

    fn notify(&self, request: &PipelineRequest, status: DeploymentStatus, error: Option<String>) {
        self.notifier.deployment_finished(&DeploymentNotice {
            channel_id: request.branch_config.discord_channel_id.clone(),
            deployment_id: request.deployment_id.clone(),
            repository: request.repository.name.clone(),
            branch: request.branch().to_string(),
            environment: request.branch_config.environment_label().to_string(),
            commit: request.commit.clone(),
            status,
            error,
        });
    }
}

/// Output captured by a failed build or deploy command.
fn command_output(err: &Error) -> Option<(&str, String)> {
    if !matches!(err.code, ErrorCode::CommandFailed | ErrorCode::CommandTimeout) {
        return None;
    }
    let stage = err.details.get("stage")?.as_str()?;
    let output = err.details.get("output")?.as_str()?;
    Some((stage, output.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{CommitAuthor, NewDeployment};
    use crate::git::fixture::Remote;
    use crate::notify::PullRequestNotice;
    use crate::repository::{BranchList, NewRepository};
    use crate::store::{DeploymentStore, RepositoryStore, SqliteStore};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        notices: Mutex<Vec<DeploymentNotice>>,
    }

    impl NotificationSink for Recorder {
        fn deployment_finished(&self, notice: &DeploymentNotice) {
            self.notices.lock().unwrap().push(notice.clone());
        }

        fn pull_request(&self, _notice: &PullRequestNotice) {}
    }

    struct Harness {
        origin: Remote,
        store: Arc<SqliteStore>,
        recorder: Arc<Recorder>,
        pipeline: DeploymentPipeline,
        repository: Repository,
    }

    impl Harness {
        fn new() -> Self {
            let origin = Remote::new();
            let store = Arc::new(SqliteStore::open_in_memory().unwrap());
            let recorder = Arc::new(Recorder::default());
            let repository = store
                .create_repository(&NewRepository {
                    name: "site".to_string(),
                    git_url: "https://github.com/acme/site.git".to_string(),
                    provider: Provider::Github,
                })
                .unwrap();
            let repository = Repository {
                git_url: origin.url(),
                branches: BranchList::new(),
                ..repository
            };
            let pipeline = DeploymentPipeline::new(
                store.clone(),
                recorder.clone(),
                Credentials::default(),
                origin.scratch(),
                StageTimeouts::default(),
            );
            Self {
                origin,
                store,
                recorder,
                pipeline,
                repository,
            }
        }

        fn request(&self, config: BranchConfig) -> PipelineRequest {
            let commit = CommitInfo {
                id: self.origin.tip(&config.branch),
                message: "ship".to_string(),
                author: CommitAuthor {
                    name: "Ana".to_string(),
                    email: String::new(),
                },
            };
            let deployment_id = self
                .store
                .create_deployment(&NewDeployment::for_commit(
                    &self.repository.id,
                    &config.branch,
                    &commit,
                ))
                .unwrap();
            PipelineRequest {
                deployment_id,
                repository: self.repository.clone(),
                branch_config: config,
                commit,
            }
        }
    }

    fn config(build: Option<&str>, deploy: Option<&str>) -> BranchConfig {
        BranchConfig {
            branch: "main".to_string(),
            discord_channel_id: "chan".to_string(),
            pr_channel_id: None,
            build_command: build.map(str::to_string),
            deploy_command: deploy.map(str::to_string),
            environment: Some("production".to_string()),
        }
    }

    #[test]
    fn commands_run_in_checkout_with_environment() {
        let h = Harness::new();
        let request = h.request(config(
            Some("cat README.md; echo $NODE_ENV"),
            Some("echo deploying $DEPLOYBOT_BRANCH"),
        ));

        let deployment = h.pipeline.run(&request).unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Success);
        assert_eq!(deployment.build_log.as_deref(), Some("hello\nproduction\n"));
        assert_eq!(deployment.deploy_log.as_deref(), Some("deploying main\n"));
        assert!(deployment.completed_at.is_some());

        let notices = h.recorder.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].status, DeploymentStatus::Success);
        assert_eq!(notices[0].environment, "production");
    }

    #[test]
    fn deploy_failure_keeps_build_log_and_captures_deploy_output() {
        let h = Harness::new();
        let request = h.request(config(Some("echo built"), Some("echo half; exit 4")));

        let deployment = h.pipeline.run(&request).unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert_eq!(deployment.build_log.as_deref(), Some("built\n"));
        assert_eq!(deployment.deploy_log.as_deref(), Some("half\n"));
        assert!(deployment.error.unwrap().contains("exit code 4"));
    }

    #[test]
    fn missing_record_is_an_error_without_notification() {
        let h = Harness::new();
        let mut request = h.request(config(None, None));
        request.deployment_id = "does-not-exist".to_string();

        let err = h.pipeline.run(&request).unwrap_err();
        assert_eq!(err.code, ErrorCode::DeploymentNotFound);
        assert!(h.recorder.notices.lock().unwrap().is_empty());
    }

    #[test]
    fn finished_record_is_not_run_again() {
        let h = Harness::new();
        let request = h.request(config(None, None));
        h.pipeline.run(&request).unwrap();

        let err = h.pipeline.run(&request).unwrap_err();
        assert_eq!(err.code, ErrorCode::DeploymentInvalidTransition);
        assert_eq!(h.recorder.notices.lock().unwrap().len(), 1);
    }

    #[test]
    fn credentials_debug_is_masked() {
        let credentials = Credentials::new(Some("ghp_secret".to_string()), None);
        assert!(!format!("{:?}", credentials).contains("ghp_secret"));
    }
}
