//! Turns canonical webhook events into pipeline runs and pull-request notices.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::deployment::NewDeployment;
use crate::error::{Error, Result};
use crate::events::{PullRequestEvent, PushEvent};
use crate::notify::{NotificationSink, PullRequestNotice};
use crate::pipeline::{DeploymentPipeline, PipelineRequest};
use crate::repository::{Provider, Repository};
use crate::store::{DeploymentStore, RepositoryStore};

/// Why an event produced no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    UnknownRepository,
    BranchNotConfigured,
    NoCommit,
    IrrelevantAction,
}

pub enum PushOutcome {
    Ignored(IgnoreReason),
    Started(RunHandle),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PullRequestOutcome {
    Ignored { reason: IgnoreReason },
    Notified { channel_id: String },
}

/// A dispatched run. Dropping it detaches the worker.
pub struct RunHandle {
    pub deployment_id: String,
    worker: JoinHandle<()>,
}

impl RunHandle {
    /// Block until the worker has finished with the record.
    pub fn wait(self) -> Result<String> {
        self.worker
            .join()
            .map_err(|_| Error::internal_unexpected("deployment worker did not finish cleanly"))?;
        Ok(self.deployment_id)
    }
}

/// One mutex per (repository id, branch): runs sharing a checkout directory
/// execute one after another.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn for_key(&self, repository_id: &str, branch: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry((repository_id.to_string(), branch.to_string()))
            .or_default()
            .clone()
    }

    /// Give back a lock taken with [`for_key`](Self::for_key). The entry is
    /// dropped once no other run holds or waits on it.
    pub fn release(&self, repository_id: &str, branch: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        drop(lock);
        let key = (repository_id.to_string(), branch.to_string());
        if locks.get(&key).is_some_and(|entry| Arc::strong_count(entry) == 1) {
            locks.remove(&key);
        }
    }
}

pub struct Dispatcher {
    repositories: Arc<dyn RepositoryStore>,
    deployments: Arc<dyn DeploymentStore>,
    notifier: Arc<dyn NotificationSink>,
    pipeline: Arc<DeploymentPipeline>,
    locks: Arc<KeyedLocks>,
}

impl Dispatcher {
    pub fn new(
        repositories: Arc<dyn RepositoryStore>,
        deployments: Arc<dyn DeploymentStore>,
        notifier: Arc<dyn NotificationSink>,
        pipeline: Arc<DeploymentPipeline>,
    ) -> Self {
        Self {
            repositories,
            deployments,
            notifier,
            pipeline,
            locks: Arc::new(KeyedLocks::default()),
        }
    }

    /// Active repository of `provider` named `name`: exact display-name match
    /// first, then a clone URL containing the name.
    pub fn find_repository(&self, provider: Provider, name: &str) -> Result<Option<Repository>> {
        let candidates: Vec<Repository> = self
            .repositories
            .list_repositories(false)?
            .into_iter()
            .filter(|r| r.provider == provider)
            .collect();

        let exact = candidates.iter().position(|r| r.name == name);
        let fuzzy = || candidates.iter().position(|r| r.matches_event_name(name));
        Ok(exact.or_else(fuzzy).map(|i| candidates[i].clone()))
    }

    /// Create the PENDING record and start the run on a worker thread.
    /// Returns as soon as the record exists.
    pub fn handle_push(&self, event: &PushEvent) -> Result<PushOutcome> {
        let branch = event.branch();

        let Some(repository) = self.find_repository(event.provider, &event.repository)? else {
            warn!(repository = %event.repository, "Push for unknown repository ignored");
            return Ok(PushOutcome::Ignored(IgnoreReason::UnknownRepository));
        };
        let Some(branch_config) = repository.branch(branch).cloned() else {
            info!(repository = %repository.name, branch, "Push to unmonitored branch ignored");
            return Ok(PushOutcome::Ignored(IgnoreReason::BranchNotConfigured));
        };
        let Some(commit) = event.commit().cloned() else {
            warn!(repository = %repository.name, branch, "Push without commits ignored");
            return Ok(PushOutcome::Ignored(IgnoreReason::NoCommit));
        };

        let deployment_id = self.deployments.create_deployment(&NewDeployment::for_commit(
            &repository.id,
            branch,
            &commit,
        ))?;
        info!(deployment_id = %deployment_id, repository = %repository.name, branch, "Deployment queued");

        let request = PipelineRequest {
            deployment_id: deployment_id.clone(),
            repository,
            branch_config,
            commit,
        };
        let worker = self.spawn_worker(request)?;

        Ok(PushOutcome::Started(RunHandle {
            deployment_id,
            worker,
        }))
    }

    fn spawn_worker(&self, request: PipelineRequest) -> Result<JoinHandle<()>> {
        let pipeline = Arc::clone(&self.pipeline);
        let locks = Arc::clone(&self.locks);
        let moved = request.clone();

        let spawned = thread::Builder::new()
            .name(format!("deploy-{}", request.deployment_id))
            .spawn(move || run_serialized(&pipeline, &locks, &moved));

        spawned.map_err(|e| {
            let err = Error::internal_unexpected(format!("could not start deployment worker: {}", e));
            self.pipeline.fail(&request, &err);
            err
        })
    }

    pub fn handle_pull_request(&self, event: &PullRequestEvent) -> Result<PullRequestOutcome> {
        if !event.action.is_relevant() {
            return Ok(PullRequestOutcome::Ignored {
                reason: IgnoreReason::IrrelevantAction,
            });
        }

        let Some(repository) = self.find_repository(event.provider, &event.repository)? else {
            warn!(repository = %event.repository, "Pull request for unknown repository ignored");
            return Ok(PullRequestOutcome::Ignored {
                reason: IgnoreReason::UnknownRepository,
            });
        };
        let Some(config) = repository.branch(&event.base_branch) else {
            return Ok(PullRequestOutcome::Ignored {
                reason: IgnoreReason::BranchNotConfigured,
            });
        };

        let channel_id = config.pull_request_channel().to_string();
        self.notifier.pull_request(&PullRequestNotice {
            channel_id: channel_id.clone(),
            repository: repository.name.clone(),
            action: event.action,
            number: event.number,
            title: event.title.clone(),
            body: event.body.clone(),
            url: event.url.clone(),
            base_branch: event.base_branch.clone(),
            head_branch: event.head_branch.clone(),
            author: event.author.clone(),
            merged: event.merged,
        });

        Ok(PullRequestOutcome::Notified { channel_id })
    }
}

/// Worker body: waits for its key, runs, and turns a panic into FAILED.
fn run_serialized(pipeline: &DeploymentPipeline, locks: &KeyedLocks, request: &PipelineRequest) {
    let lock = locks.for_key(&request.repository.id, request.branch());
    let guard = lock.lock().unwrap_or_else(|p| p.into_inner());

    match panic::catch_unwind(AssertUnwindSafe(|| pipeline.run(request))) {
        Ok(Ok(deployment)) => info!(
            deployment_id = %deployment.id,
            status = deployment.status.as_str(),
            "Deployment finished"
        ),
        Ok(Err(e)) => error!(
            deployment_id = %request.deployment_id,
            error = %e,
            "Deployment could not run"
        ),
        Err(payload) => {
            let err = Error::internal_unexpected(format!(
                "deployment worker panicked: {}",
                panic_message(payload.as_ref())
            ));
            pipeline.fail(request, &err);
        }
    }

    drop(guard);
    locks.release(&request.repository.id, request.branch(), lock);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageTimeouts;
    use crate::deployment::{CommitAuthor, CommitInfo, DeploymentStatus};
    use crate::events::PullRequestAction;
    use crate::notify::DeploymentNotice;
    use crate::pipeline::Credentials;
    use crate::repository::{BranchConfig, NewRepository};
    use crate::store::SqliteStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        deployments: Mutex<Vec<DeploymentNotice>>,
        pull_requests: Mutex<Vec<PullRequestNotice>>,
    }

    impl NotificationSink for Recorder {
        fn deployment_finished(&self, notice: &DeploymentNotice) {
            self.deployments.lock().unwrap().push(notice.clone());
        }

        fn pull_request(&self, notice: &PullRequestNotice) {
            self.pull_requests.lock().unwrap().push(notice.clone());
        }
    }

    struct Setup {
        store: Arc<SqliteStore>,
        recorder: Arc<Recorder>,
        dispatcher: Dispatcher,
        _scratch: tempfile::TempDir,
    }

    fn setup() -> Setup {
        let scratch = tempfile::TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let recorder = Arc::new(Recorder::default());
        let pipeline = Arc::new(DeploymentPipeline::new(
            store.clone(),
            recorder.clone(),
            Credentials::default(),
            scratch.path().to_path_buf(),
            StageTimeouts::default(),
        ));
        let dispatcher = Dispatcher::new(store.clone(), store.clone(), recorder.clone(), pipeline);
        Setup {
            store,
            recorder,
            dispatcher,
            _scratch: scratch,
        }
    }

    fn add_repo(store: &SqliteStore, name: &str, url: &str, branches: &[(&str, Option<&str>)]) -> Repository {
        let repo = store
            .create_repository(&NewRepository {
                name: name.to_string(),
                git_url: url.to_string(),
                provider: Provider::Github,
            })
            .unwrap();
        let mut list = repo.branches.clone();
        for (branch, pr_channel) in branches {
            list.upsert(BranchConfig {
                branch: branch.to_string(),
                discord_channel_id: "deploys".to_string(),
                pr_channel_id: pr_channel.map(str::to_string),
                build_command: None,
                deploy_command: None,
                environment: None,
            })
            .unwrap();
        }
        store.save_branches(&repo.id, &list).unwrap();
        store.get_repository(&repo.id).unwrap().unwrap()
    }

    fn push(repository: &str, git_ref: &str, commits: usize) -> PushEvent {
        PushEvent {
            provider: Provider::Github,
            repository: repository.to_string(),
            git_ref: git_ref.to_string(),
            commits: (0..commits)
                .map(|i| CommitInfo {
                    id: format!("c{}", i),
                    message: "msg".to_string(),
                    author: CommitAuthor {
                        name: "Ana".to_string(),
                        email: String::new(),
                    },
                })
                .collect(),
            head_commit: None,
        }
    }

    fn pull_request(repository: &str, base: &str, action: PullRequestAction) -> PullRequestEvent {
        PullRequestEvent {
            provider: Provider::Github,
            repository: repository.to_string(),
            action,
            number: 3,
            title: "Tweak".to_string(),
            body: String::new(),
            url: "https://github.com/acme/site/pull/3".to_string(),
            base_branch: base.to_string(),
            head_branch: "feature".to_string(),
            author: "ana".to_string(),
            merged: false,
        }
    }

    #[test]
    fn unconfigured_branch_creates_nothing() {
        let s = setup();
        add_repo(&s.store, "site", "https://github.com/acme/site.git", &[("main", None)]);

        let outcome = s.dispatcher.handle_push(&push("site", "refs/heads/dev", 1)).unwrap();
        assert!(matches!(
            outcome,
            PushOutcome::Ignored(IgnoreReason::BranchNotConfigured)
        ));
        assert!(s.store.list_deployments(None, 10).unwrap().is_empty());
        assert!(s.recorder.deployments.lock().unwrap().is_empty());
    }

    #[test]
    fn push_without_commit_is_ignored() {
        let s = setup();
        add_repo(&s.store, "site", "https://github.com/acme/site.git", &[("main", None)]);

        let outcome = s.dispatcher.handle_push(&push("site", "refs/heads/main", 0)).unwrap();
        assert!(matches!(outcome, PushOutcome::Ignored(IgnoreReason::NoCommit)));
        assert!(s.store.list_deployments(None, 10).unwrap().is_empty());
    }

    #[test]
    fn repository_matches_by_url_when_name_differs() {
        let s = setup();
        let repo = add_repo(&s.store, "Marketing Site", "https://github.com/acme/site.git", &[]);

        let found = s
            .dispatcher
            .find_repository(Provider::Github, "site")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, repo.id);
        assert!(s
            .dispatcher
            .find_repository(Provider::Gitlab, "site")
            .unwrap()
            .is_none());
    }

    #[test]
    fn exact_name_wins_over_url_match() {
        let s = setup();
        add_repo(&s.store, "site-legacy", "https://github.com/acme/site.git", &[]);
        let exact = add_repo(&s.store, "site", "https://github.com/acme/www.git", &[]);

        let found = s
            .dispatcher
            .find_repository(Provider::Github, "site")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, exact.id);
    }

    #[test]
    fn unreachable_remote_ends_failed_with_one_notice() {
        let s = setup();
        add_repo(&s.store, "site", "file:///nonexistent/site.git", &[("main", None)]);

        let PushOutcome::Started(handle) = s
            .dispatcher
            .handle_push(&push("site", "refs/heads/main", 1))
            .unwrap()
        else {
            panic!("expected a started run");
        };
        let id = handle.wait().unwrap();

        let deployment = s.store.get_deployment(&id).unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        let notices = s.recorder.deployments.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].channel_id, "deploys");
    }

    #[test]
    fn pull_request_goes_to_pr_channel_or_falls_back() {
        let s = setup();
        add_repo(
            &s.store,
            "site",
            "https://github.com/acme/site.git",
            &[("main", Some("reviews")), ("staging", None)],
        );

        let to_main = s
            .dispatcher
            .handle_pull_request(&pull_request("site", "main", PullRequestAction::Opened))
            .unwrap();
        assert_eq!(
            to_main,
            PullRequestOutcome::Notified {
                channel_id: "reviews".to_string()
            }
        );

        let to_staging = s
            .dispatcher
            .handle_pull_request(&pull_request("site", "staging", PullRequestAction::Synchronize))
            .unwrap();
        assert_eq!(
            to_staging,
            PullRequestOutcome::Notified {
                channel_id: "deploys".to_string()
            }
        );
        assert_eq!(s.recorder.pull_requests.lock().unwrap().len(), 2);
    }

    #[test]
    fn irrelevant_pull_request_actions_send_nothing() {
        let s = setup();
        add_repo(&s.store, "site", "https://github.com/acme/site.git", &[("main", None)]);

        let outcome = s
            .dispatcher
            .handle_pull_request(&pull_request("site", "main", PullRequestAction::Other))
            .unwrap();
        assert_eq!(
            outcome,
            PullRequestOutcome::Ignored {
                reason: IgnoreReason::IrrelevantAction
            }
        );
        let outcome = s
            .dispatcher
            .handle_pull_request(&pull_request("site", "dev", PullRequestAction::Opened))
            .unwrap();
        assert_eq!(
            outcome,
            PullRequestOutcome::Ignored {
                reason: IgnoreReason::BranchNotConfigured
            }
        );
        assert!(s.recorder.pull_requests.lock().unwrap().is_empty());
    }

    #[test]
    fn same_key_runs_never_overlap() {
        let locks = Arc::new(KeyedLocks::default());
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let (locks, busy, overlaps) = (locks.clone(), busy.clone(), overlaps.clone());
                thread::spawn(move || {
                    let lock = locks.for_key("repo", "main");
                    let _guard = lock.lock().unwrap();
                    if busy.swap(true, Ordering::SeqCst) {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(50));
                    busy.store(false, Ordering::SeqCst);
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn different_keys_get_different_locks() {
        let locks = KeyedLocks::default();
        let main = locks.for_key("repo", "main");
        let _held = main.lock().unwrap();
        let staging = locks.for_key("repo", "staging");
        assert!(staging.try_lock().is_ok());
        assert!(Arc::ptr_eq(&main, &locks.for_key("repo", "main")));
    }

    #[test]
    fn idle_keys_are_forgotten() {
        let locks = KeyedLocks::default();
        let first = locks.for_key("repo", "feature");
        let waiting = locks.for_key("repo", "feature");

        locks.release("repo", "feature", first);
        assert_eq!(locks.locks.lock().unwrap().len(), 1);

        locks.release("repo", "feature", waiting);
        assert!(locks.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
