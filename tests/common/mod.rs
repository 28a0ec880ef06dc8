//! Shared fixtures: a local bare remote, a recording notification sink and
//! a deployment store that remembers every status it wrote.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use deploybot::config::StageTimeouts;
use deploybot::deployment::{DeploymentUpdate, NewDeployment};
use deploybot::dispatch::{Dispatcher, PushOutcome};
use deploybot::events::PushEvent;
use deploybot::notify::{DeploymentNotice, NotificationSink, PullRequestNotice};
use deploybot::pipeline::{Credentials, DeploymentPipeline};
use deploybot::repository::NewRepository;
use deploybot::store::{DeploymentStore, RepositoryStore, SqliteStore};
use deploybot::{BranchConfig, Deployment, DeploymentStatus, Provider, Repository};
use tempfile::TempDir;

pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args([
            "-c",
            "user.name=Fixture",
            "-c",
            "user.email=fixture@example.com",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .current_dir(dir)
        .env("LC_ALL", "C")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Bare `origin.git` plus a working clone used to push to it.
pub struct Remote {
    pub root: TempDir,
    pub bare: PathBuf,
    pub work: PathBuf,
}

impl Remote {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let bare = root.path().join("origin.git");
        let work = root.path().join("work");

        git(root.path(), &["init", "--bare", "-b", "main", "origin.git"]);
        git(root.path(), &["init", "-b", "main", "work"]);
        std::fs::write(work.join("README.md"), "hello\n").unwrap();
        git(&work, &["add", "."]);
        git(&work, &["commit", "-m", "initial"]);
        git(&work, &["remote", "add", "origin", bare.to_str().unwrap()]);
        git(&work, &["push", "origin", "main"]);

        Self { root, bare, work }
    }

    pub fn url(&self) -> String {
        format!("file://{}", self.bare.display())
    }

    pub fn commit(&self, branch: &str, file: &str, contents: &str) -> String {
        git(&self.work, &["checkout", branch]);
        std::fs::write(self.work.join(file), contents).unwrap();
        git(&self.work, &["add", "."]);
        git(&self.work, &["commit", "-m", &format!("update {}", file)]);
        git(&self.work, &["push", "origin", branch]);
        git(&self.work, &["rev-parse", "HEAD"])
    }

    pub fn branch(&self, name: &str) {
        git(&self.work, &["checkout", "-B", name, "main"]);
        git(&self.work, &["push", "origin", name]);
    }

    pub fn delete_branch(&self, name: &str) {
        git(&self.work, &["checkout", "main"]);
        git(&self.work, &["push", "origin", "--delete", name]);
    }

    pub fn tip(&self, branch: &str) -> String {
        git(&self.bare, &["rev-parse", branch])
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub deployments: Mutex<Vec<DeploymentNotice>>,
    pub pull_requests: Mutex<Vec<PullRequestNotice>>,
}

impl RecordingSink {
    pub fn deployment_notices(&self) -> Vec<DeploymentNotice> {
        self.deployments.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn deployment_finished(&self, notice: &DeploymentNotice) {
        self.deployments.lock().unwrap().push(notice.clone());
    }

    fn pull_request(&self, notice: &PullRequestNotice) {
        self.pull_requests.lock().unwrap().push(notice.clone());
    }
}

/// Delegates to SQLite and keeps the status sequence of every record.
pub struct HistoryStore {
    inner: Arc<SqliteStore>,
    history: Mutex<HashMap<String, Vec<DeploymentStatus>>>,
}

impl HistoryStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn history(&self, id: &str) -> Vec<DeploymentStatus> {
        self.history
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

impl DeploymentStore for HistoryStore {
    fn create_deployment(&self, new: &NewDeployment) -> deploybot::Result<String> {
        let id = self.inner.create_deployment(new)?;
        self.history
            .lock()
            .unwrap()
            .insert(id.clone(), vec![DeploymentStatus::Pending]);
        Ok(id)
    }

    fn get_deployment(&self, id: &str) -> deploybot::Result<Option<Deployment>> {
        self.inner.get_deployment(id)
    }

    fn update_deployment(&self, id: &str, update: &DeploymentUpdate) -> deploybot::Result<()> {
        self.inner.update_deployment(id, update)?;
        if let Some(status) = update.status {
            self.history
                .lock()
                .unwrap()
                .entry(id.to_string())
                .or_default()
                .push(status);
        }
        Ok(())
    }

    fn list_deployments(
        &self,
        repository_id: Option<&str>,
        limit: usize,
    ) -> deploybot::Result<Vec<Deployment>> {
        self.inner.list_deployments(repository_id, limit)
    }
}

/// One monitored repository served from a local bare remote.
pub struct Harness {
    pub remote: Remote,
    pub base: TempDir,
    pub store: Arc<SqliteStore>,
    pub history: Arc<HistoryStore>,
    pub sink: Arc<RecordingSink>,
    pub dispatcher: Dispatcher,
    pub repository: Repository,
}

impl Harness {
    pub fn new() -> Self {
        let remote = Remote::new();
        let base = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let history = Arc::new(HistoryStore::new(store.clone()));
        let sink = Arc::new(RecordingSink::default());

        let repository = store
            .create_repository(&NewRepository {
                name: "site".to_string(),
                git_url: remote.url(),
                provider: Provider::Github,
            })
            .unwrap();

        let pipeline = Arc::new(DeploymentPipeline::new(
            history.clone(),
            sink.clone(),
            Credentials::default(),
            base.path().to_path_buf(),
            StageTimeouts::default(),
        ));
        let dispatcher = Dispatcher::new(store.clone(), history.clone(), sink.clone(), pipeline);

        Self {
            remote,
            base,
            store,
            history,
            sink,
            dispatcher,
            repository,
        }
    }

    pub fn monitor(&mut self, config: BranchConfig) {
        let mut branches = self.repository.branches.clone();
        branches.upsert(config).unwrap();
        self.store
            .save_branches(&self.repository.id, &branches)
            .unwrap();
        self.repository.branches = branches;
    }

    pub fn checkout(&self, branch: &str) -> PathBuf {
        self.base.path().join(&self.repository.id).join(branch)
    }

    pub fn push_event(&self, branch: &str) -> PushEvent {
        let tip = self.remote.tip("main");
        serde_json::from_value(serde_json::json!({
            "provider": "GITHUB",
            "repository": "site",
            "ref": format!("refs/heads/{}", branch),
            "commits": [{
                "id": tip,
                "message": "ship it",
                "author": {"name": "Ana", "email": "ana@example.com"}
            }]
        }))
        .unwrap()
    }

    /// Dispatch a push and wait for its run; panics if it was ignored.
    pub fn deploy(&self, branch: &str) -> Deployment {
        match self.dispatcher.handle_push(&self.push_event(branch)).unwrap() {
            PushOutcome::Started(handle) => {
                let id = handle.wait().unwrap();
                self.store.get_deployment(&id).unwrap().unwrap()
            }
            PushOutcome::Ignored(reason) => panic!("push ignored: {:?}", reason),
        }
    }
}

pub fn rule(branch: &str, channel: &str) -> BranchConfig {
    BranchConfig {
        branch: branch.to_string(),
        discord_channel_id: channel.to_string(),
        pr_channel_id: None,
        build_command: None,
        deploy_command: None,
        environment: None,
    }
}
