//! Durable records for monitored repositories and their deployments.
//!
//! The pipeline and dispatcher only see the [`RepositoryStore`] and
//! [`DeploymentStore`] traits; [`SqliteStore`] is the production backend.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::deployment::{Deployment, DeploymentStatus, DeploymentUpdate, NewDeployment};
use crate::error::{Error, Result};
use crate::repository::{BranchConfig, BranchList, NewRepository, Provider, Repository};

pub trait RepositoryStore: Send + Sync {
    fn create_repository(&self, new: &NewRepository) -> Result<Repository>;
    fn get_repository(&self, id: &str) -> Result<Option<Repository>>;
    /// Active repository with this display name.
    fn find_repository_by_name(&self, name: &str) -> Result<Option<Repository>>;
    fn list_repositories(&self, include_inactive: bool) -> Result<Vec<Repository>>;
    fn save_branches(&self, id: &str, branches: &BranchList) -> Result<()>;
    fn set_repository_active(&self, id: &str, active: bool) -> Result<()>;
    /// Hard delete; deployments of the repository go with it. Returns the
    /// number of deployments removed.
    fn delete_repository(&self, id: &str) -> Result<usize>;
}

pub trait DeploymentStore: Send + Sync {
    fn create_deployment(&self, new: &NewDeployment) -> Result<String>;
    fn get_deployment(&self, id: &str) -> Result<Option<Deployment>>;
    /// Apply a partial update. A status change must be a legal transition of
    /// the current status, otherwise nothing is written.
    fn update_deployment(&self, id: &str, update: &DeploymentUpdate) -> Result<()>;
    fn list_deployments(&self, repository_id: Option<&str>, limit: usize) -> Result<Vec<Deployment>>;
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS repositories (
        id          TEXT PRIMARY KEY,
        name        TEXT NOT NULL,
        git_url     TEXT NOT NULL,
        provider    TEXT NOT NULL,
        is_active   INTEGER NOT NULL DEFAULT 1,
        branches    TEXT NOT NULL DEFAULT '[]',
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_repositories_active_name
        ON repositories(name) WHERE is_active = 1;

    CREATE TABLE IF NOT EXISTS deployments (
        id              TEXT PRIMARY KEY,
        repository_id   TEXT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
        branch          TEXT NOT NULL,
        commit_hash     TEXT NOT NULL,
        commit_message  TEXT NOT NULL,
        author          TEXT NOT NULL,
        status          TEXT NOT NULL,
        build_log       TEXT,
        deploy_log      TEXT,
        error           TEXT,
        created_at      TEXT NOT NULL,
        completed_at    TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_deployments_repository
        ON deployments(repository_id, created_at);
";

const REPOSITORY_COLUMNS: &str =
    "id, name, git_url, provider, is_active, branches, created_at, updated_at";

const DEPLOYMENT_COLUMNS: &str = "id, repository_id, branch, commit_hash, commit_message, author, \
     status, build_log, deploy_log, error, created_at, completed_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::internal_io(e.to_string(), Some(format!("create {}", parent.display())))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::internal_database(e.to_string(), Some(path.display().to_string())))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RepositoryStore for SqliteStore {
    fn create_repository(&self, new: &NewRepository) -> Result<Repository> {
        new.validate()?;
        let conn = self.conn();

        let taken: Option<String> = conn
            .query_row(
                "SELECT id FROM repositories WHERE name = ?1 AND is_active = 1",
                params![new.name.trim()],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(Error::repository_name_taken(new.name.trim()));
        }

        let now = Utc::now();
        let repository = Repository {
            id: Uuid::new_v4().to_string(),
            name: new.name.trim().to_string(),
            git_url: new.git_url.trim().to_string(),
            provider: new.provider,
            is_active: true,
            branches: BranchList::new(),
            created_at: now,
            updated_at: now,
        };

        conn.execute(
            "INSERT INTO repositories (id, name, git_url, provider, is_active, branches, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, '[]', ?5, ?5)",
            params![
                repository.id,
                repository.name,
                repository.git_url,
                repository.provider.as_str(),
                now.to_rfc3339(),
            ],
        )?;

        Ok(repository)
    }

    fn get_repository(&self, id: &str) -> Result<Option<Repository>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM repositories WHERE id = ?1", REPOSITORY_COLUMNS);
        let raw = conn.query_row(&sql, params![id], RawRepository::from_row).optional()?;
        raw.map(RawRepository::into_repository).transpose()
    }

    fn find_repository_by_name(&self, name: &str) -> Result<Option<Repository>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM repositories WHERE name = ?1 AND is_active = 1",
            REPOSITORY_COLUMNS
        );
        let raw = conn.query_row(&sql, params![name], RawRepository::from_row).optional()?;
        raw.map(RawRepository::into_repository).transpose()
    }

    fn list_repositories(&self, include_inactive: bool) -> Result<Vec<Repository>> {
        let conn = self.conn();
        let filter = if include_inactive { "" } else { "WHERE is_active = 1" };
        let sql = format!(
            "SELECT {} FROM repositories {} ORDER BY name, created_at",
            REPOSITORY_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], RawRepository::from_row)?;

        let mut repositories = Vec::new();
        for raw in rows {
            repositories.push(raw?.into_repository()?);
        }
        Ok(repositories)
    }

    fn save_branches(&self, id: &str, branches: &BranchList) -> Result<()> {
        let json = serde_json::to_string(branches)
            .map_err(|e| Error::internal_json(e.to_string(), Some("serialize branches".to_string())))?;
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE repositories SET branches = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, json, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(Error::repository_not_found(id));
        }
        Ok(())
    }

    fn set_repository_active(&self, id: &str, active: bool) -> Result<()> {
        let conn = self.conn();

        if active {
            let name: Option<String> = conn
                .query_row(
                    "SELECT name FROM repositories WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let name = name.ok_or_else(|| Error::repository_not_found(id))?;
            let clash: Option<String> = conn
                .query_row(
                    "SELECT id FROM repositories WHERE name = ?1 AND is_active = 1 AND id != ?2",
                    params![name, id],
                    |row| row.get(0),
                )
                .optional()?;
            if clash.is_some() {
                return Err(Error::repository_name_taken(name));
            }
        }

        let changed = conn.execute(
            "UPDATE repositories SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, active, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(Error::repository_not_found(id));
        }
        Ok(())
    }

    fn delete_repository(&self, id: &str) -> Result<usize> {
        let conn = self.conn();
        let deployments: i64 = conn.query_row(
            "SELECT COUNT(*) FROM deployments WHERE repository_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        let changed = conn.execute("DELETE FROM repositories WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(Error::repository_not_found(id));
        }
        Ok(deployments as usize)
    }
}

impl DeploymentStore for SqliteStore {
    fn create_deployment(&self, new: &NewDeployment) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO deployments (id, repository_id, branch, commit_hash, commit_message, author, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                new.repository_id,
                new.branch,
                new.commit,
                new.commit_message,
                new.author,
                DeploymentStatus::Pending.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    fn get_deployment(&self, id: &str) -> Result<Option<Deployment>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM deployments WHERE id = ?1", DEPLOYMENT_COLUMNS);
        let raw = conn.query_row(&sql, params![id], RawDeployment::from_row).optional()?;
        raw.map(RawDeployment::into_deployment).transpose()
    }

    fn update_deployment(&self, id: &str, update: &DeploymentUpdate) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM deployments WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let current = DeploymentStatus::parse(
            &current.ok_or_else(|| Error::deployment_not_found(id))?,
        )?;

        if let Some(next) = update.status {
            if !current.can_transition_to(next) {
                return Err(Error::deployment_invalid_transition(
                    id,
                    current.as_str(),
                    next.as_str(),
                ));
            }
        }

        tx.execute(
            "UPDATE deployments SET
                status       = COALESCE(?2, status),
                build_log    = COALESCE(?3, build_log),
                deploy_log   = COALESCE(?4, deploy_log),
                error        = COALESCE(?5, error),
                completed_at = COALESCE(?6, completed_at)
             WHERE id = ?1",
            params![
                id,
                update.status.map(|s| s.as_str()),
                update.build_log,
                update.deploy_log,
                update.error,
                update.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_deployments(&self, repository_id: Option<&str>, limit: usize) -> Result<Vec<Deployment>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM deployments
             WHERE (?1 IS NULL OR repository_id = ?1)
             ORDER BY created_at DESC LIMIT ?2",
            DEPLOYMENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![repository_id, limit as i64], RawDeployment::from_row)?;

        let mut deployments = Vec::new();
        for raw in rows {
            deployments.push(raw?.into_deployment()?);
        }
        Ok(deployments)
    }
}

/// Column values as stored; conversion into domain types happens in one
/// place so malformed rows surface as errors instead of panics.
struct RawRepository {
    id: String,
    name: String,
    git_url: String,
    provider: String,
    is_active: bool,
    branches: String,
    created_at: String,
    updated_at: String,
}

impl RawRepository {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            git_url: row.get(2)?,
            provider: row.get(3)?,
            is_active: row.get(4)?,
            branches: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_repository(self) -> Result<Repository> {
        let entries: Vec<BranchConfig> = serde_json::from_str(&self.branches).map_err(|e| {
            Error::internal_json(
                e.to_string(),
                Some(format!("branches of repository {}", self.id)),
            )
        })?;

        Ok(Repository {
            provider: Provider::parse(&self.provider)?,
            branches: BranchList::from_entries(entries)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            name: self.name,
            git_url: self.git_url,
            is_active: self.is_active,
        })
    }
}

struct RawDeployment {
    id: String,
    repository_id: String,
    branch: String,
    commit: String,
    commit_message: String,
    author: String,
    status: String,
    build_log: Option<String>,
    deploy_log: Option<String>,
    error: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl RawDeployment {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repository_id: row.get(1)?,
            branch: row.get(2)?,
            commit: row.get(3)?,
            commit_message: row.get(4)?,
            author: row.get(5)?,
            status: row.get(6)?,
            build_log: row.get(7)?,
            deploy_log: row.get(8)?,
            error: row.get(9)?,
            created_at: row.get(10)?,
            completed_at: row.get(11)?,
        })
    }

    fn into_deployment(self) -> Result<Deployment> {
        Ok(Deployment {
            status: DeploymentStatus::parse(&self.status)?,
            created_at: parse_timestamp(&self.created_at)?,
            completed_at: self.completed_at.as_deref().map(parse_timestamp).transpose()?,
            id: self.id,
            repository_id: self.repository_id,
            branch: self.branch,
            commit: self.commit,
            commit_message: self.commit_message,
            author: self.author,
            build_log: self.build_log,
            deploy_log: self.deploy_log,
            error: self.error,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::internal_database(e.to_string(), Some(format!("timestamp '{}'", value))))
}
