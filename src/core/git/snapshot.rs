use std::fs;
use std::path::Path;

use super::Git;

/// State of a checkout directory before reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Snapshot {
    /// Nothing at the path.
    Absent,
    /// Something is there but it is not a usable checkout of its own.
    Invalid,
    /// A working tree rooted at the path.
    Valid,
}

/// What the reconciler has to do once the snapshot is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutPlan {
    FreshClone,
    UpdateExisting,
}

#[derive(Debug, Clone, Copy)]
pub struct SnapshotResolver {
    git: Git,
}

impl SnapshotResolver {
    pub fn new(git: Git) -> Self {
        Self { git }
    }

    pub fn inspect(&self, path: &Path) -> Snapshot {
        if !path.exists() {
            return Snapshot::Absent;
        }
        if !path.is_dir() || !self.git.succeeds(path, &["status", "--porcelain"]) {
            return Snapshot::Invalid;
        }

        // A plain directory nested inside some other repository passes
        // `git status` too; only a tree rooted here counts.
        let toplevel = self.git.query(path, &["rev-parse", "--show-toplevel"]);
        match (toplevel.map(|t| fs::canonicalize(t)), fs::canonicalize(path)) {
            (Some(Ok(top)), Ok(here)) if top == here => Snapshot::Valid,
            _ => Snapshot::Invalid,
        }
    }

    /// Inspect `path` and wipe it when it holds an unusable snapshot.
    pub fn resolve(&self, path: &Path) -> CheckoutPlan {
        match self.inspect(path) {
            Snapshot::Valid => CheckoutPlan::UpdateExisting,
            Snapshot::Absent => CheckoutPlan::FreshClone,
            Snapshot::Invalid => {
                tracing::warn!(path = %path.display(), "Discarding invalid checkout directory");
                wipe(path);
                CheckoutPlan::FreshClone
            }
        }
    }
}

/// Best-effort recursive delete. Failures are logged, never returned.
pub fn wipe(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Cleanup failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixture::{git, Remote};
    use super::*;

    #[test]
    fn missing_path_is_absent() {
        let origin = Remote::new();
        let resolver = SnapshotResolver::new(Git::default());
        assert_eq!(resolver.inspect(&origin.scratch().join("x")), Snapshot::Absent);
        assert_eq!(
            resolver.resolve(&origin.scratch().join("x")),
            CheckoutPlan::FreshClone
        );
    }

    #[test]
    fn plain_directory_is_invalid_and_wiped() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("checkout");
        fs::create_dir_all(target.join("leftover")).unwrap();
        fs::write(target.join("leftover/file.txt"), "partial").unwrap();

        let resolver = SnapshotResolver::new(Git::default());
        assert_eq!(resolver.inspect(&target), Snapshot::Invalid);
        assert_eq!(resolver.resolve(&target), CheckoutPlan::FreshClone);
        assert!(!target.exists());
    }

    #[test]
    fn directory_inside_another_repository_is_invalid() {
        let origin = Remote::new();
        let nested = origin.work.join("nested");
        fs::create_dir_all(&nested).unwrap();

        let resolver = SnapshotResolver::new(Git::default());
        assert_eq!(resolver.inspect(&nested), Snapshot::Invalid);
    }

    #[test]
    fn clone_is_valid() {
        let origin = Remote::new();
        let target = origin.scratch().join("clone");
        fs::create_dir_all(origin.scratch()).unwrap();
        git(
            &origin.scratch(),
            &["clone", &origin.url(), target.to_str().unwrap()],
        );

        let resolver = SnapshotResolver::new(Git::default());
        assert_eq!(resolver.inspect(&target), Snapshot::Valid);
        assert_eq!(resolver.resolve(&target), CheckoutPlan::UpdateExisting);
        assert!(target.join("README.md").exists());
    }

    #[test]
    fn wipe_of_missing_path_is_silent() {
        let dir = tempfile::TempDir::new().unwrap();
        wipe(&dir.path().join("never-existed"));
    }
}
