//! Sync orchestration: snapshot, plan, execute
//!
//! [`SyncEngine`] drives one full run: walk the local source, snapshot the
//! remote target, diff the two into a plan, make sure the target root
//! exists, then execute. `sync` opens a live SFTP session; `sync_with`
//! accepts any [`RemoteFs`] so the whole flow is testable in memory.

use std::path::Path;
use std::time::Duration;

use log::info;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::local::walk_local;
use crate::remote::{RemoteFs, RemoteState};
use crate::session::SftpRemoteFs;
use crate::sync::execute::{execute, ExecuteOptions};
use crate::sync::plan::{plan, PlanOptions, TransferPlan};
use crate::sync::{CancelToken, TransferResult};

pub struct SyncEngine {
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            delete_extraneous: self.config.transfer.delete_extraneous,
        }
    }

    fn execute_options(&self) -> ExecuteOptions {
        ExecuteOptions {
            max_attempts: self.config.transfer.max_attempts,
            backoff: Duration::from_millis(self.config.transfer.retry_backoff_ms),
            chunk_size: self.config.transfer.chunk_size,
            continue_on_error: self.config.transfer.continue_on_error,
        }
    }

    /// Diff local against remote without changing anything
    fn build_plan(&self, remote: &dyn RemoteFs) -> SyncResult<TransferPlan> {
        let remote_dir = &self.config.transfer.remote_dir;
        let local = walk_local(&self.config.transfer.source)?;
        let state =
            RemoteState::fetch(remote, remote_dir).map_err(|source| SyncError::RemoteListFailed {
                path: remote_dir.clone(),
                source,
            })?;
        info!(
            "{} local files, {} remote entries",
            local.len(),
            state.len()
        );
        Ok(plan(&local, &state, self.plan_options()))
    }

    /// Create the remote target root and any missing ancestors
    fn ensure_remote_root(&self, remote: &dyn RemoteFs) -> SyncResult<()> {
        let remote_dir = &self.config.transfer.remote_dir;
        let mut dirs: Vec<&Path> = remote_dir
            .ancestors()
            .filter(|p| !p.as_os_str().is_empty() && *p != Path::new("/"))
            .collect();
        dirs.reverse();
        for dir in dirs {
            remote
                .mkdir(dir)
                .map_err(|source| SyncError::RemoteRootFailed {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Preview the plan over a live session; nothing is written
    pub fn preview(&self) -> SyncResult<TransferPlan> {
        let endpoint = self.config.endpoint.resolve()?;
        let remote = SftpRemoteFs::connect(&endpoint)?;
        let plan = self.preview_with(&remote);
        remote.close();
        plan
    }

    pub fn preview_with(&self, remote: &dyn RemoteFs) -> SyncResult<TransferPlan> {
        self.build_plan(remote)
    }

    /// Run one full sync over a live session
    pub fn sync(&self, cancel: &CancelToken) -> SyncResult<TransferResult> {
        let endpoint = self.config.endpoint.resolve()?;
        let remote = SftpRemoteFs::connect(&endpoint)?;
        let result = self.sync_with(&remote, cancel);
        remote.close();
        result
    }

    /// Run one full sync over any [`RemoteFs`]
    pub fn sync_with(
        &self,
        remote: &dyn RemoteFs,
        cancel: &CancelToken,
    ) -> SyncResult<TransferResult> {
        let plan = self.build_plan(remote)?;
        if plan.is_empty() {
            info!("remote is up to date, nothing to transfer");
            return Ok(TransferResult::default());
        }
        info!("executing {} operations", plan.len());
        self.ensure_remote_root(remote)?;
        Ok(execute(
            remote,
            &self.config.transfer.source,
            &self.config.transfer.remote_dir,
            &plan,
            &self.execute_options(),
            cancel,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, TransferConfig};
    use crate::error::OpError;
    use crate::remote::MemoryRemoteFs;
    use std::fs;
    use std::path::PathBuf;

    fn engine_for(source: &Path, remote_dir: &str) -> SyncEngine {
        SyncEngine::new(SyncConfig {
            endpoint: EndpointConfig {
                host: "build.example.com".to_string(),
                port: 22,
                username: "deploy".to_string(),
                password: None,
                private_key: None,
                passphrase: None,
                timeout_secs: 30,
                keepalive_interval_secs: 0,
            },
            transfer: TransferConfig {
                source: source.to_path_buf(),
                remote_dir: PathBuf::from(remote_dir),
                delete_extraneous: true,
                continue_on_error: false,
                max_attempts: 3,
                retry_backoff_ms: 0,
                chunk_size: 64 * 1024,
            },
        })
    }

    fn stage(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (rel, content) in files {
            let path = dir.path().join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, content).unwrap();
        }
        dir
    }

    #[test]
    fn first_run_creates_root_and_transfers_everything() {
        let source = stage(&[("index.html", "<html>"), ("css/app.css", "body {}")]);
        let remote = MemoryRemoteFs::new();
        let engine = engine_for(source.path(), "/srv/www/site");

        let result = engine.sync_with(&remote, &CancelToken::new()).unwrap();

        assert!(result.is_success());
        assert!(remote.is_dir(Path::new("/srv/www/site")));
        assert_eq!(
            remote
                .file_content(Path::new("/srv/www/site/index.html"))
                .unwrap(),
            b"<html>"
        );
        assert_eq!(
            remote
                .file_content(Path::new("/srv/www/site/css/app.css"))
                .unwrap(),
            b"body {}"
        );
    }

    #[test]
    fn second_run_is_a_no_op() {
        let source = stage(&[("index.html", "<html>"), ("css/app.css", "body {}")]);
        let remote = MemoryRemoteFs::new();
        let engine = engine_for(source.path(), "/srv/www/site");

        engine.sync_with(&remote, &CancelToken::new()).unwrap();
        let second = engine.sync_with(&remote, &CancelToken::new()).unwrap();

        assert!(second.records.is_empty());
        assert!(second.is_success());
    }

    #[test]
    fn extraneous_remote_files_are_deleted() {
        let source = stage(&[("keep.txt", "k")]);
        let remote = MemoryRemoteFs::new();
        remote.seed_file(Path::new("/srv/app/stale.txt"), b"old", 0o644);
        let engine = engine_for(source.path(), "/srv/app");

        let result = engine.sync_with(&remote, &CancelToken::new()).unwrap();

        assert!(result.is_success());
        assert!(!remote.contains(Path::new("/srv/app/stale.txt")));
        assert!(remote.contains(Path::new("/srv/app/keep.txt")));
    }

    #[test]
    fn preview_does_not_touch_the_remote() {
        let source = stage(&[("index.html", "<html>")]);
        let remote = MemoryRemoteFs::new();
        let engine = engine_for(source.path(), "/srv/www/site");

        let plan = engine.preview_with(&remote).unwrap();

        assert_eq!(plan.len(), 1);
        assert!(!remote.contains(Path::new("/srv/www/site")));
    }

    #[test]
    fn changed_file_is_the_only_thing_reuploaded() {
        let source = stage(&[("a.txt", "one"), ("b.txt", "two")]);
        let remote = MemoryRemoteFs::new();
        let engine = engine_for(source.path(), "/srv/app");
        engine.sync_with(&remote, &CancelToken::new()).unwrap();

        fs::write(source.path().join("a.txt"), "changed").unwrap();
        let result = engine.sync_with(&remote, &CancelToken::new()).unwrap();

        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].path, PathBuf::from("a.txt"));
        assert_eq!(
            remote.file_content(Path::new("/srv/app/a.txt")).unwrap(),
            b"changed"
        );
    }

    #[test]
    fn unlistable_remote_is_a_fatal_error() {
        let source = stage(&[("a.txt", "a")]);
        let remote = MemoryRemoteFs::new();
        remote.seed_dir(Path::new("/srv/app"));
        remote.inject_failures(
            "stat",
            Path::new("/srv/app"),
            OpError::PermissionDenied("no".into()),
            1,
        );
        let engine = engine_for(source.path(), "/srv/app");

        let err = engine.sync_with(&remote, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, SyncError::RemoteListFailed { .. }));
    }

    #[test]
    fn missing_local_source_is_a_fatal_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let remote = MemoryRemoteFs::new();
        let engine = engine_for(&missing, "/srv/app");

        let err = engine.sync_with(&remote, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, SyncError::LocalWalkFailed { .. }));
    }
}
