//! Plan execution: apply operations over the remote capability
//!
//! Stage 2 of the pipeline. Operations run strictly in plan order (the plan
//! already encodes dependency constraints). Uploads are streamed in bounded
//! chunks and verified against the local entry afterwards; transient errors
//! are retried with exponential backoff, permanent errors abort the rest of
//! the plan unless `continue_on_error` is set.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::error::OpError;
use crate::local::{hash_reader, FileEntry};
use crate::remote::RemoteFs;
use crate::sync::plan::{PlanOp, TransferPlan};
use crate::sync::{CancelToken, OpRecord, OpStatus, TransferResult};

/// Execution policy
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Maximum attempts per operation, first try included
    pub max_attempts: u32,
    /// Base backoff delay, doubled after each failed attempt
    pub backoff: Duration,
    /// Upload chunk size in bytes
    pub chunk_size: usize,
    /// Keep going after a permanent failure, skipping dependents
    pub continue_on_error: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
            chunk_size: 64 * 1024,
            continue_on_error: false,
        }
    }
}

/// Map a local/stream IO error onto the operation taxonomy
fn io_to_op(err: &io::Error) -> OpError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => OpError::PermissionDenied(err.to_string()),
        io::ErrorKind::NotFound | io::ErrorKind::InvalidInput => {
            OpError::InvalidPath(err.to_string())
        }
        _ => OpError::NetworkInterrupted(err.to_string()),
    }
}

/// Apply a plan over the open session
///
/// Returns a [`TransferResult`] with one record per operation. Cancellation
/// is honored between operations: remaining operations are recorded as
/// `Failed(Cancelled)` and never attempted.
pub fn execute(
    remote: &dyn RemoteFs,
    local_root: &Path,
    remote_root: &Path,
    plan: &TransferPlan,
    options: &ExecuteOptions,
    cancel: &CancelToken,
) -> TransferResult {
    let mut result = TransferResult::default();
    // Directories whose creation failed; everything beneath them is skipped.
    let mut failed_dirs: BTreeSet<PathBuf> = BTreeSet::new();
    // Paths whose deletion failed; ancestor deletes cannot succeed.
    let mut failed_deletes: Vec<PathBuf> = Vec::new();

    for (index, op) in plan.iter().enumerate() {
        if cancel.is_cancelled() {
            warn!("sync cancelled, {} operations remaining", plan.len() - index);
            for remaining in &plan.ops[index..] {
                result.records.push(OpRecord {
                    path: remaining.path().to_path_buf(),
                    kind: remaining.kind(),
                    status: OpStatus::Failed {
                        attempts: 0,
                        error: OpError::Cancelled,
                    },
                });
            }
            break;
        }

        if let Some(blocker) = dependency_blocker(op, &failed_dirs, &failed_deletes) {
            // A skipped mkdir blocks everything beneath it just like a
            // failed one.
            if let PlanOp::CreateDir(path) = op {
                failed_dirs.insert(path.clone());
            }
            result.records.push(OpRecord {
                path: op.path().to_path_buf(),
                kind: op.kind(),
                status: OpStatus::Failed {
                    attempts: 0,
                    error: OpError::DependencyFailed(blocker.display().to_string()),
                },
            });
            continue;
        }

        let (attempts, outcome) = attempt_with_retry(remote, local_root, remote_root, op, options);
        match outcome {
            Ok(()) => {
                debug!("{} {} ok after {} attempt(s)", op.kind().label(), op.path().display(), attempts);
                result.records.push(OpRecord {
                    path: op.path().to_path_buf(),
                    kind: op.kind(),
                    status: if attempts > 1 {
                        OpStatus::Retried(attempts - 1)
                    } else {
                        OpStatus::Succeeded
                    },
                });
            }
            Err(error) => {
                warn!(
                    "{} {} failed after {} attempt(s): {}",
                    op.kind().label(),
                    op.path().display(),
                    attempts,
                    error
                );
                let permanent = !error.is_transient();
                match op {
                    PlanOp::CreateDir(path) => {
                        failed_dirs.insert(path.clone());
                    }
                    PlanOp::Delete(path) => failed_deletes.push(path.clone()),
                    _ => {}
                }
                result.records.push(OpRecord {
                    path: op.path().to_path_buf(),
                    kind: op.kind(),
                    status: OpStatus::Failed { attempts, error },
                });
                if permanent && !options.continue_on_error {
                    result.aborted = true;
                    break;
                }
            }
        }
    }

    result
}

/// What, if anything, blocks this operation from being attempted
///
/// A failed delete also blocks recreation at or under its path: in a
/// type-change sequence the old entry is still in the way.
fn dependency_blocker(
    op: &PlanOp,
    failed_dirs: &BTreeSet<PathBuf>,
    failed_deletes: &[PathBuf],
) -> Option<PathBuf> {
    match op {
        PlanOp::Delete(path) => failed_deletes
            .iter()
            .find(|p| p.starts_with(path) && p.as_path() != path.as_path())
            .cloned(),
        _ => failed_dirs
            .iter()
            .find(|dir| op.path().starts_with(dir))
            .cloned()
            .or_else(|| {
                failed_deletes
                    .iter()
                    .find(|p| op.path().starts_with(p))
                    .cloned()
            }),
    }
}

fn attempt_with_retry(
    remote: &dyn RemoteFs,
    local_root: &Path,
    remote_root: &Path,
    op: &PlanOp,
    options: &ExecuteOptions,
) -> (u32, Result<(), OpError>) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match apply_op(remote, local_root, remote_root, op, options) {
            Ok(()) => return (attempt, Ok(())),
            Err(error) if error.is_transient() && attempt < options.max_attempts => {
                let delay = options.backoff * 2u32.saturating_pow(attempt - 1);
                warn!(
                    "{} {} attempt {}/{} failed ({}), retrying in {:?}",
                    op.kind().label(),
                    op.path().display(),
                    attempt,
                    options.max_attempts,
                    error,
                    delay
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
            Err(error) => return (attempt, Err(error)),
        }
    }
}

fn apply_op(
    remote: &dyn RemoteFs,
    local_root: &Path,
    remote_root: &Path,
    op: &PlanOp,
    options: &ExecuteOptions,
) -> Result<(), OpError> {
    match op {
        PlanOp::CreateDir(path) => remote.mkdir(&remote_root.join(path)),
        PlanOp::Delete(path) => remote.remove(&remote_root.join(path)),
        PlanOp::SetPermissions(path, mode) => remote.chmod(&remote_root.join(path), *mode),
        PlanOp::Upload(entry) => upload_file(remote, local_root, remote_root, entry, options),
    }
}

/// Stream one file to the remote side and verify the result
///
/// The file is never loaded wholly into memory. After the write completes the
/// remote size and content hash are read back and compared against the local
/// entry; a mismatch is a transient `HashMismatch` so the retry policy gets
/// another chance at a clean transfer.
fn upload_file(
    remote: &dyn RemoteFs,
    local_root: &Path,
    remote_root: &Path,
    entry: &FileEntry,
    options: &ExecuteOptions,
) -> Result<(), OpError> {
    let local_path = local_root.join(&entry.path);
    let remote_path = remote_root.join(&entry.path);

    let file = File::open(&local_path).map_err(|e| io_to_op(&e))?;
    let mut reader = BufReader::new(file);

    {
        let mut writer = remote.open_write(&remote_path, entry.mode)?;
        let mut buf = vec![0u8; options.chunk_size];
        loop {
            let n = reader.read(&mut buf).map_err(|e| io_to_op(&e))?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).map_err(|e| io_to_op(&e))?;
        }
        writer.flush().map_err(|e| io_to_op(&e))?;
        // Writer drop closes the remote handle.
    }

    // Verify size, then content.
    let stat = remote.stat(&remote_path)?;
    if stat.size != entry.size {
        return Err(OpError::HashMismatch {
            expected: format!("{} bytes", entry.size),
            actual: format!("{} bytes", stat.size),
        });
    }
    let remote_hash = hash_reader(remote.open_read(&remote_path)?).map_err(|e| io_to_op(&e))?;
    if remote_hash != entry.hash {
        return Err(OpError::HashMismatch {
            expected: entry.hash.clone(),
            actual: remote_hash,
        });
    }

    remote.chmod(&remote_path, entry.mode)
}
