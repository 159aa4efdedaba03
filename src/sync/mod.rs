//! Sync pipeline: plan, execute, orchestrate
//!
//! The pipeline is split in two stages so callers can preview work without
//! touching the remote side:
//! - Stage 1: [`plan::plan`] diffs the local file set against the remote
//!   snapshot, producing an ordered [`plan::TransferPlan`] (no writes).
//! - Stage 2: [`execute::execute`] applies the plan over a [`RemoteFs`]
//!   session, recording one [`OpRecord`] per operation.
//!
//! [`engine::SyncEngine`] wires both stages to a live session.
//!
//! [`RemoteFs`]: crate::remote::RemoteFs

pub mod engine;
pub mod execute;
pub mod plan;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::OpError;

pub use engine::SyncEngine;
pub use execute::{execute, ExecuteOptions};
pub use plan::{plan, PlanOp, PlanOptions, TransferPlan};

/// Run-scoped cancellation signal
///
/// Checked between plan operations; cancelling never interrupts an operation
/// midway. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Kind of a plan operation, for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    CreateDir,
    Upload,
    Delete,
    SetPermissions,
}

impl OpKind {
    pub fn label(&self) -> &'static str {
        match self {
            OpKind::CreateDir => "mkdir",
            OpKind::Upload => "upload",
            OpKind::Delete => "delete",
            OpKind::SetPermissions => "chmod",
        }
    }
}

/// Outcome of one executed operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpStatus {
    /// Succeeded on the first attempt
    Succeeded,
    /// Succeeded after `n` retries
    Retried(u32),
    /// Failed; `attempts` is how many attempts were consumed
    Failed { attempts: u32, error: OpError },
}

impl OpStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, OpStatus::Failed { .. })
    }
}

/// One operation's record in the run result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRecord {
    /// Path relative to the remote target root
    pub path: PathBuf,
    pub kind: OpKind,
    pub status: OpStatus,
}

/// Aggregate outcome of a sync run, immutable once produced
///
/// Always reports enough per-path detail to diagnose a failed run without
/// re-running it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferResult {
    pub records: Vec<OpRecord>,
    /// Set when a permanent failure aborted the remaining plan
    pub aborted: bool,
}

impl TransferResult {
    /// Operations that succeeded on the first attempt or after retries
    pub fn succeeded(&self) -> usize {
        self.records
            .iter()
            .filter(|r| !r.status.is_failed())
            .count()
    }

    /// Operations that needed at least one retry before succeeding
    pub fn retried(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r.status, OpStatus::Retried(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.records.iter().filter(|r| r.status.is_failed()).count()
    }

    pub fn is_success(&self) -> bool {
        !self.aborted && self.failed() == 0
    }

    /// Failed records with their reasons
    pub fn failures(&self) -> impl Iterator<Item = (&OpRecord, &OpError)> {
        self.records.iter().filter_map(|r| match &r.status {
            OpStatus::Failed { error, .. } => Some((r, error)),
            _ => None,
        })
    }
}
