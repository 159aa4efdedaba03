//! Transfer planning: diff local files against the remote snapshot
//!
//! Stage 1 of the pipeline. Pure logic, no IO: given the local
//! [`FileEntry`] set and a [`RemoteState`], compute the minimal ordered
//! operation sequence that makes the remote tree match.
//!
//! Ordering invariants encoded in the plan:
//! - all deletes come first, children before parents (depth descending)
//! - directories are created before anything beneath them (depth ascending)
//! - a path that changes type (file↔directory) is deleted and recreated,
//!   never overwritten in place
//! - ties are broken lexicographically so plans are deterministic

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::local::FileEntry;
use crate::remote::RemoteState;
use crate::sync::OpKind;

/// One planned operation; paths are relative to the remote target root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOp {
    CreateDir(PathBuf),
    Upload(FileEntry),
    Delete(PathBuf),
    SetPermissions(PathBuf, u32),
}

impl PlanOp {
    pub fn path(&self) -> &Path {
        match self {
            PlanOp::CreateDir(p) | PlanOp::Delete(p) | PlanOp::SetPermissions(p, _) => p,
            PlanOp::Upload(entry) => &entry.path,
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            PlanOp::CreateDir(_) => OpKind::CreateDir,
            PlanOp::Upload(_) => OpKind::Upload,
            PlanOp::Delete(_) => OpKind::Delete,
            PlanOp::SetPermissions(_, _) => OpKind::SetPermissions,
        }
    }
}

impl fmt::Display for PlanOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanOp::CreateDir(p) => write!(f, "mkdir  {}", p.display()),
            PlanOp::Upload(e) => write!(f, "upload {} ({} bytes)", e.path.display(), e.size),
            PlanOp::Delete(p) => write!(f, "delete {}", p.display()),
            PlanOp::SetPermissions(p, mode) => write!(f, "chmod  {} {:o}", p.display(), mode),
        }
    }
}

/// Ordered sequence of operations produced by [`plan`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferPlan {
    pub ops: Vec<PlanOp>,
}

impl TransferPlan {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlanOp> {
        self.ops.iter()
    }
}

/// Planning knobs
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOptions {
    /// Delete remote paths that have no local counterpart
    pub delete_extraneous: bool,
}

fn depth(path: &Path) -> usize {
    path.components().count()
}

/// Proper ancestors of a relative path, excluding the empty root
fn parent_dirs(path: &Path) -> impl Iterator<Item = &Path> {
    path.ancestors()
        .skip(1)
        .filter(|p| !p.as_os_str().is_empty())
}

/// Compute the minimal operation sequence to make the remote tree match
/// the local file set.
///
/// Classification per local file: `Unchanged` when the remote hash matches
/// (permission drift yields `SetPermissions`), `Upload` when the hash
/// differs, is unknown, or the remote entry is absent. Type changes are
/// planned as delete-then-recreate. With `delete_extraneous`, remote paths
/// without a local counterpart are deleted, children before parents.
pub fn plan(local: &[FileEntry], remote: &RemoteState, options: PlanOptions) -> TransferPlan {
    let local_files: BTreeMap<&Path, &FileEntry> =
        local.iter().map(|e| (e.path.as_path(), e)).collect();

    // Directories implied by the local file set
    let local_dirs: BTreeSet<&Path> = local
        .iter()
        .flat_map(|e| parent_dirs(&e.path))
        .collect();

    let mut deletes: BTreeSet<PathBuf> = BTreeSet::new();

    // Type changes: local file where the remote has a directory. The whole
    // remote subtree underneath has to go.
    for path in local_files.keys() {
        if remote.get(path).is_some_and(|m| m.is_dir) {
            for (remote_path, _) in remote.iter() {
                if remote_path.as_path() == *path || remote_path.starts_with(path) {
                    deletes.insert(remote_path.clone());
                }
            }
        }
    }

    // Type changes the other way: a local directory where the remote has a
    // file.
    for dir in &local_dirs {
        if remote.get(dir).is_some_and(|m| !m.is_dir) {
            deletes.insert(dir.to_path_buf());
        }
    }

    if options.delete_extraneous {
        for (remote_path, _) in remote.iter() {
            let p = remote_path.as_path();
            if !local_files.contains_key(p) && !local_dirs.contains(p) {
                deletes.insert(remote_path.clone());
            }
        }
    }

    // Uploads and permission fixes
    let mut uploads: Vec<&FileEntry> = Vec::new();
    let mut perm_fixes: Vec<(PathBuf, u32)> = Vec::new();
    for entry in local_files.values() {
        match remote.get(&entry.path) {
            None => uploads.push(entry),
            Some(meta) if meta.is_dir => uploads.push(entry),
            Some(meta) => match &meta.hash {
                Some(hash) if *hash == entry.hash => {
                    if meta.perm.is_some_and(|p| p & 0o7777 != entry.mode) {
                        perm_fixes.push((entry.path.clone(), entry.mode));
                    }
                }
                _ => uploads.push(entry),
            },
        }
    }

    // Directories needed by the uploads, deduplicated; a directory already
    // present remotely is only recreated when it is part of the delete set.
    let mut create_dirs: BTreeSet<PathBuf> = BTreeSet::new();
    for entry in &uploads {
        for dir in parent_dirs(&entry.path) {
            let exists_as_dir =
                remote.get(dir).is_some_and(|m| m.is_dir) && !deletes.contains(dir);
            if !exists_as_dir {
                create_dirs.insert(dir.to_path_buf());
            }
        }
    }

    // Assemble in dependency order
    let mut ops = Vec::with_capacity(
        deletes.len() + create_dirs.len() + uploads.len() + perm_fixes.len(),
    );

    let mut deletes: Vec<PathBuf> = deletes.into_iter().collect();
    deletes.sort_by_key(|p| (Reverse(depth(p)), p.clone()));
    ops.extend(deletes.into_iter().map(PlanOp::Delete));

    let mut create_dirs: Vec<PathBuf> = create_dirs.into_iter().collect();
    create_dirs.sort_by_key(|p| (depth(p), p.clone()));
    ops.extend(create_dirs.into_iter().map(PlanOp::CreateDir));

    uploads.sort_by_key(|e| (depth(&e.path), e.path.clone()));
    ops.extend(uploads.into_iter().map(|e| PlanOp::Upload(e.clone())));

    perm_fixes.sort();
    ops.extend(
        perm_fixes
            .into_iter()
            .map(|(p, mode)| PlanOp::SetPermissions(p, mode)),
    );

    TransferPlan { ops }
}
