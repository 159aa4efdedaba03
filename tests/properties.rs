//! Property tests for sftp-sync.
//!
//! Properties use randomized input generation to explore edge cases and
//! protect planner invariants like "plans are deterministic" and "a plan
//! applied to a matching remote is empty".
//!
//! Run with: `cargo test --test properties`

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use proptest::prelude::*;

use sftp_sync::local::FileEntry;
use sftp_sync::remote::RemoteState;
use sftp_sync::sync::plan::{plan, PlanOp, PlanOptions};

fn segment() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z0-9][a-z0-9._-]{0,8}").unwrap()
}

fn rel_path() -> impl Strategy<Value = PathBuf> {
    proptest::collection::vec(segment(), 1..=3).prop_map(|segments| segments.iter().collect())
}

/// A small local file set with unique, non-nested paths
fn file_set() -> impl Strategy<Value = Vec<FileEntry>> {
    proptest::collection::vec((rel_path(), "[a-f0-9]{8}"), 0..12).prop_map(|raw| {
        let mut seen: BTreeSet<PathBuf> = BTreeSet::new();
        raw.into_iter()
            .filter(|(path, _)| {
                // A path can't be both a file and a directory of another file.
                let clash = seen
                    .iter()
                    .any(|s| s.starts_with(path) || path.starts_with(s.as_path()));
                !clash && seen.insert(path.clone())
            })
            .map(|(path, digest)| FileEntry {
                path,
                size: digest.len() as u64,
                hash: format!("sha256:{digest}"),
                mtime: Some(1_700_000_000),
                mode: 0o644,
            })
            .collect()
    })
}

fn depth(path: &Path) -> usize {
    path.components().count()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    /// PROPERTY: against an empty remote, every local file is uploaded and
    /// every needed directory is created exactly once, parents first.
    #[test]
    fn property_empty_remote_uploads_everything(local in file_set()) {
        let result = plan(&local, &RemoteState::default(), PlanOptions::default());

        let uploads: Vec<_> = result
            .iter()
            .filter_map(|op| match op {
                PlanOp::Upload(e) => Some(e.path.clone()),
                _ => None,
            })
            .collect();
        let mut expected: Vec<_> = local.iter().map(|e| e.path.clone()).collect();
        expected.sort_by_key(|p| (depth(p), p.clone()));
        prop_assert_eq!(uploads, expected);

        // No deletes, no chmods against an empty remote.
        prop_assert!(result
            .iter()
            .all(|op| matches!(op, PlanOp::Upload(_) | PlanOp::CreateDir(_))));

        // Each directory at most once, and before anything beneath it.
        let mut created = BTreeSet::new();
        let mut position = BTreeMap::new();
        for (i, op) in result.iter().enumerate() {
            if let PlanOp::CreateDir(dir) = op {
                prop_assert!(created.insert(dir.clone()), "duplicate mkdir {:?}", dir);
                position.insert(dir.clone(), i);
            }
        }
        for (i, op) in result.iter().enumerate() {
            for ancestor in op.path().ancestors().skip(1) {
                if let Some(&j) = position.get(ancestor) {
                    prop_assert!(j < i, "{:?} planned before its directory", op.path());
                }
            }
        }
    }

    /// PROPERTY: a remote that already mirrors the local set plans nothing.
    #[test]
    fn property_matching_remote_is_a_fixpoint(local in file_set()) {
        let remote = RemoteState::mirroring(&local);
        let result = plan(&local, &remote, PlanOptions { delete_extraneous: true });
        prop_assert!(result.is_empty(), "non-empty plan: {:?}", result.ops);
    }

    /// PROPERTY: planning is deterministic and insensitive to input order.
    #[test]
    fn property_plan_is_deterministic(local in file_set()) {
        let reversed: Vec<_> = local.iter().rev().cloned().collect();
        let forward = plan(&local, &RemoteState::default(), PlanOptions::default());
        let backward = plan(&reversed, &RemoteState::default(), PlanOptions::default());
        prop_assert_eq!(forward, backward);
    }

    /// PROPERTY: with delete_extraneous, every delete precedes every other
    /// operation and children are deleted before their parents.
    #[test]
    fn property_deletes_come_first_children_before_parents(
        local in file_set(),
        stale in file_set(),
    ) {
        let remote = RemoteState::mirroring(&stale);
        let result = plan(&local, &remote, PlanOptions { delete_extraneous: true });

        let mut seen_non_delete = false;
        let mut deleted: Vec<PathBuf> = Vec::new();
        for op in result.iter() {
            match op {
                PlanOp::Delete(path) => {
                    prop_assert!(!seen_non_delete, "delete after non-delete");
                    for earlier in &deleted {
                        prop_assert!(
                            !path.starts_with(earlier) || earlier == path,
                            "child {:?} deleted after parent {:?}", path, earlier
                        );
                    }
                    deleted.push(path.clone());
                }
                _ => seen_non_delete = true,
            }
        }
    }
}
