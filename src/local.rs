//! Local source tree scanning
//!
//! Walks the configured source directory and produces one [`FileEntry`] per
//! regular file, with content hash, size, mtime, and permission bits.
//! Walking and hashing run in parallel; results land in an append-only
//! mutex-guarded collection and are sorted before planning so the output is
//! deterministic.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use ignore::{WalkBuilder, WalkState};
use sha2::{Digest, Sha256};

use crate::error::{SyncError, SyncResult};

/// One local file considered for transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the source root
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Content hash, `sha256:<hex>`
    pub hash: String,
    /// Modification time in unix seconds, if the platform reports one
    pub mtime: Option<u64>,
    /// Target permission bits
    pub mode: u32,
}

/// Hash a byte stream into the `sha256:<hex>` format
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

/// Hash a local file's content
pub fn hash_file(path: &Path) -> io::Result<String> {
    hash_reader(BufReader::new(File::open(path)?))
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

/// Walk the source tree and build the local file set
///
/// Every regular file below `root` is included (hidden files too; artifact
/// trees are deployed verbatim). Entries come back sorted by relative path.
pub fn walk_local(root: &Path) -> SyncResult<Vec<FileEntry>> {
    if !root.is_dir() {
        return Err(SyncError::LocalWalkFailed {
            path: root.to_path_buf(),
            message: "not a directory".to_string(),
        });
    }

    let entries: Arc<Mutex<Vec<FileEntry>>> = Arc::new(Mutex::new(Vec::new()));
    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let root_buf = root.to_path_buf();

    WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .ignore(false)
        .parents(false)
        .build_parallel()
        .run(|| {
            let entries = Arc::clone(&entries);
            let errors = Arc::clone(&errors);
            let root = root_buf.clone();
            Box::new(move |result| {
                let dirent = match result {
                    Ok(d) => d,
                    Err(e) => {
                        errors.lock().unwrap().push(e.to_string());
                        return WalkState::Quit;
                    }
                };
                let is_file = dirent.file_type().map(|t| t.is_file()).unwrap_or(false);
                if !is_file {
                    return WalkState::Continue;
                }
                match scan_file(&root, dirent.path()) {
                    Ok(entry) => entries.lock().unwrap().push(entry),
                    Err(e) => {
                        errors
                            .lock()
                            .unwrap()
                            .push(format!("{}: {}", dirent.path().display(), e));
                        return WalkState::Quit;
                    }
                }
                WalkState::Continue
            })
        });

    let errors = errors.lock().unwrap();
    if let Some(first) = errors.first() {
        return Err(SyncError::LocalWalkFailed {
            path: root.to_path_buf(),
            message: first.clone(),
        });
    }

    let mut entries = Arc::try_unwrap(entries)
        .map(|m| m.into_inner().unwrap())
        .unwrap_or_default();
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn scan_file(root: &Path, path: &Path) -> io::Result<FileEntry> {
    let metadata = path.metadata()?;
    let rel = path
        .strip_prefix(root)
        .map_err(|e| io::Error::other(e.to_string()))?
        .to_path_buf();
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs());

    Ok(FileEntry {
        path: rel,
        size: metadata.len(),
        hash: hash_file(path)?,
        mtime,
        mode: file_mode(&metadata),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn walk_collects_files_with_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "index.html", "<html></html>");
        write(dir.path(), "css/app.css", "body {}");
        write(dir.path(), "css/print.css", "@media print {}");

        let entries = walk_local(dir.path()).unwrap();

        let paths: Vec<_> = entries.iter().map(|e| e.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("css/app.css"),
                PathBuf::from("css/print.css"),
                PathBuf::from("index.html"),
            ]
        );
    }

    #[test]
    fn walk_includes_hidden_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".htaccess", "Deny from all");

        let entries = walk_local(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, PathBuf::from(".htaccess"));
    }

    #[test]
    fn entries_carry_size_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "hello");

        let entries = walk_local(dir.path()).unwrap();
        assert_eq!(entries[0].size, 5);
        assert!(entries[0].hash.starts_with("sha256:"));
        // Well-known digest of "hello"
        assert_eq!(
            entries[0].hash,
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn identical_content_hashes_identically() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "same bytes");
        write(dir.path(), "b.txt", "same bytes");

        let entries = walk_local(dir.path()).unwrap();
        assert_eq!(entries[0].hash, entries[1].hash);
    }

    #[test]
    fn missing_root_is_a_walk_failure() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let err = walk_local(&missing).unwrap_err();
        assert!(matches!(err, SyncError::LocalWalkFailed { .. }));
    }

    #[test]
    fn empty_tree_yields_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        assert!(walk_local(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn hash_reader_matches_hash_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "x.bin", "chunked content");
        let from_file = hash_file(&dir.path().join("x.bin")).unwrap();
        let from_reader = hash_reader("chunked content".as_bytes()).unwrap();
        assert_eq!(from_file, from_reader);
    }
}
