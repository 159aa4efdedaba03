//! Remote filesystem capability
//!
//! The planner and executor never talk to libssh2 directly; they go through
//! the [`RemoteFs`] trait, which models the external SFTP library as the six
//! operations the engine needs. The real implementation lives in
//! [`crate::session::SftpRemoteFs`]; [`MemoryRemoteFs`] is an in-memory fake
//! with failure injection so the whole sync pipeline is testable without a
//! network.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::error::OpError;
use crate::local::{hash_reader, FileEntry};

/// One entry as reported by the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Full remote path
    pub path: PathBuf,
    pub size: u64,
    pub mtime: Option<u64>,
    pub perm: Option<u32>,
    pub is_dir: bool,
}

/// Capability interface over the remote filesystem
///
/// Every method fails with the transient/permanent [`OpError`] taxonomy;
/// connection-level failures surface as `NetworkInterrupted` and are handled
/// by the executor's retry policy.
pub trait RemoteFs {
    /// List the entries directly under a directory
    fn list(&self, dir: &Path) -> Result<Vec<RemoteEntry>, OpError>;

    /// Stat a single path
    fn stat(&self, path: &Path) -> Result<RemoteEntry, OpError>;

    /// Open a file for streamed reading
    fn open_read(&self, path: &Path) -> Result<Box<dyn Read>, OpError>;

    /// Open (create or truncate) a file for streamed writing
    fn open_write(&self, path: &Path, mode: u32) -> Result<Box<dyn Write>, OpError>;

    /// Create a directory; succeeds if it already exists as a directory
    fn mkdir(&self, path: &Path) -> Result<(), OpError>;

    /// Remove a file or an empty directory
    fn remove(&self, path: &Path) -> Result<(), OpError>;

    /// Set permission bits
    fn chmod(&self, path: &Path, mode: u32) -> Result<(), OpError>;
}

/// Metadata snapshot for one remote path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMeta {
    pub size: u64,
    /// Content hash; `None` when the file could not be read
    pub hash: Option<String>,
    pub mtime: Option<u64>,
    pub perm: Option<u32>,
    pub is_dir: bool,
}

/// Read-only snapshot of the remote target tree, keyed by path relative to
/// the target root. Rebuilt from scratch each run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteState {
    entries: BTreeMap<PathBuf, RemoteMeta>,
}

impl RemoteState {
    /// Build a snapshot by recursively listing `root` and hashing file
    /// contents. A missing root reads as an empty snapshot; the orchestrator
    /// creates it before executing.
    pub fn fetch(remote: &dyn RemoteFs, root: &Path) -> Result<Self, OpError> {
        match remote.stat(root) {
            Ok(entry) if entry.is_dir => {}
            Ok(_) => {
                return Err(OpError::InvalidPath(format!(
                    "{} exists but is not a directory",
                    root.display()
                )))
            }
            Err(OpError::InvalidPath(_)) => return Ok(Self::default()),
            Err(e) => return Err(e),
        }

        let mut state = Self::default();
        state.fetch_dir(remote, root, root)?;
        Ok(state)
    }

    fn fetch_dir(&mut self, remote: &dyn RemoteFs, root: &Path, dir: &Path) -> Result<(), OpError> {
        for entry in remote.list(dir)? {
            let rel = match entry.path.strip_prefix(root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            if entry.is_dir {
                self.entries.insert(
                    rel,
                    RemoteMeta {
                        size: 0,
                        hash: None,
                        mtime: entry.mtime,
                        perm: entry.perm,
                        is_dir: true,
                    },
                );
                self.fetch_dir(remote, root, &entry.path)?;
            } else {
                let hash = match remote.open_read(&entry.path).and_then(|r| {
                    hash_reader(r).map_err(|e| OpError::NetworkInterrupted(e.to_string()))
                }) {
                    Ok(h) => Some(h),
                    Err(e) => {
                        warn!("could not hash remote {}: {}", entry.path.display(), e);
                        None
                    }
                };
                self.entries.insert(
                    rel,
                    RemoteMeta {
                        size: entry.size,
                        hash,
                        mtime: entry.mtime,
                        perm: entry.perm,
                        is_dir: false,
                    },
                );
            }
        }
        Ok(())
    }

    /// Snapshot that exactly mirrors a local file set (files plus the
    /// directories implied by their parents). Useful for idempotence checks.
    pub fn mirroring(entries: &[FileEntry]) -> Self {
        let mut state = Self::default();
        for entry in entries {
            for ancestor in entry.path.ancestors().skip(1) {
                if ancestor.as_os_str().is_empty() {
                    continue;
                }
                state.entries.insert(
                    ancestor.to_path_buf(),
                    RemoteMeta {
                        size: 0,
                        hash: None,
                        mtime: None,
                        perm: None,
                        is_dir: true,
                    },
                );
            }
            state.entries.insert(
                entry.path.clone(),
                RemoteMeta {
                    size: entry.size,
                    hash: Some(entry.hash.clone()),
                    mtime: entry.mtime,
                    perm: Some(entry.mode),
                    is_dir: false,
                },
            );
        }
        state
    }

    /// Snapshot from explicit entries (test helper)
    pub fn from_entries(entries: impl IntoIterator<Item = (PathBuf, RemoteMeta)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, path: &Path) -> Option<&RemoteMeta> {
        self.entries.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &RemoteMeta)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
enum MemNode {
    Dir,
    File {
        data: Vec<u8>,
        mode: u32,
        mtime: Option<u64>,
    },
}

#[derive(Default)]
struct MemInner {
    nodes: BTreeMap<PathBuf, MemNode>,
    /// Queued failures keyed by (operation, path), consumed one per call
    failures: HashMap<(String, PathBuf), VecDeque<OpError>>,
    /// Writes whose committed bytes get a flipped byte, per path
    corrupt_writes: HashMap<PathBuf, u32>,
}

/// In-memory [`RemoteFs`] with failure injection
///
/// Paths are treated as opaque absolute paths; the root `/` always exists.
/// Cloning shares the underlying state, mirroring a shared remote host.
#[derive(Clone, Default)]
pub struct MemoryRemoteFs {
    inner: Arc<Mutex<MemInner>>,
}

impl MemoryRemoteFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a directory (parents included)
    pub fn seed_dir(&self, path: &Path) {
        let mut inner = self.inner.lock().unwrap();
        for ancestor in ancestors_bottom_up(path) {
            inner.nodes.insert(ancestor, MemNode::Dir);
        }
    }

    /// Seed a file with content and mode, creating parent directories
    pub fn seed_file(&self, path: &Path, content: &[u8], mode: u32) {
        if let Some(parent) = path.parent() {
            self.seed_dir(parent);
        }
        self.inner.lock().unwrap().nodes.insert(
            path.to_path_buf(),
            MemNode::File {
                data: content.to_vec(),
                mode,
                mtime: None,
            },
        );
    }

    /// Queue `times` copies of `error` for the next calls of `op` on `path`
    ///
    /// `op` is one of `list`, `stat`, `open_read`, `open_write`, `mkdir`,
    /// `remove`, `chmod`.
    pub fn inject_failures(&self, op: &str, path: &Path, error: OpError, times: u32) {
        let mut inner = self.inner.lock().unwrap();
        let queue = inner
            .failures
            .entry((op.to_string(), path.to_path_buf()))
            .or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Corrupt the next `times` committed writes to `path` (one byte flipped)
    pub fn corrupt_next_writes(&self, path: &Path, times: u32) {
        self.inner
            .lock()
            .unwrap()
            .corrupt_writes
            .insert(path.to_path_buf(), times);
    }

    /// Whether a path currently exists (as file or directory)
    pub fn contains(&self, path: &Path) -> bool {
        self.inner.lock().unwrap().nodes.contains_key(path)
    }

    pub fn is_dir(&self, path: &Path) -> bool {
        matches!(
            self.inner.lock().unwrap().nodes.get(path),
            Some(MemNode::Dir)
        )
    }

    /// Current content of a remote file, if present
    pub fn file_content(&self, path: &Path) -> Option<Vec<u8>> {
        match self.inner.lock().unwrap().nodes.get(path) {
            Some(MemNode::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Current mode of a remote file, if present
    pub fn file_mode(&self, path: &Path) -> Option<u32> {
        match self.inner.lock().unwrap().nodes.get(path) {
            Some(MemNode::File { mode, .. }) => Some(*mode),
            _ => None,
        }
    }

    /// All stored paths, sorted (assertion helper)
    pub fn paths(&self) -> Vec<PathBuf> {
        self.inner.lock().unwrap().nodes.keys().cloned().collect()
    }

    fn take_failure(&self, op: &str, path: &Path) -> Option<OpError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (op.to_string(), path.to_path_buf());
        let error = inner.failures.get_mut(&key).and_then(|q| q.pop_front());
        let drained = inner.failures.get(&key).is_some_and(|q| q.is_empty());
        if drained {
            inner.failures.remove(&key);
        }
        error
    }
}

fn ancestors_bottom_up(path: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = path
        .ancestors()
        .filter(|p| !p.as_os_str().is_empty() && *p != Path::new("/"))
        .map(|p| p.to_path_buf())
        .collect();
    dirs.reverse();
    dirs
}

fn is_root(path: &Path) -> bool {
    path == Path::new("/") || path.as_os_str().is_empty()
}

struct MemWriter {
    fs: MemoryRemoteFs,
    path: PathBuf,
    mode: u32,
    buf: Vec<u8>,
}

impl Write for MemWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for MemWriter {
    fn drop(&mut self) {
        let mut inner = self.fs.inner.lock().unwrap();
        let mut data = std::mem::take(&mut self.buf);
        if let Some(remaining) = inner.corrupt_writes.get_mut(&self.path) {
            if *remaining > 0 {
                *remaining -= 1;
                if let Some(byte) = data.first_mut() {
                    *byte ^= 0xff;
                } else {
                    data.push(0xff);
                }
            }
        }
        inner.nodes.insert(
            self.path.clone(),
            MemNode::File {
                data,
                mode: self.mode,
                mtime: None,
            },
        );
    }
}

impl RemoteFs for MemoryRemoteFs {
    fn list(&self, dir: &Path) -> Result<Vec<RemoteEntry>, OpError> {
        if let Some(e) = self.take_failure("list", dir) {
            return Err(e);
        }
        let inner = self.inner.lock().unwrap();
        if !is_root(dir) {
            match inner.nodes.get(dir) {
                Some(MemNode::Dir) => {}
                Some(MemNode::File { .. }) => {
                    return Err(OpError::InvalidPath(format!(
                        "{} is not a directory",
                        dir.display()
                    )))
                }
                None => {
                    return Err(OpError::InvalidPath(format!(
                        "no such directory: {}",
                        dir.display()
                    )))
                }
            }
        }
        let mut entries = Vec::new();
        for (path, node) in inner.nodes.iter() {
            let Ok(rel) = path.strip_prefix(dir) else {
                continue;
            };
            if rel.components().count() != 1 {
                continue;
            }
            entries.push(match node {
                MemNode::Dir => RemoteEntry {
                    path: path.clone(),
                    size: 0,
                    mtime: None,
                    perm: Some(0o755),
                    is_dir: true,
                },
                MemNode::File { data, mode, mtime } => RemoteEntry {
                    path: path.clone(),
                    size: data.len() as u64,
                    mtime: *mtime,
                    perm: Some(*mode),
                    is_dir: false,
                },
            });
        }
        Ok(entries)
    }

    fn stat(&self, path: &Path) -> Result<RemoteEntry, OpError> {
        if let Some(e) = self.take_failure("stat", path) {
            return Err(e);
        }
        if is_root(path) {
            return Ok(RemoteEntry {
                path: PathBuf::from("/"),
                size: 0,
                mtime: None,
                perm: Some(0o755),
                is_dir: true,
            });
        }
        let inner = self.inner.lock().unwrap();
        match inner.nodes.get(path) {
            Some(MemNode::Dir) => Ok(RemoteEntry {
                path: path.to_path_buf(),
                size: 0,
                mtime: None,
                perm: Some(0o755),
                is_dir: true,
            }),
            Some(MemNode::File { data, mode, mtime }) => Ok(RemoteEntry {
                path: path.to_path_buf(),
                size: data.len() as u64,
                mtime: *mtime,
                perm: Some(*mode),
                is_dir: false,
            }),
            None => Err(OpError::InvalidPath(format!(
                "no such path: {}",
                path.display()
            ))),
        }
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read>, OpError> {
        if let Some(e) = self.take_failure("open_read", path) {
            return Err(e);
        }
        match self.file_content(path) {
            Some(data) => Ok(Box::new(Cursor::new(data))),
            None => Err(OpError::InvalidPath(format!(
                "no such file: {}",
                path.display()
            ))),
        }
    }

    fn open_write(&self, path: &Path, mode: u32) -> Result<Box<dyn Write>, OpError> {
        if let Some(e) = self.take_failure("open_write", path) {
            return Err(e);
        }
        {
            let inner = self.inner.lock().unwrap();
            let parent_ok = path.parent().map(is_root).unwrap_or(true)
                || path
                    .parent()
                    .map(|p| matches!(inner.nodes.get(p), Some(MemNode::Dir)))
                    .unwrap_or(false);
            if !parent_ok {
                return Err(OpError::InvalidPath(format!(
                    "parent directory missing for {}",
                    path.display()
                )));
            }
            if matches!(inner.nodes.get(path), Some(MemNode::Dir)) {
                return Err(OpError::InvalidPath(format!(
                    "{} is a directory",
                    path.display()
                )));
            }
        }
        Ok(Box::new(MemWriter {
            fs: self.clone(),
            path: path.to_path_buf(),
            mode,
            buf: Vec::new(),
        }))
    }

    fn mkdir(&self, path: &Path) -> Result<(), OpError> {
        if let Some(e) = self.take_failure("mkdir", path) {
            return Err(e);
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.nodes.get(path) {
            Some(MemNode::Dir) => return Ok(()), // idempotent
            Some(MemNode::File { .. }) => {
                return Err(OpError::InvalidPath(format!(
                    "{} exists as a file",
                    path.display()
                )))
            }
            None => {}
        }
        let parent_ok = match path.parent() {
            None => true,
            Some(p) if is_root(p) => true,
            Some(p) => matches!(inner.nodes.get(p), Some(MemNode::Dir)),
        };
        if !parent_ok {
            return Err(OpError::InvalidPath(format!(
                "parent directory missing for {}",
                path.display()
            )));
        }
        inner.nodes.insert(path.to_path_buf(), MemNode::Dir);
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<(), OpError> {
        if let Some(e) = self.take_failure("remove", path) {
            return Err(e);
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.nodes.get(path) {
            Some(MemNode::File { .. }) => {
                inner.nodes.remove(path);
                Ok(())
            }
            Some(MemNode::Dir) => {
                let has_children = inner
                    .nodes
                    .keys()
                    .any(|p| p != path && p.starts_with(path));
                if has_children {
                    return Err(OpError::InvalidPath(format!(
                        "directory not empty: {}",
                        path.display()
                    )));
                }
                inner.nodes.remove(path);
                Ok(())
            }
            None => Err(OpError::InvalidPath(format!(
                "no such path: {}",
                path.display()
            ))),
        }
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<(), OpError> {
        if let Some(e) = self.take_failure("chmod", path) {
            return Err(e);
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.nodes.get_mut(path) {
            Some(MemNode::File { mode: m, .. }) => {
                *m = mode;
                Ok(())
            }
            Some(MemNode::Dir) => Ok(()),
            None => Err(OpError::InvalidPath(format!(
                "no such path: {}",
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_and_stat_roundtrip() {
        let fs = MemoryRemoteFs::new();
        fs.seed_file(Path::new("/srv/app/index.html"), b"<html>", 0o644);

        let entry = fs.stat(Path::new("/srv/app/index.html")).unwrap();
        assert!(!entry.is_dir);
        assert_eq!(entry.size, 6);
        assert!(fs.is_dir(Path::new("/srv/app")));
    }

    #[test]
    fn list_returns_direct_children_only() {
        let fs = MemoryRemoteFs::new();
        fs.seed_file(Path::new("/srv/a.txt"), b"a", 0o644);
        fs.seed_file(Path::new("/srv/sub/b.txt"), b"b", 0o644);

        let names: Vec<_> = fs
            .list(Path::new("/srv"))
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(
            names,
            vec![PathBuf::from("/srv/a.txt"), PathBuf::from("/srv/sub")]
        );
    }

    #[test]
    fn mkdir_is_idempotent_but_rejects_files() {
        let fs = MemoryRemoteFs::new();
        fs.mkdir(Path::new("/srv")).unwrap();
        fs.mkdir(Path::new("/srv")).unwrap();

        fs.seed_file(Path::new("/srv/f"), b"x", 0o644);
        assert!(matches!(
            fs.mkdir(Path::new("/srv/f")),
            Err(OpError::InvalidPath(_))
        ));
    }

    #[test]
    fn mkdir_requires_parent() {
        let fs = MemoryRemoteFs::new();
        assert!(matches!(
            fs.mkdir(Path::new("/a/b/c")),
            Err(OpError::InvalidPath(_))
        ));
    }

    #[test]
    fn remove_rejects_non_empty_directories() {
        let fs = MemoryRemoteFs::new();
        fs.seed_file(Path::new("/srv/sub/f"), b"x", 0o644);

        assert!(fs.remove(Path::new("/srv/sub")).is_err());
        fs.remove(Path::new("/srv/sub/f")).unwrap();
        fs.remove(Path::new("/srv/sub")).unwrap();
        assert!(!fs.contains(Path::new("/srv/sub")));
    }

    #[test]
    fn write_then_read_back() {
        let fs = MemoryRemoteFs::new();
        fs.seed_dir(Path::new("/srv"));
        {
            let mut w = fs.open_write(Path::new("/srv/out.bin"), 0o600).unwrap();
            w.write_all(b"payload").unwrap();
        }
        assert_eq!(fs.file_content(Path::new("/srv/out.bin")).unwrap(), b"payload");
        assert_eq!(fs.file_mode(Path::new("/srv/out.bin")), Some(0o600));
    }

    #[test]
    fn injected_failures_are_consumed_in_order() {
        let fs = MemoryRemoteFs::new();
        fs.seed_dir(Path::new("/srv"));
        fs.inject_failures(
            "mkdir",
            Path::new("/srv/new"),
            OpError::ChannelBusy,
            2,
        );

        assert_eq!(fs.mkdir(Path::new("/srv/new")), Err(OpError::ChannelBusy));
        assert_eq!(fs.mkdir(Path::new("/srv/new")), Err(OpError::ChannelBusy));
        assert_eq!(fs.mkdir(Path::new("/srv/new")), Ok(()));
    }

    #[test]
    fn corrupt_writes_flip_committed_bytes() {
        let fs = MemoryRemoteFs::new();
        fs.seed_dir(Path::new("/srv"));
        fs.corrupt_next_writes(Path::new("/srv/f"), 1);

        {
            let mut w = fs.open_write(Path::new("/srv/f"), 0o644).unwrap();
            w.write_all(b"abc").unwrap();
        }
        assert_ne!(fs.file_content(Path::new("/srv/f")).unwrap(), b"abc");

        {
            let mut w = fs.open_write(Path::new("/srv/f"), 0o644).unwrap();
            w.write_all(b"abc").unwrap();
        }
        assert_eq!(fs.file_content(Path::new("/srv/f")).unwrap(), b"abc");
    }

    #[test]
    fn fetch_builds_relative_snapshot_with_hashes() {
        let fs = MemoryRemoteFs::new();
        fs.seed_file(Path::new("/srv/app/index.html"), b"<html>", 0o644);
        fs.seed_file(Path::new("/srv/app/css/app.css"), b"body {}", 0o644);

        let state = RemoteState::fetch(&fs, Path::new("/srv/app")).unwrap();

        assert_eq!(state.len(), 3); // css dir + two files
        let index = state.get(Path::new("index.html")).unwrap();
        assert!(!index.is_dir);
        assert_eq!(index.size, 6);
        assert_eq!(index.hash.as_deref(), Some(hash_reader(&b"<html>"[..]).unwrap().as_str()));
        assert!(state.get(Path::new("css")).unwrap().is_dir);
    }

    #[test]
    fn fetch_missing_root_is_empty() {
        let fs = MemoryRemoteFs::new();
        let state = RemoteState::fetch(&fs, Path::new("/srv/absent")).unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn fetch_root_that_is_a_file_fails() {
        let fs = MemoryRemoteFs::new();
        fs.seed_file(Path::new("/srv/app"), b"not a dir", 0o644);
        assert!(RemoteState::fetch(&fs, Path::new("/srv/app")).is_err());
    }

    #[test]
    fn mirroring_matches_fetch_of_identical_tree() {
        let entries = vec![FileEntry {
            path: PathBuf::from("css/app.css"),
            size: 7,
            hash: hash_reader(&b"body {}"[..]).unwrap(),
            mtime: None,
            mode: 0o644,
        }];
        let state = RemoteState::mirroring(&entries);
        assert!(state.get(Path::new("css")).unwrap().is_dir);
        assert_eq!(
            state.get(Path::new("css/app.css")).unwrap().hash,
            Some(entries[0].hash.clone())
        );
    }
}
