//! sftp-sync: idempotent directory synchronization over SFTP
//!
//! Mirrors a local directory tree onto a remote host. Each run snapshots the
//! remote target, diffs it against the local source by content hash, and
//! executes only the operations needed to converge, with retry and
//! verification on every upload. Running twice in a row transfers nothing
//! the second time.
//!
//! The library is organized around a small capability trait,
//! [`remote::RemoteFs`], so the planner and executor never depend on a live
//! connection; [`remote::MemoryRemoteFs`] stands in for tests and
//! [`session::SftpRemoteFs`] talks to a real server.

pub mod config;
pub mod error;
pub mod local;
pub mod remote;
pub mod session;
pub mod sync;

pub use config::{AuthMethod, Endpoint, SyncConfig};
pub use error::{ConnectError, OpError, SyncError, SyncResult};
pub use local::{walk_local, FileEntry};
pub use remote::{MemoryRemoteFs, RemoteFs, RemoteState};
pub use session::SftpRemoteFs;
pub use sync::{CancelToken, SyncEngine, TransferPlan, TransferResult};
