//! SSH session management and the libssh2-backed [`RemoteFs`]
//!
//! [`SftpRemoteFs::connect`] establishes the TCP connection, runs the SSH
//! handshake, walks the authentication ladder, and opens the SFTP channel.
//! Every remote operation ticks the keepalive first; when the server stops
//! answering, one silent reconnect is attempted before the operation fails
//! with a transient error and the retry policy takes over.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use log::{debug, info, warn};
use ssh2::{
    ErrorCode, FileStat, KeyboardInteractivePrompt, OpenFlags, OpenType, Prompt, Session, Sftp,
};

use crate::config::{expand_home, AuthMethod, Endpoint};
use crate::error::{ConnectError, OpError};
use crate::remote::{RemoteEntry, RemoteFs};

// SFTP status codes from the protocol (draft-ietf-secsh-filexfer)
const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_PERMISSION_DENIED: i32 = 3;
const SFTP_NO_CONNECTION: i32 = 6;
const SFTP_CONNECTION_LOST: i32 = 7;
const SFTP_NO_SUCH_PATH: i32 = 10;

// libssh2 session-level codes
const LIBSSH2_ERROR_CHANNEL_FAILURE: i32 = -21;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

/// Map a libssh2 error onto the operation taxonomy
fn map_op_err(err: &ssh2::Error) -> OpError {
    match err.code() {
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) | ErrorCode::SFTP(SFTP_NO_SUCH_PATH) => {
            OpError::InvalidPath(err.message().to_string())
        }
        ErrorCode::SFTP(SFTP_PERMISSION_DENIED) => {
            OpError::PermissionDenied(err.message().to_string())
        }
        ErrorCode::SFTP(SFTP_NO_CONNECTION) | ErrorCode::SFTP(SFTP_CONNECTION_LOST) => {
            OpError::NetworkInterrupted(err.message().to_string())
        }
        ErrorCode::Session(LIBSSH2_ERROR_EAGAIN)
        | ErrorCode::Session(LIBSSH2_ERROR_CHANNEL_FAILURE) => OpError::ChannelBusy,
        _ => OpError::NetworkInterrupted(err.message().to_string()),
    }
}

fn is_missing(err: &ssh2::Error) -> bool {
    matches!(
        err.code(),
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) | ErrorCode::SFTP(SFTP_NO_SUCH_PATH)
    )
}

/// Answers every keyboard-interactive prompt with the configured password
struct PasswordPrompter<'a> {
    password: &'a str,
}

impl KeyboardInteractivePrompt for PasswordPrompter<'_> {
    fn prompt<'b>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[Prompt<'b>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.password.to_string()).collect()
    }
}

/// Default identities probed for [`AuthMethod::DefaultKeys`], in order
fn default_key_candidates() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .filter(|p| p.is_file())
        .collect()
}

fn authenticate(session: &Session, endpoint: &Endpoint) -> Result<(), ConnectError> {
    let username = &endpoint.username;
    let rejected = |message: String| ConnectError::AuthRejected {
        username: username.clone(),
        message,
    };

    match &endpoint.auth {
        AuthMethod::Password(password) => {
            if session.userauth_password(username, password).is_ok() {
                return Ok(());
            }
            // Some servers only offer keyboard-interactive; answer its
            // prompts with the same password.
            let mut prompter = PasswordPrompter { password };
            session
                .userauth_keyboard_interactive(username, &mut prompter)
                .map_err(|e| rejected(e.message().to_string()))
        }
        AuthMethod::Key { path, passphrase } => {
            let key = expand_home(path);
            session
                .userauth_pubkey_file(username, None, &key, passphrase.as_deref())
                .map_err(|e| rejected(format!("key {}: {}", key.display(), e.message())))
        }
        AuthMethod::DefaultKeys => {
            if session.userauth_agent(username).is_ok() {
                return Ok(());
            }
            let candidates = default_key_candidates();
            for key in &candidates {
                debug!("trying identity {}", key.display());
                if session
                    .userauth_pubkey_file(username, None, key, None)
                    .is_ok()
                {
                    return Ok(());
                }
            }
            Err(rejected(format!(
                "agent and {} default identities exhausted",
                candidates.len()
            )))
        }
    }
}

/// Establish the TCP connection, handshake, authenticate, open SFTP
fn open_link(endpoint: &Endpoint) -> Result<(Session, Sftp), ConnectError> {
    let unreachable = |message: String| ConnectError::HostUnreachable {
        host: endpoint.host.clone(),
        port: endpoint.port,
        message,
    };
    let protocol = |message: String| ConnectError::ProtocolMismatch {
        host: endpoint.host.clone(),
        message,
    };

    let addr = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|e| unreachable(e.to_string()))?
        .next()
        .ok_or_else(|| unreachable("no address resolved".to_string()))?;

    let tcp = TcpStream::connect_timeout(&addr, endpoint.timeout()).map_err(|e| {
        if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock {
            ConnectError::Timeout {
                host: endpoint.host.clone(),
                port: endpoint.port,
                timeout_secs: endpoint.timeout_secs,
            }
        } else {
            unreachable(e.to_string())
        }
    })?;

    let mut session = Session::new().map_err(|e| protocol(e.message().to_string()))?;
    session.set_timeout(endpoint.timeout().as_millis() as u32);
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| protocol(e.message().to_string()))?;

    authenticate(&session, endpoint)?;
    if !session.authenticated() {
        return Err(ConnectError::AuthRejected {
            username: endpoint.username.clone(),
            message: "server did not accept any method".to_string(),
        });
    }

    if endpoint.keepalive_interval_secs > 0 {
        session.set_keepalive(true, endpoint.keepalive_interval_secs as u32);
    }

    let sftp = session
        .sftp()
        .map_err(|e| protocol(format!("sftp subsystem: {}", e.message())))?;

    info!(
        "connected to {}@{}:{}",
        endpoint.username, endpoint.host, endpoint.port
    );
    Ok((session, sftp))
}

struct Link {
    session: Session,
    sftp: Sftp,
    last_activity: Instant,
}

/// Live SFTP session implementing [`RemoteFs`]
///
/// `close` is idempotent; dropping the value tears the session down. The
/// session is also released on drop, so a panicking caller never leaks the
/// connection.
pub struct SftpRemoteFs {
    endpoint: Endpoint,
    link: Mutex<Option<Link>>,
}

impl SftpRemoteFs {
    /// Connect and authenticate per the endpoint description
    pub fn connect(endpoint: &Endpoint) -> Result<Self, ConnectError> {
        let (session, sftp) = open_link(endpoint)?;
        Ok(Self {
            endpoint: endpoint.clone(),
            link: Mutex::new(Some(Link {
                session,
                sftp,
                last_activity: Instant::now(),
            })),
        })
    }

    /// Disconnect. Safe to call more than once.
    pub fn close(&self) {
        let mut guard = self.link.lock().unwrap();
        if let Some(link) = guard.take() {
            let _ = link.session.disconnect(None, "done", None);
            debug!("session to {} closed", self.endpoint.host);
        }
    }

    /// Run `f` against a live link, ticking the keepalive first
    ///
    /// A dead keepalive gets one reconnect attempt; if that fails too the
    /// operation reports `NetworkInterrupted` and the executor's retry
    /// policy decides what happens next.
    fn with_link<T>(&self, f: impl FnOnce(&Sftp) -> Result<T, ssh2::Error>) -> Result<T, OpError> {
        let mut guard = self.link.lock().unwrap();
        let link = match guard.as_mut() {
            Some(link) => link,
            None => {
                return Err(OpError::NetworkInterrupted(
                    "session already closed".to_string(),
                ))
            }
        };

        let interval = self.endpoint.keepalive_interval();
        if !interval.is_zero() && link.last_activity.elapsed() >= interval {
            if let Err(e) = link.session.keepalive_send() {
                warn!(
                    "keepalive to {} failed ({}), reconnecting",
                    self.endpoint.host,
                    e.message()
                );
                match open_link(&self.endpoint) {
                    Ok((session, sftp)) => {
                        *link = Link {
                            session,
                            sftp,
                            last_activity: Instant::now(),
                        };
                    }
                    Err(reconnect) => {
                        return Err(OpError::NetworkInterrupted(format!(
                            "reconnect failed: {reconnect}"
                        )))
                    }
                }
            }
        }

        let result = f(&link.sftp).map_err(|e| map_op_err(&e));
        link.last_activity = Instant::now();
        result
    }
}

impl Drop for SftpRemoteFs {
    fn drop(&mut self) {
        self.close();
    }
}

fn entry_from_stat(path: PathBuf, stat: &FileStat) -> RemoteEntry {
    RemoteEntry {
        path,
        size: stat.size.unwrap_or(0),
        mtime: stat.mtime,
        perm: stat.perm.map(|p| p & 0o7777),
        is_dir: stat.is_dir(),
    }
}

impl RemoteFs for SftpRemoteFs {
    fn list(&self, dir: &Path) -> Result<Vec<RemoteEntry>, OpError> {
        self.with_link(|sftp| {
            let entries = sftp.readdir(dir)?;
            Ok(entries
                .into_iter()
                .map(|(path, stat)| entry_from_stat(path, &stat))
                .collect())
        })
    }

    fn stat(&self, path: &Path) -> Result<RemoteEntry, OpError> {
        self.with_link(|sftp| {
            let stat = sftp.stat(path)?;
            Ok(entry_from_stat(path.to_path_buf(), &stat))
        })
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read>, OpError> {
        self.with_link(|sftp| {
            let file = sftp.open(path)?;
            Ok(Box::new(file) as Box<dyn Read>)
        })
    }

    fn open_write(&self, path: &Path, mode: u32) -> Result<Box<dyn Write>, OpError> {
        self.with_link(|sftp| {
            let file = sftp.open_mode(
                path,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                mode as i32,
                OpenType::File,
            )?;
            Ok(Box::new(file) as Box<dyn Write>)
        })
    }

    fn mkdir(&self, path: &Path) -> Result<(), OpError> {
        self.with_link(|sftp| match sftp.stat(path) {
            Ok(stat) if stat.is_dir() => Ok(()),
            Ok(_) => Err(ssh2::Error::new(
                ErrorCode::SFTP(SFTP_NO_SUCH_PATH),
                "path exists as a file",
            )),
            Err(ref e) if is_missing(e) => sftp.mkdir(path, 0o755),
            Err(e) => Err(e),
        })
    }

    fn remove(&self, path: &Path) -> Result<(), OpError> {
        self.with_link(|sftp| {
            let stat = sftp.stat(path)?;
            if stat.is_dir() {
                sftp.rmdir(path)
            } else {
                sftp.unlink(path)
            }
        })
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<(), OpError> {
        self.with_link(|sftp| {
            sftp.setstat(
                path,
                FileStat {
                    size: None,
                    uid: None,
                    gid: None,
                    perm: Some(mode),
                    atime: None,
                    mtime: None,
                },
            )
        })
    }
}
