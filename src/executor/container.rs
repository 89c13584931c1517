//! Container supervisor: obtains the control connection and watches a
//! spawned container for unexpected death.

use std::ffi::OsString;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{ContainerConfig, ExecutorConfig};
use crate::error::{ContainerError, Error, Result};

/// Descriptor number of the control socket inside the container.
pub const CONTROL_FD: RawFd = 3;

pub const CONTAINER_BINARY: &str = "gate-container";
pub const LOADER_BINARY: &str = "gate-loader";

/// Inherited descriptors already wrapped. Each may be owned only once.
static INHERITED_TAKEN: Mutex<Vec<RawFd>> = Mutex::new(Vec::new());

/// How the executor reaches its container.
#[derive(Debug, Clone, PartialEq)]
pub enum Connection {
    /// Pre-opened socket inherited from the parent process.
    Inherited(RawFd),
    /// Existing container daemon listening on a UNIX socket.
    Daemon(PathBuf),
    /// Container spawned and owned by this executor.
    Spawn(ContainerConfig),
}

impl Connection {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        if let Some(fd) = config.conn_file {
            Connection::Inherited(fd)
        } else if let Some(path) = &config.daemon_socket {
            Connection::Daemon(path.clone())
        } else {
            Connection::Spawn(config.container.clone())
        }
    }

    /// Human-readable description of the connection mode
    pub fn description(&self) -> String {
        match self {
            Connection::Inherited(fd) => format!("inherited socket (fd {fd})"),
            Connection::Daemon(path) => format!("daemon ({})", path.display()),
            Connection::Spawn(config) => {
                format!("spawned ({})", config.exec_dir.join(CONTAINER_BINARY).display())
            }
        }
    }

    /// Opens the control connection. A spawned container's child handle is
    /// returned so that it can be reaped.
    pub async fn connect(&self) -> Result<(UnixStream, Option<Child>)> {
        match self {
            Connection::Inherited(fd) => {
                take_inherited(*fd)?;
                // SAFETY: the configuration names a socket descriptor handed to
                // us by our parent, and take_inherited lets it be wrapped once.
                let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(*fd) };
                std_stream.set_nonblocking(true)?;
                Ok((UnixStream::from_std(std_stream)?, None))
            }
            Connection::Daemon(path) => {
                info!("Dialing container daemon at {}", path.display());
                Ok((UnixStream::connect(path).await?, None))
            }
            Connection::Spawn(config) => {
                let (stream, child) = spawn(config)?;
                Ok((stream, Some(child)))
            }
        }
    }
}

/// Claims an inherited descriptor. A second claim is a configuration error,
/// since the first owner may already have closed it.
fn take_inherited(fd: RawFd) -> Result<()> {
    let mut taken = INHERITED_TAKEN.lock().unwrap_or_else(|e| e.into_inner());
    if taken.contains(&fd) {
        return Err(Error::Config(format!(
            "inherited socket fd {fd} was already used by an earlier connection"
        )));
    }
    taken.push(fd);
    Ok(())
}

/// Command-line arguments of the container binary.
pub fn container_args(config: &ContainerConfig) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        format!("--control-fd={CONTROL_FD}").into(),
        flag_path("--loader", &config.exec_dir.join(LOADER_BINARY)),
    ];

    let ns = &config.namespace;
    if ns.disabled {
        args.push("--no-namespaces".into());
    } else {
        if ns.single_uid {
            args.push("--single-uid".into());
        }
        args.push(format!("--newuidmap={}", ns.newuidmap).into());
        args.push(format!("--newgidmap={}", ns.newgidmap).into());
        if let Some(cred) = &ns.container {
            args.push(format!("--container-cred={}:{}", cred.uid, cred.gid).into());
        }
        if let Some(cred) = &ns.executor {
            args.push(format!("--executor-cred={}:{}", cred.uid, cred.gid).into());
        }
    }

    if let Some(dir) = &config.cgroup.container {
        args.push(flag_path("--cgroup", dir));
    }

    args
}

fn flag_path(flag: &str, path: &Path) -> OsString {
    let mut arg = OsString::from(flag);
    arg.push("=");
    arg.push(path);
    arg
}

fn spawn(config: &ContainerConfig) -> Result<(UnixStream, Child)> {
    let binary = config.exec_dir.join(CONTAINER_BINARY);
    let (host, peer) = std::os::unix::net::UnixStream::pair()?;
    let peer_fd = peer.as_raw_fd();

    let mut cmd = Command::new(&binary);
    cmd.args(container_args(config))
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    // SAFETY: the hook only calls async-signal-safe functions.
    unsafe {
        cmd.pre_exec(move || {
            if peer_fd == CONTROL_FD {
                if libc::fcntl(CONTROL_FD, libc::F_SETFD, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            } else if libc::dup2(peer_fd, CONTROL_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| {
        Error::Internal(format!("spawning container {}: {e}", binary.display()))
    })?;
    drop(peer);

    info!(
        "Spawned container {} (pid {})",
        binary.display(),
        child.id().unwrap_or(0)
    );

    host.set_nonblocking(true)?;
    Ok((UnixStream::from_std(host)?, child))
}

/// Opens the cgroup directory passed along with every Create request.
pub fn open_process_cgroup(config: &ContainerConfig) -> Result<Option<Arc<OwnedFd>>> {
    let Some(dir) = &config.cgroup.process else {
        return Ok(None);
    };

    let file = File::options()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(dir)
        .map_err(|e| Error::Config(format!("process cgroup {}: {e}", dir.display())))?;
    Ok(Some(Arc::new(OwnedFd::from(file))))
}

/// Maps a container exit status to the error it reports.
pub fn exit_error(status: ExitStatus) -> Error {
    if let Some(code) = status.code() {
        if code == 0 {
            Error::Internal("container exited unexpectedly".into())
        } else {
            Error::Container(ContainerError::from_code(code))
        }
    } else if let Some(signal) = status.signal() {
        Error::Internal(format!("container terminated by signal {signal}"))
    } else {
        Error::Internal(format!("container terminated with {status}"))
    }
}

/// Awaits a spawned container. Death not preceded by `closing` is recorded
/// as the executor's death cause and fires `send_closed`.
pub fn watch(
    mut child: Child,
    closing: CancellationToken,
    send_closed: CancellationToken,
    death: Arc<OnceLock<Error>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                error!("Waiting for container failed: {e}");
                let _ = death.set(Error::Io(e));
                send_closed.cancel();
                return;
            }
        };

        if closing.is_cancelled() && status.success() {
            info!("Container exited");
            return;
        }

        let err = exit_error(status);
        error!("Container died: {err}");
        let _ = death.set(err);
        send_closed.cancel();
    })
}
