//! Worker process creation
//!
//! The supervisor only sees [`WorkerLauncher`] and [`WorkerLink`]. The real
//! implementation re-executes the current binary with the worker environment
//! set and one end of a fresh channel inherited across `exec`. A monitor task
//! per worker turns its exit and its reports into [`WorkerEvent`]s.

use std::ffi::OsString;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ClusterOptions;
use crate::ipc::{set_cloexec, Channel, ClusterMessage, MAX_MESSAGE_LEN};
use crate::types::{ClusterError, Result, WorkerSlot};
use crate::worker::{worker_name, ENV_WORKER_IPC_FD, ENV_WORKER_NAME, ENV_WORKER_SLOT};

/// Lifecycle and report events from worker processes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The worker process is gone
    Exited {
        slot: WorkerSlot,
        pid: u32,
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The worker finished starting up
    Ready {
        slot: WorkerSlot,
        pid: u32,
        local_addr: SocketAddr,
    },
    /// A connection handed to the worker has finished
    ConnectionClosed {
        slot: WorkerSlot,
        pid: u32,
        peer: SocketAddr,
    },
}

/// Master's handle on one running worker
pub trait WorkerLink: Send + Sync {
    fn pid(&self) -> u32;

    /// Hand a duplicate of `connection` to the worker. The caller keeps its copy.
    ///
    /// Never waits: a worker that is not draining its channel makes this fail
    /// with `WouldBlock`.
    fn deliver(&self, slot: WorkerSlot, peer: SocketAddr, connection: &TcpStream) -> io::Result<()>;

    /// Ask the worker to exit (SIGTERM).
    fn terminate(&self) -> io::Result<()>;
}

/// Source of worker processes
pub trait WorkerLauncher: Send {
    /// Start a worker for `slot`. Its exit must eventually be reported on `events`.
    fn launch(
        &mut self,
        slot: WorkerSlot,
        options: &ClusterOptions,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Box<dyn WorkerLink>>;
}

/// Launches workers as child processes of this binary
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-run the current executable with the arguments it was started with.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, std::env::args_os().skip(1).collect()))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &mut self,
        slot: WorkerSlot,
        options: &ClusterOptions,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Box<dyn WorkerLink>> {
        let (channel, child_end) =
            Channel::pair().map_err(|e| ClusterError::Ipc(format!("channel for slot {}: {}", slot, e)))?;
        let child_fd = child_end.as_raw_fd();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(ENV_WORKER_SLOT, slot.to_string())
            .env(ENV_WORKER_NAME, worker_name(slot))
            .env(ENV_WORKER_IPC_FD, child_fd.to_string())
            // Pin the values the worker must agree on with the master.
            .env("STICKY_CLUSTER_CONCURRENCY", options.concurrency.to_string())
            .env("STICKY_CLUSTER_PREFIX", &options.prefix)
            .stdin(Stdio::null());

        // SAFETY: only fcntl runs between fork and exec, which is async-signal-safe.
        unsafe {
            command.pre_exec(move || set_cloexec(child_fd, false));
        }

        let child = command
            .spawn()
            .map_err(|source| ClusterError::Spawn { slot, source })?;
        // The child holds its own copy now.
        drop(child_end);

        let pid = child.id().ok_or_else(|| ClusterError::Spawn {
            slot,
            source: io::Error::new(io::ErrorKind::Other, "worker exited before it was tracked"),
        })?;

        let channel = Arc::new(channel);
        tokio::spawn(monitor(
            slot,
            pid,
            child,
            Arc::clone(&channel),
            options.prefix.clone(),
            events,
        ));

        Ok(Box::new(ProcessLink {
            pid,
            prefix: options.prefix.clone(),
            channel,
        }))
    }
}

/// Forward a worker's reports until it exits, then report the exit.
async fn monitor(
    slot: WorkerSlot,
    pid: u32,
    mut child: Child,
    channel: Arc<Channel>,
    prefix: String,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut buf = vec![0u8; MAX_MESSAGE_LEN];
    let mut channel_open = true;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            received = channel.recv(&mut buf), if channel_open => match received {
                Ok((0, _)) => channel_open = false,
                Ok((len, fds)) => {
                    let event = match ClusterMessage::decode(&prefix, &buf[..len], fds) {
                        ClusterMessage::Closed { peer, .. } => WorkerEvent::ConnectionClosed { slot, pid, peer },
                        ClusterMessage::Ready { local_addr, .. } => WorkerEvent::Ready { slot, pid, local_addr },
                        other => {
                            debug!(slot, pid, message = ?other, "Ignoring worker message");
                            continue;
                        }
                    };
                    let _ = events.send(event);
                }
                Err(e) => {
                    warn!(slot, pid, error = %e, "Worker channel failed");
                    channel_open = false;
                }
            },
        }
    };

    let (code, signal) = match status {
        Ok(status) => (status.code(), status.signal()),
        Err(e) => {
            warn!(slot, pid, error = %e, "Could not collect worker exit status");
            (None, None)
        }
    };
    let _ = events.send(WorkerEvent::Exited {
        slot,
        pid,
        code,
        signal,
    });
}

struct ProcessLink {
    pid: u32,
    prefix: String,
    channel: Arc<Channel>,
}

impl WorkerLink for ProcessLink {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn deliver(&self, slot: WorkerSlot, peer: SocketAddr, connection: &TcpStream) -> io::Result<()> {
        let envelope = ClusterMessage::encode_connection(&self.prefix, slot, peer);
        self.channel.try_send_with_fd(&envelope, connection.as_raw_fd())
    }

    fn terminate(&self) -> io::Result<()> {
        send_signal(self.pid, libc::SIGTERM)
    }
}

fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("pid {} out of range", pid)))?;
    // SAFETY: kill only takes plain integers.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        // Already gone; its exit event is on the way.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}
