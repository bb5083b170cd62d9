//! Worker runtime - receives connections forwarded by the master
//!
//! The worker never listens on the public port. It binds a loopback-only
//! ephemeral listener of its own and otherwise serves the connections the
//! master hands over on the IPC channel. Data on a forwarded connection only
//! starts flowing once the handler reads from it.

use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, info_span, warn, Instrument};

use super::{ConnectionHandler, WorkerContext};
use crate::config::ClusterOptions;
use crate::ipc::{Channel, ClusterMessage, MAX_MESSAGE_LEN};
use crate::types::{ClusterError, Result};

pub struct WorkerRuntime {
    context: WorkerContext,
    prefix: String,
    channel: Arc<Channel>,
}

impl WorkerRuntime {
    /// Attach to the channel inherited from the master.
    pub fn connect(context: WorkerContext, options: &ClusterOptions) -> Result<Self> {
        let fd = context.ipc_fd.ok_or_else(|| {
            ClusterError::Ipc(format!("{} has no master channel", context.name))
        })?;
        // The descriptor number came from our own environment, set by the
        // master that created it for this process alone.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        let channel = Channel::from_owned(owned)
            .map_err(|e| ClusterError::Ipc(format!("cannot adopt channel fd {}: {}", fd, e)))?;
        Ok(Self::with_channel(context, options, channel))
    }

    pub fn with_channel(context: WorkerContext, options: &ClusterOptions, channel: Channel) -> Self {
        Self {
            context,
            prefix: options.prefix.clone(),
            channel: Arc::new(channel),
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.context
    }

    /// Serve until SIGTERM or until the master's end of the channel closes.
    pub async fn serve(self, handler: Arc<dyn ConnectionHandler>) -> Result<()> {
        let span = info_span!("worker", slot = self.context.slot, name = %self.context.name);
        self.serve_inner(handler).instrument(span).await
    }

    async fn serve_inner(self, handler: Arc<dyn ConnectionHandler>) -> Result<()> {
        let local = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|source| ClusterError::Bind {
                addr: "127.0.0.1:0".to_string(),
                source,
            })?;
        let local_addr = local.local_addr()?;
        info!(%local_addr, primary = self.context.is_primary, "Worker serving");

        let ready = ClusterMessage::encode_ready(&self.prefix, self.context.slot, local_addr);
        if let Err(e) = self.channel.send(&ready).await {
            warn!(error = %e, "Could not report readiness to master");
        }

        let mut terminate = signal(SignalKind::terminate()).map_err(ClusterError::Signal)?;
        // The master coordinates shutdown; a terminal Ctrl-C reaches the
        // whole process group, so workers swallow SIGINT.
        let mut interrupt = signal(SignalKind::interrupt()).map_err(ClusterError::Signal)?;

        let mut buf = vec![0u8; MAX_MESSAGE_LEN];
        loop {
            tokio::select! {
                received = self.channel.recv(&mut buf) => match received {
                    Ok((0, _)) => {
                        info!("Master channel closed, stopping");
                        break;
                    }
                    Ok((len, fds)) => {
                        match ClusterMessage::decode(&self.prefix, &buf[..len], fds) {
                            ClusterMessage::Connection { slot, peer, handle } => {
                                if slot != self.context.slot {
                                    warn!(for_slot = slot, %peer, "Connection addressed to another slot, serving anyway");
                                }
                                self.dispatch(Arc::clone(&handler), peer, handle);
                            }
                            other => debug!(message = ?other, "Ignoring message"),
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Master channel failed, stopping");
                        break;
                    }
                },
                accepted = local.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move { handler.handle(stream, peer).await }.in_current_span());
                    }
                    Err(e) => warn!(error = %e, "Local accept failed"),
                },
                _ = terminate.recv() => {
                    info!("SIGTERM received, stopping");
                    break;
                }
                _ = interrupt.recv() => {
                    debug!("Ignoring SIGINT, waiting for the master");
                }
            }
        }

        Ok(())
    }

    /// Take ownership of a forwarded connection and run the handler on it.
    fn dispatch(&self, handler: Arc<dyn ConnectionHandler>, peer: SocketAddr, handle: OwnedFd) {
        let stream = match adopt_stream(handle) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%peer, error = %e, "Could not adopt forwarded connection");
                return;
            }
        };
        debug!(%peer, "Received connection");

        let channel = Arc::clone(&self.channel);
        let closed = ClusterMessage::encode_closed(&self.prefix, self.context.slot, peer);
        tokio::spawn(
            async move {
                handler.handle(stream, peer).await;
                // Lets the master release its copy of the socket.
                if let Err(e) = channel.send(&closed).await {
                    debug!(%peer, error = %e, "Could not report closed connection");
                }
            }
            .in_current_span(),
        );
    }
}

fn adopt_stream(handle: OwnedFd) -> std::io::Result<TcpStream> {
    let stream = std::net::TcpStream::from(handle);
    stream.set_nonblocking(true)?;
    TcpStream::from_std(stream)
}
