//! Cluster master - owns the public listener and routes connections
//!
//! The master accepts every client connection but never reads from it. Each
//! socket is routed by the hash of the client IP and handed to the owning
//! worker; bytes the client already sent wait in the kernel buffer until that
//! worker reads them. The master keeps its own copy of every open connection
//! so that shutdown can close them from this side.
//!
//! All state lives in the single loop in [`ClusterMaster::run_until`]:
//! accepts, worker events and the shutdown request are handled one at a time.

use std::collections::HashMap;
use std::future::Future;
use std::net::{Shutdown, SocketAddr};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::launcher::{WorkerEvent, WorkerLauncher};
use super::supervisor::{Entrusted, WorkerSupervisor};
use crate::config::ClusterOptions;
use crate::router;
use crate::types::{ClusterError, ClusterExit, Result, WorkerSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Created,
    Listening,
    Draining,
    Stopped,
}

/// A client connection the master has accepted and not yet seen finish
#[derive(Debug)]
pub struct ConnectionRecord {
    /// `ip:port` of the client
    pub signature: String,
    pub slot: WorkerSlot,
    pub worker_pid: Option<u32>,
    stream: std::net::TcpStream,
}

impl ConnectionRecord {
    /// Close the connection for both sides, including the worker's copy.
    fn destroy(self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!(signature = %self.signature, error = %e, "Shutdown of closed connection");
        }
    }
}

pub struct ClusterMaster<L: WorkerLauncher> {
    options: ClusterOptions,
    supervisor: WorkerSupervisor<L>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    connections: HashMap<String, ConnectionRecord>,
    listener: Option<TcpListener>,
    state: MasterState,
}

impl<L: WorkerLauncher> ClusterMaster<L> {
    pub fn new(options: ClusterOptions, launcher: L) -> Result<Self> {
        options.validate()?;
        let (supervisor, events) = WorkerSupervisor::new(launcher, options.clone());
        Ok(Self {
            options,
            supervisor,
            events,
            connections: HashMap::new(),
            listener: None,
            state: MasterState::Created,
        })
    }

    /// Bind the public listener, then start the workers.
    pub async fn server_start(&mut self) -> Result<SocketAddr> {
        if self.state != MasterState::Created {
            return Err(ClusterError::Config(format!(
                "master cannot start from state {:?}",
                self.state
            )));
        }

        let addr = SocketAddr::new(self.options.host, self.options.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ClusterError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, workers = self.options.concurrency, "Master listening");

        self.listener = Some(listener);
        self.state = MasterState::Listening;
        self.supervisor.start()?;
        Ok(local_addr)
    }

    /// Start and run until `shutdown` resolves.
    pub async fn start<F>(&mut self, shutdown: F) -> Result<ClusterExit>
    where
        F: Future<Output = ()>,
    {
        self.server_start().await?;
        self.run_until(shutdown).await
    }

    /// Serve until `shutdown` resolves, then stop the cluster.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<ClusterExit>
    where
        F: Future<Output = ()>,
    {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| ClusterError::Config("master is not listening".to_string()))?;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.on_connection(stream, peer),
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                Some(event) = self.events.recv() => self.on_worker_event(event),
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        Ok(self.stop(listener).await)
    }

    /// Route one accepted connection. Never waits on a worker, so a wedged
    /// worker costs its own connections and nothing else.
    fn on_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        // Deregistered from the reactor; the master never reads from it.
        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%peer, error = %e, "Could not take over accepted connection");
                return;
            }
        };

        let slot = match router::slot_for(&peer.ip().to_string(), self.options.concurrency) {
            Ok(slot) => slot,
            Err(e) => {
                error!(%peer, error = %e, "Could not route connection");
                return;
            }
        };

        let signature = peer.to_string();
        let record = ConnectionRecord {
            signature: signature.clone(),
            slot,
            worker_pid: None,
            stream,
        };
        if let Some(previous) = self.connections.insert(signature.clone(), record) {
            previous.destroy();
        }

        let Some(record) = self.connections.get(&signature) else {
            return;
        };
        match self.supervisor.entrust(slot, &record.stream, peer) {
            Entrusted::Delivered { pid } => {
                if let Some(record) = self.connections.get_mut(&signature) {
                    record.worker_pid = Some(pid);
                }
            }
            Entrusted::NoWorker | Entrusted::Failed => {
                if let Some(record) = self.connections.remove(&signature) {
                    record.destroy();
                }
            }
        }
    }

    fn on_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Exited { slot, pid, code, signal } => {
                if self.supervisor.handle_exit(slot, pid, code, signal) {
                    self.purge_worker(pid);
                }
            }
            WorkerEvent::Ready { slot, pid, local_addr } => {
                info!(slot, pid, %local_addr, "Worker ready");
            }
            WorkerEvent::ConnectionClosed { slot, pid, peer } => {
                let signature = peer.to_string();
                let owned = self
                    .connections
                    .get(&signature)
                    .is_some_and(|record| record.worker_pid == Some(pid));
                if owned {
                    self.connections.remove(&signature);
                    debug!(slot, pid, %peer, "Connection closed");
                }
            }
        }
    }

    /// Destroy every connection that was handed to a dead worker.
    fn purge_worker(&mut self, pid: u32) {
        let orphaned: Vec<String> = self
            .connections
            .values()
            .filter(|record| record.worker_pid == Some(pid))
            .map(|record| record.signature.clone())
            .collect();
        if !orphaned.is_empty() {
            info!(pid, connections = orphaned.len(), "Closing connections of dead worker");
        }
        for signature in orphaned {
            if let Some(record) = self.connections.remove(&signature) {
                record.destroy();
            }
        }
    }

    /// Two-phase stop: drain gracefully, or give up when the deadline passes.
    async fn stop(&mut self, listener: TcpListener) -> ClusterExit {
        self.state = MasterState::Draining;
        let deadline = self.options.hard_shutdown_delay();
        info!(
            deadline_ms = deadline.as_millis() as u64,
            connections = self.connections.len(),
            workers = self.supervisor.live_count(),
            "Stopping cluster"
        );

        let exit = match tokio::time::timeout(deadline, self.drain(listener)).await {
            Ok(()) => {
                info!("Cluster stopped");
                ClusterExit::Graceful
            }
            Err(_) => {
                error!(
                    workers = self.supervisor.live_count(),
                    "Graceful shutdown timed out, forcing"
                );
                self.force_stop();
                ClusterExit::Forced
            }
        };
        self.state = MasterState::Stopped;
        exit
    }

    /// Settle exits that already happened, then signal whoever is left.
    fn force_stop(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.on_worker_event(event);
        }
        self.supervisor.stop();
    }

    async fn drain(&mut self, listener: TcpListener) {
        drop(listener);
        for (_, record) in self.connections.drain() {
            record.destroy();
        }
        self.supervisor.stop();

        while self.supervisor.live_count() > 0 {
            match self.events.recv().await {
                Some(event) => self.on_worker_event(event),
                None => break,
            }
        }
    }

    pub fn state(&self) -> MasterState {
        self.state
    }

    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn supervisor(&self) -> &WorkerSupervisor<L> {
        &self.supervisor
    }
}
