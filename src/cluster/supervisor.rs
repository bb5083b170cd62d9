//! Worker supervisor
//!
//! Keeps exactly one worker per slot while running. Every exit is an event;
//! a running supervisor refills the slot at once, with no backoff and no
//! restart limit. Workers that die right after spawning are only warned about.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::launcher::{WorkerEvent, WorkerLauncher, WorkerLink};
use crate::config::ClusterOptions;
use crate::types::{Result, WorkerSlot};

/// Exits sooner than this after spawn count as a crash loop
pub const CRASH_LOOP_WINDOW: Duration = Duration::from_secs(1);

/// A live worker, owned by the supervisor
pub struct WorkerHandle {
    pub slot: WorkerSlot,
    pub pid: u32,
    pub spawned_at: Instant,
    link: Box<dyn WorkerLink>,
}

/// Result of handing a connection to a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entrusted {
    Delivered { pid: u32 },
    /// Slot is vacant (or the supervisor is stopped); the caller drops the connection
    NoWorker,
    /// The worker could not be reached
    Failed,
}

pub struct WorkerSupervisor<L: WorkerLauncher> {
    launcher: L,
    options: ClusterOptions,
    workers: HashMap<WorkerSlot, WorkerHandle>,
    restarts: HashMap<WorkerSlot, u32>,
    running: bool,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl<L: WorkerLauncher> WorkerSupervisor<L> {
    /// Create a stopped supervisor and the receiver its workers report on.
    pub fn new(launcher: L, options: ClusterOptions) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            launcher,
            options,
            workers: HashMap::new(),
            restarts: HashMap::new(),
            running: false,
            events_tx,
        };
        (supervisor, events_rx)
    }

    /// Spawn one worker per slot.
    pub fn start(&mut self) -> Result<()> {
        self.running = true;
        info!(workers = self.options.concurrency, "Starting workers");
        for slot in 0..self.options.concurrency as WorkerSlot {
            self.spawn(slot)?;
        }
        Ok(())
    }

    fn spawn(&mut self, slot: WorkerSlot) -> Result<()> {
        let link = self.launcher.launch(slot, &self.options, self.events_tx.clone())?;
        let pid = link.pid();
        info!(slot, pid, "Worker started");
        self.workers.insert(
            slot,
            WorkerHandle {
                slot,
                pid,
                spawned_at: Instant::now(),
                link,
            },
        );
        Ok(())
    }

    /// Hand `connection` to the worker that owns `slot`. Never waits on the worker.
    pub fn entrust(&self, slot: WorkerSlot, connection: &TcpStream, peer: SocketAddr) -> Entrusted {
        if !self.running {
            debug!(slot, %peer, "Supervisor stopped, not entrusting connection");
            return Entrusted::NoWorker;
        }
        let Some(handle) = self.workers.get(&slot) else {
            warn!(slot, %peer, "No worker in slot, dropping connection");
            return Entrusted::NoWorker;
        };

        match handle.link.deliver(slot, peer, connection) {
            Ok(()) => {
                debug!(slot, pid = handle.pid, %peer, "Connection entrusted");
                Entrusted::Delivered { pid: handle.pid }
            }
            Err(e) => {
                warn!(slot, pid = handle.pid, %peer, error = %e, "Could not deliver connection");
                Entrusted::Failed
            }
        }
    }

    /// Stop respawning and SIGTERM every tracked worker.
    pub fn stop(&mut self) {
        self.running = false;
        for handle in self.workers.values() {
            if let Err(e) = handle.link.terminate() {
                warn!(slot = handle.slot, pid = handle.pid, error = %e, "Could not terminate worker");
            }
        }
    }

    /// Terminate one slot's worker. A running supervisor respawns it when the exit arrives.
    pub fn kill(&self, slot: WorkerSlot) -> bool {
        let Some(handle) = self.workers.get(&slot) else {
            return false;
        };
        info!(slot, pid = handle.pid, "Killing worker");
        if let Err(e) = handle.link.terminate() {
            warn!(slot, pid = handle.pid, error = %e, "Could not terminate worker");
        }
        true
    }

    /// Process a worker exit. Returns false for stale events, whose pid is no
    /// longer the slot's worker.
    pub fn handle_exit(&mut self, slot: WorkerSlot, pid: u32, code: Option<i32>, signal: Option<i32>) -> bool {
        let Some(handle) = self.workers.remove(&slot) else {
            debug!(slot, pid, "Exit for vacant slot ignored");
            return false;
        };
        if handle.pid != pid {
            debug!(slot, pid, current = handle.pid, "Stale exit ignored");
            self.workers.insert(slot, handle);
            return false;
        }

        if !self.running {
            info!(slot, pid, ?code, ?signal, "Worker exited");
            return true;
        }

        let lifetime = handle.spawned_at.elapsed();
        let restarts = self.restarts.entry(slot).or_insert(0);
        *restarts += 1;
        if lifetime < CRASH_LOOP_WINDOW {
            warn!(
                slot,
                pid,
                ?code,
                ?signal,
                restarts = *restarts,
                lifetime_ms = lifetime.as_millis() as u64,
                "Worker exited right after spawning, restarting"
            );
        } else {
            warn!(slot, pid, ?code, ?signal, restarts = *restarts, "Worker died, restarting");
        }

        if let Err(e) = self.spawn(slot) {
            error!(slot, error = %e, "Could not restart worker, slot left vacant");
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn live_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_pid(&self, slot: WorkerSlot) -> Option<u32> {
        self.workers.get(&slot).map(|handle| handle.pid)
    }

    pub fn restart_count(&self, slot: WorkerSlot) -> u32 {
        self.restarts.get(&slot).copied().unwrap_or(0)
    }
}
