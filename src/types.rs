//! Shared types for the sticky cluster

use std::io;
use thiserror::Error;

/// Index of a worker's position in the fixed-size pool.
///
/// Independent of the worker's OS process id, which changes across restarts.
pub type WorkerSlot = u32;

/// Cluster error type
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to spawn worker for slot {slot}: {source}")]
    Spawn {
        slot: WorkerSlot,
        #[source]
        source: io::Error,
    },

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Signal handler error: {0}")]
    Signal(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// How a cluster process finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterExit {
    /// Master drained listener, connections and workers before the deadline
    Graceful,
    /// Hard shutdown deadline elapsed before the graceful phase completed
    Forced,
    /// Worker (or standalone server) stopped serving
    Served,
}

impl ClusterExit {
    /// Process exit status for this outcome
    pub fn exit_code(self) -> i32 {
        match self {
            ClusterExit::Graceful | ClusterExit::Served => 0,
            ClusterExit::Forced => 1,
        }
    }
}
