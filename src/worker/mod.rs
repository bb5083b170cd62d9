//! Worker side of the cluster
//!
//! A worker is this same binary re-executed by the master with a few
//! environment variables set. Their presence is what makes a process a worker.

pub mod handler;
pub mod runtime;

use std::os::fd::RawFd;

use crate::types::{ClusterError, Result, WorkerSlot};

pub use handler::{ConnectionHandler, EchoHandler};
pub use runtime::WorkerRuntime;

pub const ENV_WORKER_SLOT: &str = "STICKY_CLUSTER_WORKER_SLOT";
pub const ENV_WORKER_NAME: &str = "STICKY_CLUSTER_WORKER_NAME";
pub const ENV_WORKER_IPC_FD: &str = "STICKY_CLUSTER_WORKER_IPC_FD";

/// Identity of a worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerContext {
    pub slot: WorkerSlot,
    pub name: String,
    /// Channel descriptor inherited from the master (absent when standalone)
    pub ipc_fd: Option<RawFd>,
    /// Highest slot; runs the cluster's one-off background work
    pub is_primary: bool,
}

impl WorkerContext {
    /// Read the worker environment. `Ok(None)` means this process is not a worker.
    pub fn from_env(concurrency: usize) -> Result<Option<Self>> {
        Self::from_lookup(concurrency, |key| std::env::var(key).ok())
    }

    fn from_lookup(
        concurrency: usize,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>> {
        let Some(slot) = lookup(ENV_WORKER_SLOT) else {
            return Ok(None);
        };
        let slot: WorkerSlot = slot
            .parse()
            .map_err(|_| ClusterError::Config(format!("{}={:?} is not a slot", ENV_WORKER_SLOT, slot)))?;
        if slot as usize >= concurrency {
            return Err(ClusterError::Config(format!(
                "worker slot {} is outside a cluster of {}",
                slot, concurrency
            )));
        }

        let ipc_fd = lookup(ENV_WORKER_IPC_FD)
            .ok_or_else(|| ClusterError::Config(format!("{} is not set", ENV_WORKER_IPC_FD)))?;
        let ipc_fd: RawFd = ipc_fd.parse().map_err(|_| {
            ClusterError::Config(format!("{}={:?} is not a descriptor", ENV_WORKER_IPC_FD, ipc_fd))
        })?;

        Ok(Some(Self {
            slot,
            name: lookup(ENV_WORKER_NAME).unwrap_or_else(|| worker_name(slot)),
            ipc_fd: Some(ipc_fd),
            is_primary: slot as usize + 1 == concurrency,
        }))
    }

    /// Context for the single in-process server used when clustering is off
    pub fn standalone() -> Self {
        Self {
            slot: 0,
            name: "Main".to_string(),
            ipc_fd: None,
            is_primary: true,
        }
    }
}

/// Display name for a slot's worker
pub fn worker_name(slot: WorkerSlot) -> String {
    format!("Worker {}", slot + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_master_has_no_worker_env() {
        assert_eq!(WorkerContext::from_lookup(4, lookup(&[])).unwrap(), None);
    }

    #[test]
    fn test_worker_env() {
        let ctx = WorkerContext::from_lookup(
            4,
            lookup(&[(ENV_WORKER_SLOT, "3"), (ENV_WORKER_IPC_FD, "7")]),
        )
        .unwrap()
        .unwrap();

        assert_eq!(ctx.slot, 3);
        assert_eq!(ctx.ipc_fd, Some(7));
        assert_eq!(ctx.name, "Worker 4");
        assert!(ctx.is_primary);
    }

    #[test]
    fn test_only_last_slot_is_primary() {
        let ctx = WorkerContext::from_lookup(
            4,
            lookup(&[
                (ENV_WORKER_SLOT, "0"),
                (ENV_WORKER_IPC_FD, "5"),
                (ENV_WORKER_NAME, "edge"),
            ]),
        )
        .unwrap()
        .unwrap();
        assert!(!ctx.is_primary);
        assert_eq!(ctx.name, "edge");
    }

    #[test]
    fn test_bad_worker_env_is_config_error() {
        let out_of_range = WorkerContext::from_lookup(
            2,
            lookup(&[(ENV_WORKER_SLOT, "2"), (ENV_WORKER_IPC_FD, "5")]),
        );
        assert!(matches!(out_of_range, Err(ClusterError::Config(_))));

        let missing_fd = WorkerContext::from_lookup(2, lookup(&[(ENV_WORKER_SLOT, "1")]));
        assert!(matches!(missing_fd, Err(ClusterError::Config(_))));

        let garbage = WorkerContext::from_lookup(2, lookup(&[(ENV_WORKER_SLOT, "one")]));
        assert!(matches!(garbage, Err(ClusterError::Config(_))));
    }
}
