//! Master side of the cluster: process supervision and connection routing

pub mod launcher;
pub mod master;
pub mod orchestrator;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod fake;

pub use launcher::{ProcessLauncher, WorkerEvent, WorkerLauncher, WorkerLink};
pub use master::{ClusterMaster, ConnectionRecord, MasterState};
pub use orchestrator::{detect_role, shutdown_signal, ClusterOrchestrator, Role};
pub use supervisor::{Entrusted, WorkerHandle, WorkerSupervisor};
