//! sticky-cluster - sticky process-cluster load balancer
//!
//! One master process owns the public TCP listener and a fixed pool of worker
//! processes. Every accepted connection is routed by a hash of the client's
//! IP address, so a given client always reaches the same worker, and the
//! live socket is handed to that worker over a Unix socket.
//!
//! ## Modules
//!
//! - **router**: address → worker slot hashing
//! - **cluster**: orchestrator, master event loop, worker supervision
//! - **worker**: worker runtime and connection handlers
//! - **ipc**: master ↔ worker channel with descriptor passing
//! - **config** / **logging**: options, CLI and tracing setup

#[cfg(not(unix))]
compile_error!("sticky-cluster passes sockets between processes and requires a Unix platform");

pub mod cluster;
pub mod config;
pub mod ipc;
pub mod logging;
pub mod router;
pub mod types;
pub mod worker;

pub use cluster::{ClusterMaster, ClusterOrchestrator, WorkerSupervisor};
pub use config::{Args, ClusterOptions, Config};
pub use router::slot_for;
pub use types::{ClusterError, ClusterExit, Result, WorkerSlot};
pub use worker::{ConnectionHandler, EchoHandler, WorkerContext};
