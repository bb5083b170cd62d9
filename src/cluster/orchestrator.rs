//! Entry point that decides what this process is
//!
//! The same binary runs as master and as every worker. The role is fixed
//! once at startup from the worker environment the supervisor sets on its
//! children; without it the process is the master.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use super::launcher::ProcessLauncher;
use super::master::ClusterMaster;
use crate::config::ClusterOptions;
use crate::types::{ClusterError, ClusterExit, Result};
use crate::worker::{ConnectionHandler, WorkerContext, WorkerRuntime};

/// What this process is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker(WorkerContext),
}

/// Read the role marker from the environment.
pub fn detect_role(options: &ClusterOptions) -> Result<Role> {
    Ok(match WorkerContext::from_env(options.concurrency)? {
        Some(context) => Role::Worker(context),
        None => Role::Master,
    })
}

pub struct ClusterOrchestrator {
    options: ClusterOptions,
}

impl ClusterOrchestrator {
    /// Normalize and validate options. Nothing is opened yet.
    pub fn new(options: ClusterOptions) -> Result<Self> {
        let options = options.normalized();
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    /// Run the process in its role until it is told to stop.
    ///
    /// `on_become_master` runs once in the master before the listener opens.
    /// `on_become_worker` runs once in each worker (or in the single process
    /// when clustering is off) and returns the connection handler.
    pub async fn start<M, MF, W, WF>(self, on_become_master: M, on_become_worker: W) -> Result<ClusterExit>
    where
        M: FnOnce(ClusterOptions) -> MF,
        MF: Future<Output = Result<()>>,
        W: FnOnce(WorkerContext) -> WF,
        WF: Future<Output = Result<Arc<dyn ConnectionHandler>>>,
    {
        if !self.options.clustered {
            return self.run_standalone(on_become_worker).await;
        }

        match detect_role(&self.options)? {
            Role::Worker(context) => {
                let runtime = WorkerRuntime::connect(context.clone(), &self.options)?;
                let handler = on_become_worker(context).await?;
                runtime.serve(handler).await?;
                Ok(ClusterExit::Served)
            }
            Role::Master => {
                let shutdown = shutdown_signal()?;
                on_become_master(self.options.clone()).await?;
                let launcher = ProcessLauncher::current_exe()?;
                let mut master = ClusterMaster::new(self.options, launcher)?;
                master.start(shutdown).await
            }
        }
    }

    async fn run_standalone<W, WF>(self, on_become_worker: W) -> Result<ClusterExit>
    where
        W: FnOnce(WorkerContext) -> WF,
        WF: Future<Output = Result<Arc<dyn ConnectionHandler>>>,
    {
        let shutdown = shutdown_signal()?;
        let handler = on_become_worker(WorkerContext::standalone()).await?;

        let addr = SocketAddr::new(self.options.host, self.options.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ClusterError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        info!(%addr, "Serving without workers");

        serve_standalone(listener, handler, shutdown).await;
        Ok(ClusterExit::Served)
    }
}

/// Accept on `listener` and run `handler` in-process until `shutdown` resolves.
pub async fn serve_standalone<F>(listener: TcpListener, handler: Arc<dyn ConnectionHandler>, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move { handler.handle(stream, peer).await });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
            _ = &mut shutdown => break,
        }
    }
}

/// Resolves on the first SIGINT or SIGTERM. Handlers are installed immediately.
pub fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    let mut interrupt = signal(SignalKind::interrupt()).map_err(ClusterError::Signal)?;
    let mut terminate = signal(SignalKind::terminate()).map_err(ClusterError::Signal)?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("SIGINT received"),
            _ = terminate.recv() => info!("SIGTERM received"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_CONCURRENCY;
    use crate::worker::EchoHandler;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    #[test]
    fn test_new_normalizes_defaults() {
        let orchestrator = ClusterOrchestrator::new(ClusterOptions {
            prefix: String::new(),
            port: 0,
            ..ClusterOptions::default()
        })
        .unwrap();

        let options = orchestrator.options();
        assert_eq!(options.prefix, "sticky-cluster");
        assert_eq!(options.port, 3000);
        assert!(options.concurrency >= 1);
    }

    #[test]
    fn test_new_rejects_oversized_cluster() {
        let result = ClusterOrchestrator::new(ClusterOptions {
            concurrency: MAX_CONCURRENCY + 1,
            ..ClusterOptions::default()
        });
        assert!(matches!(result, Err(ClusterError::Config(_))));
    }

    #[tokio::test]
    async fn test_standalone_serves_in_process() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler: Arc<dyn ConnectionHandler> = Arc::new(EchoHandler::new(&WorkerContext::standalone()));

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_standalone(listener, handler, async {
            let _ = stop_rx.await;
        }));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hi").await.unwrap();
        client.shutdown().await.unwrap();
        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply, "Main slot 0\nhi");

        stop_tx.send(()).unwrap();
        server.await.unwrap();
    }
}
