//! Connection handlers - what a worker does with a connection it was given

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::WorkerContext;

/// Consumer of live client connections inside a worker.
///
/// The stream is owned by the handler; dropping it closes the worker's copy.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr);
}

/// Greets with the worker's identity, then echoes everything back.
pub struct EchoHandler {
    greeting: String,
}

impl EchoHandler {
    pub fn new(context: &WorkerContext) -> Self {
        Self {
            greeting: format!("{} slot {}\n", context.name, context.slot),
        }
    }
}

#[async_trait]
impl ConnectionHandler for EchoHandler {
    async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.write_all(self.greeting.as_bytes()).await {
            debug!(%peer, error = %e, "Greeting failed");
            return;
        }

        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = stream.write_all(&buf[..n]).await {
                        debug!(%peer, error = %e, "Echo write failed");
                        break;
                    }
                }
                Err(e) => {
                    debug!(%peer, error = %e, "Echo read failed");
                    break;
                }
            }
        }
        let _ = stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_echo_handler_greets_and_echoes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handler = EchoHandler::new(&WorkerContext {
            slot: 1,
            name: "Worker 2".to_string(),
            ipc_fd: None,
            is_primary: false,
        });
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            handler.handle(stream, peer).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply, "Worker 2 slot 1\nabc");

        server.await.unwrap();
    }
}
