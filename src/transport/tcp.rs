//! TCP listener feeding accepted sockets to a connection handler.
//!
//! The accept loop runs until a shutdown signal arrives, then waits (bounded by the shutdown
//! timeout) for the spawned connection handlers to finish.

use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::transport::socket::Socket;

type SocketHandler = dyn Fn(Socket, SocketAddr) -> BoxFuture<'static, ()> + Send + Sync + 'static;

/// Options of the accept loop
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub max_frame_size: usize,
    pub shutdown_timeout: Duration,
}

/// Accept connections on `listener` until `shutdown_rx` fires
#[instrument(skip_all, fields(local = ?listener.local_addr().ok()))]
pub async fn serve<F>(
    listener: TcpListener,
    options: ServeOptions,
    mut shutdown_rx: mpsc::Receiver<()>,
    handler: F,
) -> Result<()>
where
    F: Fn(Socket, SocketAddr) -> BoxFuture<'static, ()> + Send + Sync + 'static,
{
    let handler: Arc<SocketHandler> = Arc::new(handler);
    let active_connections = Arc::new(Mutex::new(0u32));
    info!("Listening for link connections");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutting down listener. Waiting for connections to close...");

                let timeout = tokio::time::sleep(options.shutdown_timeout);
                tokio::pin!(timeout);

                loop {
                    let connections = *active_connections.lock().await;
                    if connections == 0 {
                        info!("All connections closed, shutting down");
                        break;
                    }
                    tokio::select! {
                        _ = &mut timeout => {
                            warn!(connections = %connections, "Shutdown timeout reached, forcing exit");
                            break;
                        }
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {
                            debug!(connections = %connections, "Waiting for connections to close");
                        }
                    }
                }

                return Ok(());
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(peer = %peer, error = %e, "Failed to disable Nagle");
                        }
                        debug!(peer = %peer, "Accepted connection");
                        let active_connections = active_connections.clone();
                        let handler = handler.clone();
                        let socket = Socket::new(stream, options.max_frame_size);

                        {
                            let mut count = active_connections.lock().await;
                            *count += 1;
                        }

                        tokio::spawn(async move {
                            handler(socket, peer).await;

                            let mut count = active_connections.lock().await;
                            *count -= 1;
                            debug!(peer = %peer, "Connection handler finished");
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::MAX_FRAME_SIZE;
    use crate::core::message::{Envelope, MessageKind};
    use crate::transport::dialer::Dialer;
    use futures::FutureExt;

    #[tokio::test]
    async fn test_serve_hands_sockets_to_handler_and_stops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let options = ServeOptions {
            max_frame_size: MAX_FRAME_SIZE,
            shutdown_timeout: Duration::from_secs(1),
        };

        let server = tokio::spawn(serve(listener, options, shutdown_rx, |mut socket, _peer| {
            async move {
                while let Some(Ok(envelope)) = socket.recv().await {
                    if socket.send(envelope).await.is_err() {
                        break;
                    }
                }
            }
            .boxed()
        }));

        let mut client = Dialer::tcp(address, MAX_FRAME_SIZE).dial().await.unwrap();
        client.send(Envelope::heartbeat(9)).await.unwrap();
        let echoed = client.recv().await.unwrap().unwrap();
        assert_eq!(echoed.kind, MessageKind::Heartbeat);
        drop(client);

        shutdown_tx.send(()).await.unwrap();
        server.await.unwrap().unwrap();
    }
}
