//! Socket factories used by initiators to (re)connect.

use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::transport::socket::{memory_pair, Socket};

type DialFn = dyn Fn() -> BoxFuture<'static, Result<Socket>> + Send + Sync + 'static;

/// Opens a fresh socket to the acceptor every time it is called
#[derive(Clone)]
pub struct Dialer {
    target: Arc<str>,
    dial: Arc<DialFn>,
}

impl Dialer {
    pub fn new<F, Fut>(target: impl Into<String>, dial: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Socket>> + Send + 'static,
    {
        let target: String = target.into();
        Self {
            target: Arc::from(target),
            dial: Arc::new(move || dial().boxed()),
        }
    }

    /// Connect over TCP with Nagle disabled
    pub fn tcp(address: impl Into<String>, max_frame_size: usize) -> Self {
        let address: String = address.into();
        let target = address.clone();
        Self::new(target, move || {
            let address = address.clone();
            async move {
                let stream = TcpStream::connect(&address).await?;
                stream.set_nodelay(true)?;
                debug!(address = %address, "TCP connection established");
                Ok(Socket::new(stream, max_frame_size))
            }
        })
    }

    /// Connect through an in-process pipe; the far end is handed to `acceptor`
    pub fn memory(acceptor: mpsc::UnboundedSender<Socket>, max_frame_size: usize) -> Self {
        Self::new("memory", move || {
            let (local, remote) = memory_pair(max_frame_size);
            let handed_over = acceptor
                .send(remote)
                .map_err(|_| ProtocolError::ConnectionClosed);
            async move {
                handed_over?;
                Ok(local)
            }
        })
    }

    pub async fn dial(&self) -> Result<Socket> {
        (self.dial)().await
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer").field("target", &self.target).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::MAX_FRAME_SIZE;
    use crate::core::message::Envelope;

    #[tokio::test]
    async fn test_memory_dialer_hands_over_far_end() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dialer = Dialer::memory(tx, MAX_FRAME_SIZE);

        let mut local = dialer.dial().await.unwrap();
        let mut remote = rx.recv().await.unwrap();
        local.send(Envelope::invalidate()).await.unwrap();
        assert!(remote.recv().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_memory_dialer_fails_without_acceptor() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let dialer = Dialer::memory(tx, MAX_FRAME_SIZE);
        assert!(matches!(
            dialer.dial().await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }
}
