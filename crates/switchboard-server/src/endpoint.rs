//! Listening endpoint.
//!
//! A bound TCP listener plus the accept loop feeding a [`WsEngine`]. The
//! endpoint is the server's public network handle: its local address is what
//! `port()` reports.

use std::net::SocketAddr;

use parking_lot::Mutex;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{engine::WsEngine, error::ServerError};

/// Bound listener with a running accept loop.
#[derive(Debug)]
pub struct Endpoint {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    /// Bind `addr` and start accepting into `engine`.
    ///
    /// # Errors
    ///
    /// - `ServerError::Transport` if the address cannot be bound
    pub async fn bind(addr: &str, engine: WsEngine) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        info!(%local_addr, "endpoint listening");
        let task = tokio::spawn(accept_loop(listener, engine, shutdown.clone()));

        Ok(Self { local_addr, shutdown, task: Mutex::new(Some(task)) })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the listener to be released. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "accept loop panicked");
            }
            info!(local_addr = %self.local_addr, "endpoint closed");
        }
    }
}

async fn accept_loop(listener: TcpListener, engine: WsEngine, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted tcp stream");
                    engine.handle_stream(stream, peer);
                },
                Err(e) => {
                    error!(error = %e, "accept failed");
                },
            },
        }
    }
}
