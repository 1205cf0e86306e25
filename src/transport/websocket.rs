//! WebSocket transport
//!
//! This file implements the listener of the benchmark server. Responsibilities:
//! - Bind the configured TCP endpoint; a bind failure aborts startup
//! - Accept connections and run each handshake in its own task so a slow or
//!   broken client never holds up the others
//! - Hand every upgraded connection to a [`Session`] with its own writer task
//! - On shutdown, stop accepting, close every open session and wait for all
//!   of them to finish

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_async;
use tracing::{error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::config::{MalformedPolicy, Settings};
use crate::registry::SharedRegistry;
use crate::registry::engine::lock;
use crate::transport::session::{self, Session, spawn_writer};
use crate::utils::error::ServerError;

/// Pause after a failed `accept()` so a persistent error (e.g. too many
/// open files) does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A bound, not yet running, benchmark server.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    registry: SharedRegistry,
    settings: Settings,
}

impl Server {
    pub async fn bind(settings: Settings, registry: SharedRegistry) -> Result<Self, ServerError> {
        let addr = settings.server.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Self {
            listener,
            registry,
            settings,
        })
    }

    /// The address actually bound, useful when the configured port is 0.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` completes, then closes every
    /// session and returns once all of them have finished.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Self {
            listener,
            registry,
            settings,
        } = self;

        info!("WebSocket server listening on ws://{}", listener.local_addr()?);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();
        let policy = settings.session.on_malformed;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "Client connecting");
                        if settings.server.nodelay {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!(%peer, error = %e, "Failed to set TCP_NODELAY");
                            }
                        }
                        sessions.spawn(handle_connection(
                            stream,
                            peer,
                            registry.clone(),
                            policy,
                            stop_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        error!(error = %e, "Session task failed");
                    }
                }
            }
        }

        drop(listener);
        info!(
            open = lock(&registry).len(),
            "Shutdown signal received, closing open sessions"
        );
        stop_tx.send_replace(true);

        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "Session task failed");
            }
        }

        let registry = lock(&registry);
        info!(
            opened = registry.total_opened(),
            closed = registry.total_closed(),
            "WebSocket server stopped"
        );
        Ok(())
    }
}

/// Binds according to `settings` and serves until Ctrl-C.
pub async fn start_websocket_server(
    settings: Settings,
    registry: SharedRegistry,
) -> Result<(), ServerError> {
    let server = Server::bind(settings, registry).await?;
    server.run_until(shutdown_signal()).await
}

/// Completes on Ctrl-C. If the handler cannot be installed the server runs
/// until killed.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: SharedRegistry,
    policy: MalformedPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let handshake = tokio::select! {
        result = accept_async(stream) => result,
        _ = session::stopped(&mut shutdown) => return,
    };

    let ws_stream = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "WebSocket handshake error");
            return;
        }
    };

    let (ws_sender, ws_receiver) = ws_stream.split();
    let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();
    let writer = spawn_writer(ws_sender, rx, peer.to_string());

    session::run(
        Session::new(peer.to_string(), tx, registry, policy),
        ws_receiver,
        writer,
        shutdown,
    )
    .await;
}
