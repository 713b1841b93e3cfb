//! Accept loop and shared server state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::LinkError;
use crate::link::{self, Link, Role};
use crate::schema::Protocol;
use crate::supervisor;

/// Identifier of one accepted connection within a server.
pub type LinkId = u64;

/// Shared state of a server endpoint: its configuration and the set of
/// links it currently owns.
pub struct ServerState {
    /// Runtime server configuration.
    pub config: ServerConfig,
    links: DashMap<LinkId, Link>,
    next_link_id: AtomicU64,
}

impl ServerState {
    /// Creates shared state for an accept loop.
    #[must_use]
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            links: DashMap::new(),
            next_link_id: AtomicU64::new(1),
        })
    }

    /// Number of currently open connections.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Snapshot of the handles of all open links, e.g. for broadcasting
    /// an event to every connected peer.
    #[must_use]
    pub fn active_links(&self) -> Vec<Link> {
        self.links.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// Runs the accept loop, spawning one supervisor task per connection.
///
/// Each accepted connection gets a fresh protocol instance from
/// `factory`.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read; all
/// per-connection failures are logged and contained.
pub async fn run<P, F>(
    listener: TcpListener,
    state: Arc<ServerState>,
    factory: F,
) -> Result<(), LinkError>
where
    P: Protocol,
    F: Fn() -> P + Send + Sync + 'static,
{
    let local_addr = listener
        .local_addr()
        .map_err(|err| LinkError::InvalidConnection(err.to_string()))?;
    info!("server listening on {}", local_addr);
    let factory = Arc::new(factory);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if state.link_count() >= state.config.max_conns {
                    warn!("max connections reached, rejecting {}", addr);
                    drop(stream);
                    continue;
                }

                let state = Arc::clone(&state);
                let factory = Arc::clone(&factory);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, state, factory.as_ref()).await {
                        debug!("connection from {} closed: {}", addr, err);
                    }
                });
            }
            Err(err) => {
                error!("failed to accept connection: {}", err);
            }
        }
    }
}

async fn handle_connection<P, F>(
    stream: TcpStream,
    state: Arc<ServerState>,
    factory: &F,
) -> Result<(), LinkError>
where
    P: Protocol,
    F: Fn() -> P,
{
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(state.config.link.max_message_size);
    ws_config.max_frame_size = Some(state.config.link.max_message_size);

    let ws = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config))
        .await
        .map_err(|err| LinkError::InvalidConnection(err.to_string()))?;

    let mut protocol = factory();
    let (core, link, commands) = link::build(Role::Server, &mut protocol, &state.config.link);

    let link_id = state.next_link_id.fetch_add(1, Ordering::Relaxed);
    state.links.insert(link_id, link.clone());

    let outcome =
        supervisor::drive(ws, core, link, commands, &mut protocol, &state.config.link).await;

    state.links.remove(&link_id);
    outcome.result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;

    #[test]
    fn state_starts_with_no_links() {
        let state = ServerState::new(ServerConfig {
            link: LinkConfig::default(),
            max_conns: 4,
        });
        assert_eq!(state.link_count(), 0);
        assert!(state.active_links().is_empty());
    }
}
