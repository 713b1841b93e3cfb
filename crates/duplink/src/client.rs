//! Dial loop with automatic reconnection and backoff.

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{info, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::ClientConfig;
use crate::error::LinkError;
use crate::link::{self, Role};
use crate::schema::Protocol;
use crate::supervisor::{self, SessionOutcome};

/// Dials the configured server and drives the link until it closes.
///
/// With reconnection enabled (the default), lost connections are redialed
/// with exponential backoff; every attempt builds a brand-new link, so
/// [`Protocol::define`] and [`Protocol::on_ready`] run again and no state
/// carries over. The loop stops on a clean closure from either side, on
/// an [`LinkError::IncompatibleLink`] outcome (redialing cannot fix a
/// schema mismatch), or after the first failure when reconnection is
/// disabled.
///
/// # Errors
///
/// The final connection's fatal error, if it did not close cleanly.
pub async fn run<P: Protocol>(config: ClientConfig, mut protocol: P) -> Result<(), LinkError> {
    let mut backoff = ExponentialBackoff::from_config(&config.reconnect);

    loop {
        let outcome = connect_and_drive(&config, &mut protocol).await;
        match outcome.result {
            Ok(()) => {
                info!("link closed cleanly");
                return Ok(());
            }
            Err(err @ LinkError::IncompatibleLink { .. }) => {
                warn!(error = %err, "incompatible link, not retrying");
                return Err(err);
            }
            Err(err) if !config.reconnect.enabled => return Err(err),
            Err(err) => {
                warn!(error = %err, "connection lost");
                if outcome.authenticated {
                    // The last session was healthy; start the backoff
                    // series over.
                    backoff.reset();
                }
            }
        }

        let delay = backoff.next_delay();
        info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnecting"
        );
        tokio::time::sleep(delay).await;
    }
}

async fn connect_and_drive<P: Protocol>(
    config: &ClientConfig,
    protocol: &mut P,
) -> SessionOutcome {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.link.max_message_size);
    ws_config.max_frame_size = Some(config.link.max_message_size);

    let connected = tokio_tungstenite::connect_async_with_config(
        config.url.as_str(),
        Some(ws_config),
        false,
    )
    .await;
    let (ws, _response) = match connected {
        Ok(connected) => connected,
        Err(err) => {
            return SessionOutcome {
                authenticated: false,
                result: Err(LinkError::InvalidConnection(err.to_string())),
            }
        }
    };

    let (core, link, commands) = link::build(Role::Client, protocol, &config.link);
    supervisor::drive(ws, core, link, commands, protocol, &config.link).await
}
