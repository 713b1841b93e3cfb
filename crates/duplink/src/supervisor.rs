//! Per-connection driver: bridges the WebSocket transport to the link
//! state machine, runs the keepalive timer, and translates link errors
//! into close codes.

use std::borrow::Cow;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use duplink_common::CloseCode;

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::link::{Command, Link, LinkCore, Outbound};
use crate::schema::Protocol;

/// How one connection ended.
pub(crate) struct SessionOutcome {
    /// The handshake completed at least once.
    pub(crate) authenticated: bool,
    /// `Ok` for a clean closure (either side), the fatal error otherwise.
    pub(crate) result: Result<(), LinkError>,
}

type WsSink<S> = SplitSink<WebSocketStream<S>, WsMessage>;

/// Drives one connection to completion. Owns the link core for the whole
/// connection lifetime and always runs teardown before returning.
pub(crate) async fn drive<S, P>(
    ws: WebSocketStream<S>,
    mut core: LinkCore,
    link: Link,
    mut commands: mpsc::UnboundedReceiver<Command>,
    protocol: &mut P,
    config: &LinkConfig,
) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: Protocol,
{
    let (mut ws_tx, mut ws_rx) = ws.split();

    let mut authenticated = false;
    // Set once a close frame has gone out or a terminal error was seen;
    // afterwards link-produced frames are discarded and the keepalive
    // timer stops.
    let mut closing = false;
    let mut awaiting_pong = false;

    let mut ping = time::interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    let auth_deadline = time::sleep(config.auth_timeout);
    tokio::pin!(auth_deadline);

    let mut result: Result<(), LinkError> = core.on_connection_established();

    'session: while result.is_ok() {
        if let Err(err) = flush_outbound(&mut core, &mut ws_tx, &mut closing).await {
            result = Err(err);
            break 'session;
        }
        if core.take_just_authenticated() {
            authenticated = true;
            protocol.on_ready(link.clone());
        }

        let dispatched: Result<(), LinkError> = tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => core.handle_frame(&text),
                Some(Ok(WsMessage::Ping(payload))) => {
                    ws_tx.send(WsMessage::Pong(payload)).await.map_err(LinkError::from)
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    awaiting_pong = false;
                    core.on_pong_received();
                    Ok(())
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(?frame, "peer closed the connection");
                    break 'session;
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    Err(LinkError::MalformedMessage("binary frame".to_owned()))
                }
                Some(Ok(_)) => Ok(()),
                Some(Err(err)) => {
                    result = Err(err.into());
                    break 'session;
                }
                None => break 'session,
            },
            command = commands.recv() => match command {
                Some(command) => core.handle_command(command),
                None => Ok(()),
            },
            _ = ping.tick(), if !closing => {
                if awaiting_pong {
                    // A full period without a pong: the peer is gone.
                    // Forced termination, no close handshake.
                    warn!("peer stopped answering keepalive pings");
                    result = Err(LinkError::TimedOut);
                    break 'session;
                }
                awaiting_pong = true;
                ws_tx.send(WsMessage::Ping(Vec::new())).await.map_err(LinkError::from)
            }
            () = &mut auth_deadline, if !core.authenticated() => {
                Err(LinkError::Protocol("authentication timed out".to_owned()))
            }
        };

        if let Err(err) = dispatched {
            match err.close_code() {
                // Stray responses for completed transactions and
                // caller-level failures are logged, never fatal.
                None => warn!(error = %err, "non-fatal link error"),
                Some(code) => {
                    warn!(error = %err, %code, "closing connection");
                    if !closing {
                        closing = true;
                        send_close(&mut ws_tx, code).await;
                    }
                    result = Err(err);
                    break 'session;
                }
            }
        }
    }

    // Flush whatever the last dispatch produced (typically the user's
    // close frame) before tearing down.
    if result.is_ok() {
        if let Err(err) = flush_outbound(&mut core, &mut ws_tx, &mut closing).await {
            result = Err(err);
        }
    }

    core.teardown();
    drop(commands);
    protocol.on_close();

    SessionOutcome {
        authenticated,
        result,
    }
}

async fn flush_outbound<S>(
    core: &mut LinkCore,
    ws_tx: &mut WsSink<S>,
    closing: &mut bool,
) -> Result<(), LinkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for outbound in core.take_outbound() {
        match outbound {
            Outbound::Frame(msg) => {
                if *closing {
                    debug!(msg_type = %msg.msg_type(), "discarding frame during close");
                    continue;
                }
                ws_tx.send(WsMessage::Text(msg.encode()?)).await?;
            }
            Outbound::Close { code } => {
                if !*closing {
                    *closing = true;
                    send_close(ws_tx, code).await;
                }
            }
        }
    }
    Ok(())
}

async fn send_close<S>(ws_tx: &mut WsSink<S>, code: CloseCode)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code: WsCloseCode::from(code.code()),
        reason: Cow::Borrowed(code.reason()),
    };
    if let Err(err) = ws_tx.send(WsMessage::Close(Some(frame))).await {
        debug!(error = %err, "failed to send close frame");
    }
}
