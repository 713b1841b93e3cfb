//! Shared fixtures for the integration tests: a small sensor protocol,
//! server/client spawners, and a raw JSON client for wire-level checks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use duplink::server::ServerState;
use duplink::{
    client, server, ClientConfig, Event, Function, InboundEvent, InboundFunction, Link, LinkError,
    OutboundEvent, OutboundFunction, Protocol, Registry, ServerConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Temp {
    pub c: f64,
}

impl Event for Temp {
    const NAME: &'static str = "Temp";
}
impl InboundEvent for Temp {}
impl OutboundEvent for Temp {}

pub struct Ping;

#[derive(Serialize, Deserialize)]
pub struct PingParams {
    pub seq: u64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct PingResults {
    pub pong: u64,
}

impl Function for Ping {
    const NAME: &'static str = "Ping";
    type Params = PingParams;
    type Results = PingResults;
}
impl InboundFunction for Ping {}
impl OutboundFunction for Ping {}

/// Test protocol: bidirectional `Temp` event plus a `Ping` function whose
/// handler fails with "overloaded" for `seq == 0`.
pub struct SensorProtocol {
    version: u32,
    ready_tx: mpsc::UnboundedSender<Link>,
}

impl SensorProtocol {
    pub fn new(version: u32, ready_tx: mpsc::UnboundedSender<Link>) -> Self {
        Self { version, ready_tx }
    }
}

impl Protocol for SensorProtocol {
    fn link_version(&self) -> u32 {
        self.version
    }

    fn define(&mut self, reg: &mut Registry) {
        reg.bidirectional_event::<Temp>();
        reg.bidirectional_function::<Ping, _>(|params: PingParams| {
            if params.seq == 0 {
                Err("overloaded".to_owned())
            } else {
                Ok(PingResults { pong: params.seq })
            }
        });
    }

    fn on_ready(&mut self, link: Link) {
        let _ = self.ready_tx.send(link);
    }
}

/// Starts a server with the test protocol. Returns its URL, the shared
/// state, and a channel yielding the handle of every authenticated link.
pub async fn start_server(version: u32) -> (String, Arc<ServerState>, mpsc::UnboundedReceiver<Link>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (ready_tx, ready_rx) = mpsc::unbounded_channel();

    let state = ServerState::new(ServerConfig::default());
    let run_state = Arc::clone(&state);
    tokio::spawn(async move {
        let _ = server::run(listener, run_state, move || {
            SensorProtocol::new(version, ready_tx.clone())
        })
        .await;
    });

    (format!("ws://{addr}"), state, ready_rx)
}

/// Spawns a client with the test protocol and reconnection disabled.
pub fn spawn_client(
    url: &str,
    version: u32,
) -> (
    mpsc::UnboundedReceiver<Link>,
    JoinHandle<Result<(), LinkError>>,
) {
    let (ready_tx, ready_rx) = mpsc::unbounded_channel();
    let mut config = ClientConfig::new(url);
    config.reconnect.enabled = false;
    let handle = tokio::spawn(client::run(
        config,
        SensorProtocol::new(version, ready_tx),
    ));
    (ready_rx, handle)
}

/// Awaits a future for at most five seconds.
pub async fn within<T>(what: &str, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

type RawSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, WsMessage>;
type RawStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// A client speaking raw JSON frames, for pinning the wire format.
pub struct RawClient {
    ws_tx: RawSink,
    ws_rx: RawStream,
}

impl RawClient {
    pub async fn connect(url: &str) -> Self {
        let (ws, _response) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self { ws_tx, ws_rx }
    }

    pub async fn send_json(&mut self, value: Value) {
        self.ws_tx
            .send(WsMessage::Text(value.to_string()))
            .await
            .unwrap();
    }

    /// Next text frame as JSON; transport ping/pong frames are skipped.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            match within("a text frame", self.ws_rx.next()).await {
                Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(WsMessage::Ping(payload))) => {
                    self.ws_tx.send(WsMessage::Pong(payload)).await.unwrap();
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    /// Waits for the close frame, returning its code and reason.
    pub async fn recv_close(&mut self) -> (u16, String) {
        loop {
            match within("a close frame", self.ws_rx.next()).await {
                Some(Ok(WsMessage::Close(Some(frame)))) => {
                    return (frame.code.into(), frame.reason.into_owned());
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    self.ws_tx.send(WsMessage::Pong(payload)).await.unwrap();
                }
                Some(Ok(_)) => {}
                other => panic!("expected a close frame, got {other:?}"),
            }
        }
    }

    /// Runs the client side of the handshake against a server that uses
    /// the given link version, returning the server's auth offer.
    pub async fn handshake(&mut self, link_version: u32) -> Value {
        let server_auth = self.recv_json().await;
        assert_eq!(server_auth["type"], "auth");
        let server_tid = server_auth["tid"].as_i64().unwrap();

        self.send_json(serde_json::json!({
            "type": "auth",
            "tid": -1,
            "proto_version": [0, 1, 0],
            "link_version": link_version,
            "events": ["Temp"],
            "data_sources": [],
            "functions": ["Ping"],
        }))
        .await;
        self.send_json(serde_json::json!({"type": "auth_ack", "tid": server_tid}))
            .await;

        let ack = self.recv_json().await;
        assert_eq!(ack["type"], "auth_ack");
        assert_eq!(ack["tid"], -1);
        server_auth
    }
}
