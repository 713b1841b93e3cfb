//! End-to-end demo: a thermometer server and a display client in one
//! process. The server pushes `Temp` events; the client subscribes to
//! them and calls the server's `Ping` function.
//!
//! Usage: cargo run --example thermo

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use duplink::server::ServerState;
use duplink::{
    client, server, ClientConfig, Event, Function, InboundEvent, InboundFunction, Link,
    OutboundEvent, OutboundFunction, Protocol, Registry, ServerConfig,
};

#[derive(Debug, Serialize, Deserialize)]
struct Temp {
    c: f64,
}

impl Event for Temp {
    const NAME: &'static str = "Temp";
}
impl InboundEvent for Temp {}
impl OutboundEvent for Temp {}

struct Ping;

#[derive(Serialize, Deserialize)]
struct PingParams {
    seq: u64,
}

#[derive(Serialize, Deserialize)]
struct PingResults {
    pong: u64,
}

impl Function for Ping {
    const NAME: &'static str = "Ping";
    type Params = PingParams;
    type Results = PingResults;
}
impl InboundFunction for Ping {}
impl OutboundFunction for Ping {}

/// Server side: supplies `Temp` readings and answers `Ping`.
struct Thermometer {
    ready_tx: mpsc::UnboundedSender<Link>,
}

impl Protocol for Thermometer {
    fn link_version(&self) -> u32 {
        1
    }

    fn define(&mut self, reg: &mut Registry) {
        reg.outgoing_event::<Temp>();
        reg.incoming_function::<Ping, _>(|params: PingParams| {
            Ok(PingResults { pong: params.seq })
        });
    }

    fn on_ready(&mut self, link: Link) {
        let _ = self.ready_tx.send(link);
    }
}

/// Client side: consumes `Temp` readings and calls `Ping`.
struct Display {
    ready_tx: mpsc::UnboundedSender<Link>,
}

impl Protocol for Display {
    fn link_version(&self) -> u32 {
        1
    }

    fn define(&mut self, reg: &mut Registry) {
        reg.incoming_event::<Temp>();
        reg.outgoing_function::<Ping>();
    }

    fn on_ready(&mut self, link: Link) {
        let _ = self.ready_tx.send(link);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}", listener.local_addr()?);

    let (server_ready_tx, mut server_ready_rx) = mpsc::unbounded_channel();
    let state = ServerState::new(ServerConfig::default());
    tokio::spawn(server::run(listener, state, move || Thermometer {
        ready_tx: server_ready_tx.clone(),
    }));

    let (client_ready_tx, mut client_ready_rx) = mpsc::unbounded_channel();
    let client = tokio::spawn(client::run(
        ClientConfig::new(&url),
        Display {
            ready_tx: client_ready_tx,
        },
    ));

    let server_link = server_ready_rx.recv().await.expect("server link");
    let client_link = client_ready_rx.recv().await.expect("client link");

    let _subscription = client_link.subscribe::<Temp, _>(|reading| {
        info!(celsius = reading.c, "temperature update");
    })?;

    for seq in 1..=3u64 {
        let results = client_link.call::<Ping>(&PingParams { seq }).await?;
        info!(seq, pong = results.pong, "ping answered");

        server_link.emit(&Temp {
            c: 20.0 + seq as f64,
        })?;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    client_link.close();
    client.await??;
    info!("demo finished");
    Ok(())
}
