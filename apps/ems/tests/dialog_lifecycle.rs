//! Dialog Lifecycle Tests
//!
//! Drives a started daemon end to end: a WebSocket client on one side, a
//! scripted broker adapter on an in-memory link on the other.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use duplex_transport::{MemoryAcceptor, MemoryConnector, MemoryPeer, RpcResponse};
use ems::{ClientEvent, EmsConfig, ManualClock, RunningEms, start};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> EmsConfig {
    config_with("127.0.0.1:0")
}

fn config_with(listen_addr: &str) -> EmsConfig {
    let vars = HashMap::from([
        ("EMS_LISTEN_ADDR", listen_addr),
        ("EMS_BROKERD", "kraken=ws://kraken.test/rpc"),
        ("EMS_ACCOUNTS", "acct1=kraken"),
        ("EMS_RECONNECT_DELAY_MS", "5"),
    ]);
    EmsConfig::from_lookup(|key| vars.get(key).map(|v| (*v).to_string())).unwrap()
}

struct Harness {
    ems: RunningEms,
    brokerd: MemoryPeer,
    _acceptor: MemoryAcceptor,
    cancel: CancellationToken,
}

impl Harness {
    async fn start() -> Self {
        let (connector, mut acceptor) = MemoryConnector::new();
        let cancel = CancellationToken::new();
        let ems = start(
            &config(),
            Arc::new(connector),
            Arc::new(ManualClock::new(1_000)),
            &cancel,
        )
        .await
        .unwrap();

        let mut brokerd = timeout(WAIT, acceptor.accept()).await.unwrap().unwrap();
        let hello = timeout(WAIT, brokerd.recv_json()).await.unwrap().unwrap();
        assert_eq!(hello["method"], "open_trade_dialog");
        assert_eq!(hello["params"]["accounts"], json!(["acct1"]));

        Self {
            ems,
            brokerd,
            _acceptor: acceptor,
            cancel,
        }
    }

    async fn client(&self) -> Client {
        let url = format!("ws://{}", self.ems.local_addr());
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws
    }

    /// Next request written to the adapter, answered with an empty result.
    async fn accept_request(&mut self) -> Value {
        let request = timeout(WAIT, self.brokerd.recv_json()).await.unwrap().unwrap();
        let id = request["id"].as_u64().unwrap();
        self.brokerd
            .send_json(&serde_json::to_value(RpcResponse::success(id, json!({}))).unwrap());
        request
    }

    fn brokerd_event(&self, event: Value) {
        assert!(self.brokerd.send_json(&json!({
            "jsonrpc": "2.0",
            "method": "brokerd_event",
            "params": event,
        })));
    }

    async fn stop(self) {
        self.cancel.cancel();
        timeout(WAIT, self.ems.join()).await.unwrap();
    }
}

async fn send(client: &mut Client, frame: Value) {
    client.send(Message::Text(frame.to_string().into())).await.unwrap();
}

async fn next_event(client: &mut Client) -> Value {
    loop {
        let frame = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = frame {
            let event: Value = serde_json::from_str(text.as_str()).unwrap();
            // every frame must also decode as a typed event
            serde_json::from_value::<ClientEvent>(event.clone()).unwrap();
            return event;
        }
    }
}

fn order(oid: &str, exec_mode: &str, price: f64) -> Value {
    json!({
        "name": "order",
        "oid": oid,
        "action": "buy",
        "exec_mode": exec_mode,
        "symbol": "XBTUSD",
        "account": "acct1",
        "price": price,
        "size": 1,
    })
}

#[tokio::test]
async fn live_order_runs_from_pending_to_closed() {
    let mut harness = Harness::start().await;
    let mut client = harness.client().await;

    send(&mut client, order("a1", "live", 100.0)).await;

    let pending = next_event(&mut client).await;
    assert_eq!(pending["name"], "status");
    assert_eq!(pending["oid"], "a1");
    assert_eq!(pending["resp"], "pending");
    assert!(pending.get("reqid").is_none());

    let request = harness.accept_request().await;
    assert_eq!(request["method"], "order");
    assert_eq!(request["params"]["name"], "order");
    assert_eq!(request["params"]["oid"], "a1");
    assert_eq!(request["params"]["symbol"], "XBTUSD");
    assert!(request["params"].get("reqid").is_none());

    harness.brokerd_event(json!({
        "name": "ack", "reqid": "b1", "oid": "a1", "account": "acct1",
    }));
    let open = next_event(&mut client).await;
    assert_eq!(open["resp"], "open");
    assert_eq!(open["reqid"], "b1");

    harness.brokerd_event(json!({
        "name": "fill", "reqid": "b1", "time_ns": 2_000, "size": 1, "price": 100,
        "action": "buy", "broker_time": 1.5,
    }));
    let fill = next_event(&mut client).await;
    assert_eq!(fill["resp"], "fill");
    assert_eq!(fill["brokerd_msg"]["reqid"], "b1");

    harness.brokerd_event(json!({
        "name": "status", "reqid": "b1", "time_ns": 3_000, "status": "fill",
        "account": "acct1", "filled": 1, "remaining": 0,
    }));
    let closed = next_event(&mut client).await;
    assert_eq!(closed["resp"], "closed");
    assert_eq!(closed["reqid"], "b1");
    harness.stop().await;
}

#[tokio::test]
async fn dark_order_is_canceled_without_reaching_the_broker() {
    let mut harness = Harness::start().await;
    let mut client = harness.client().await;

    send(&mut client, order("d1", "dark", 90.0)).await;
    let dark = next_event(&mut client).await;
    assert_eq!(dark["resp"], "dark_open");

    send(&mut client, json!({"name": "cancel", "oid": "d1", "symbol": "XBTUSD"})).await;
    let canceled = next_event(&mut client).await;
    assert_eq!(canceled["resp"], "canceled");
    assert_eq!(canceled["oid"], "d1");

    let nothing = timeout(Duration::from_millis(100), harness.brokerd.recv_text()).await;
    assert!(nothing.is_err(), "dark order leaked to the adapter");
    harness.stop().await;
}

#[tokio::test]
async fn crossing_quote_sends_dark_order_to_the_broker() {
    let mut harness = Harness::start().await;
    let mut client = harness.client().await;

    send(&mut client, json!({"name": "quote", "symbol": "XBTUSD", "price": 100})).await;
    send(&mut client, order("d1", "dark", 95.0)).await;
    assert_eq!(next_event(&mut client).await["resp"], "dark_open");

    send(&mut client, json!({"name": "quote", "symbol": "XBTUSD", "price": 94.5})).await;
    assert_eq!(next_event(&mut client).await["resp"], "triggered");

    let request = harness.accept_request().await;
    assert_eq!(request["method"], "order");
    assert_eq!(request["params"]["oid"], "d1");
    harness.stop().await;
}

#[tokio::test]
async fn statuses_reach_every_client_but_rejections_only_the_sender() {
    let mut harness = Harness::start().await;
    let mut bob = harness.client().await;
    let mut alice = harness.client().await;

    send(&mut alice, json!({"name": "order", "oid": "x1", "action": "buy"})).await;
    let rejected = next_event(&mut alice).await;
    assert_eq!(rejected["resp"], "error");
    assert_eq!(rejected["oid"], "x1");
    assert!(rejected["reason"].as_str().is_some_and(|r| !r.is_empty()));

    send(&mut alice, order("a1", "live", 100.0)).await;
    assert_eq!(next_event(&mut alice).await["resp"], "pending");
    // bob sees the dialog but never saw the rejection
    let seen = next_event(&mut bob).await;
    assert_eq!(seen["oid"], "a1");
    assert_eq!(seen["resp"], "pending");

    harness.accept_request().await;
    harness.stop().await;
}

#[tokio::test]
async fn adapter_error_fails_the_dialog() {
    let mut harness = Harness::start().await;
    let mut client = harness.client().await;

    send(&mut client, order("a1", "live", 100.0)).await;
    assert_eq!(next_event(&mut client).await["resp"], "pending");
    harness.accept_request().await;

    harness.brokerd_event(json!({
        "name": "error", "oid": "a1", "symbol": "XBTUSD", "reason": "insufficient margin",
    }));
    let failed = next_event(&mut client).await;
    assert_eq!(failed["resp"], "error");
    assert_eq!(failed["reason"], "insufficient margin");
    harness.stop().await;
}

#[tokio::test]
async fn positions_are_relayed_and_replayed_to_new_clients() {
    let harness = Harness::start().await;
    let mut early = harness.client().await;

    harness.brokerd_event(json!({
        "name": "position", "broker": "kraken", "account": "acct1", "symbol": "XBTUSD",
        "size": 2, "avg_price": 101.5, "currency": "USD",
    }));
    let position = next_event(&mut early).await;
    assert_eq!(position["name"], "position");
    assert_eq!(position["symbol"], "XBTUSD");

    let mut late = harness.client().await;
    let replayed = next_event(&mut late).await;
    assert_eq!(replayed["name"], "position");
    assert_eq!(replayed["account"], "acct1");
    harness.stop().await;
}

#[tokio::test]
async fn failed_bind_starts_no_relays() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = taken.local_addr().unwrap().to_string();
    let (connector, _acceptor) = MemoryConnector::new();
    let cancel = CancellationToken::new();

    let started = start(
        &config_with(&addr),
        Arc::new(connector.clone()),
        Arc::new(ManualClock::new(1_000)),
        &cancel,
    )
    .await;
    assert!(started.is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.attempts(), 0);
}
