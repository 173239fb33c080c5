//! Brokerd Session Tests
//!
//! The routing service and one relay against a scripted adapter: error
//! responses, malformed events, session exhaustion and restart.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use duplex_transport::{
    ChannelConfig, MemoryAcceptor, MemoryConnector, MemoryPeer, ReconnectConfig, RpcConfig,
    RpcResponse,
};
use ems::application::{CONNECTION_LOST, NO_ROUTE};
use ems::domain::messages::{Action, Cancel, ExecMode, Order, ReqId, Resp};
use ems::infrastructure::brokerd::{BrokerdRelay, BrokerdRelayConfig};
use ems::{
    ClientEvent, ClientId, ClientRequest, EmsHandle, EmsService, ManualClock, Routes,
    RoutingEngine, Status,
};
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    handle: EmsHandle,
    client: ClientId,
    events: UnboundedReceiver<ClientEvent>,
    connector: MemoryConnector,
    acceptor: MemoryAcceptor,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Fixture {
    async fn start(restart_delay: Duration) -> (Self, MemoryPeer) {
        let (connector, mut acceptor) = MemoryConnector::new();
        let cancel = CancellationToken::new();

        let routes = Routes::new(["kraken"]).with_default("kraken");
        let engine = RoutingEngine::new(routes, Arc::new(ManualClock::new(1_000)));
        let (mut service, handle) = EmsService::new(engine);

        let config = BrokerdRelayConfig {
            broker: "kraken".into(),
            channel: ChannelConfig::new("ws://kraken.test/rpc")
                .with_reconnect(ReconnectConfig::fixed(Duration::from_millis(5), 2)),
            rpc: RpcConfig::default(),
            client_name: "emsd-test".into(),
            accounts: vec!["acct1".into()],
            restart_delay,
        };
        let (relay, relay_task) =
            BrokerdRelay::spawn(config, Arc::new(connector.clone()), handle.clone(), &cancel);
        assert_eq!(relay.broker(), "kraken");
        service.register_broker("kraken", Arc::new(relay));
        let service_task = tokio::spawn(service.run(cancel.clone()));

        let client = ClientId::new();
        let events = handle.connect_client(client).unwrap();
        let peer = accept(&mut acceptor).await;

        let fixture = Self {
            handle,
            client,
            events,
            connector,
            acceptor,
            cancel,
            tasks: vec![relay_task, service_task],
        };
        (fixture, peer)
    }

    fn order(&self, oid: &str) {
        let order = Order {
            oid: oid.into(),
            action: Action::Sell,
            exec_mode: ExecMode::Live,
            symbol: "ETHUSD".into(),
            account: "acct1".into(),
            price: dec!(2500),
            size: dec!(0.5),
            brokers: vec![],
        };
        self.handle
            .request(self.client, ClientRequest::Order(order))
            .unwrap();
    }

    fn cancel(&self, oid: &str) {
        let cancel = Cancel {
            oid: oid.into(),
            symbol: "ETHUSD".into(),
        };
        self.handle
            .request(self.client, ClientRequest::Cancel(cancel))
            .unwrap();
    }

    async fn next_status(&mut self) -> Status {
        loop {
            match timeout(WAIT, self.events.recv()).await.unwrap().unwrap() {
                ClientEvent::Status(status) => return status,
                ClientEvent::Position(_) => {}
            }
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            timeout(WAIT, task).await.unwrap().unwrap();
        }
    }
}

/// Accept the next link and consume its `open_trade_dialog` greeting.
async fn accept(acceptor: &mut MemoryAcceptor) -> MemoryPeer {
    let mut peer = timeout(WAIT, acceptor.accept()).await.unwrap().unwrap();
    let hello = timeout(WAIT, peer.recv_json()).await.unwrap().unwrap();
    assert_eq!(hello["method"], "open_trade_dialog");
    assert_eq!(hello["params"]["client"], "emsd-test");
    peer
}

async fn next_request(peer: &mut MemoryPeer) -> Value {
    timeout(WAIT, peer.recv_json()).await.unwrap().unwrap()
}

fn event(peer: &MemoryPeer, params: Value) {
    assert!(peer.send_json(&json!({
        "jsonrpc": "2.0",
        "method": "brokerd_event",
        "params": params,
    })));
}

#[tokio::test]
async fn requests_are_written_in_submission_order() {
    let (mut fixture, mut peer) = Fixture::start(Duration::from_secs(60)).await;

    fixture.order("a1");
    fixture.order("a2");

    let first = next_request(&mut peer).await;
    let second = next_request(&mut peer).await;
    assert_eq!(first["params"]["oid"], "a1");
    assert_eq!(second["params"]["oid"], "a2");
    assert_eq!(first["id"], 0);
    assert_eq!(second["id"], 1);
    assert_eq!(first["params"]["action"], "sell");

    assert_eq!(fixture.next_status().await.resp, Resp::Pending);
    assert_eq!(fixture.next_status().await.resp, Resp::Pending);
    fixture.stop().await;
}

#[tokio::test]
async fn refused_request_fails_its_dialog() {
    let (mut fixture, mut peer) = Fixture::start(Duration::from_secs(60)).await;

    fixture.order("a1");
    assert_eq!(fixture.next_status().await.resp, Resp::Pending);

    let request = next_request(&mut peer).await;
    let id = request["id"].as_u64().unwrap();
    peer.send_json(&serde_json::to_value(RpcResponse::failure(id, -32_000, "size below minimum")).unwrap());

    let failed = fixture.next_status().await;
    assert_eq!(failed.oid, "a1");
    assert_eq!(failed.resp, Resp::Error);
    assert_eq!(failed.reason.as_deref(), Some("size below minimum"));
    fixture.stop().await;
}

#[tokio::test]
async fn refused_cancel_leaves_the_order_working() {
    let (mut fixture, mut peer) = Fixture::start(Duration::from_secs(60)).await;

    fixture.order("a1");
    assert_eq!(fixture.next_status().await.resp, Resp::Pending);
    next_request(&mut peer).await;
    event(&peer, json!({"name": "ack", "reqid": "b1", "oid": "a1", "account": "acct1"}));
    assert_eq!(fixture.next_status().await.resp, Resp::Open);

    fixture.cancel("a1");
    let request = next_request(&mut peer).await;
    assert_eq!(request["method"], "cancel");
    let id = request["id"].as_u64().unwrap();
    peer.send_json(&serde_json::to_value(RpcResponse::failure(id, -32_000, "too late to cancel")).unwrap());

    let refused = fixture.next_status().await;
    assert_eq!(refused.oid, "a1");
    assert_eq!(refused.resp, Resp::Open);
    assert_eq!(refused.reason.as_deref(), Some("too late to cancel"));

    // the broker still fills the order and the fill still reaches the client
    event(&peer, json!({
        "name": "status", "reqid": "b1", "time_ns": 5_000, "status": "fill",
        "account": "acct1", "filled": 0.5, "remaining": 0,
    }));
    let closed = fixture.next_status().await;
    assert_eq!(closed.resp, Resp::Closed);
    assert_eq!(closed.reqid, Some(ReqId::from("b1")));
    fixture.stop().await;
}

#[tokio::test]
async fn malformed_event_leaves_the_session_usable() {
    let (mut fixture, mut peer) = Fixture::start(Duration::from_secs(60)).await;

    fixture.order("a1");
    assert_eq!(fixture.next_status().await.resp, Resp::Pending);
    next_request(&mut peer).await;

    event(&peer, json!({"name": "ack", "oid": "a1"}));
    event(&peer, json!({"name": "mystery"}));
    event(&peer, json!({"name": "ack", "reqid": 42, "oid": "a1", "account": "acct1"}));

    let open = fixture.next_status().await;
    assert_eq!(open.resp, Resp::Open);
    assert_eq!(open.reqid, Some(ReqId::Int(42)));
    fixture.stop().await;
}

#[tokio::test]
async fn exhausted_session_fails_routed_dialogs() {
    let (mut fixture, mut peer) = Fixture::start(Duration::from_secs(60)).await;

    fixture.order("a1");
    assert_eq!(fixture.next_status().await.resp, Resp::Pending);
    next_request(&mut peer).await;
    event(&peer, json!({"name": "ack", "reqid": "b1", "oid": "a1", "account": "acct1"}));
    assert_eq!(fixture.next_status().await.resp, Resp::Open);

    fixture.connector.refuse_all(true);
    peer.disconnect();

    let lost = fixture.next_status().await;
    assert_eq!(lost.oid, "a1");
    assert_eq!(lost.resp, Resp::Error);
    assert_eq!(lost.reason.as_deref(), Some(CONNECTION_LOST));
    assert!(fixture.connector.attempts() >= 2);

    // the broker stays down until the relay reconnects
    fixture.order("a2");
    let unrouted = fixture.next_status().await;
    assert_eq!(unrouted.oid, "a2");
    assert_eq!(unrouted.reason.as_deref(), Some(NO_ROUTE));
    fixture.stop().await;
}

#[tokio::test]
async fn relay_reopens_the_session_after_a_loss() {
    let (mut fixture, peer) = Fixture::start(Duration::from_millis(20)).await;

    fixture.connector.refuse_all(true);
    peer.disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    fixture.connector.refuse_all(false);

    let mut peer = accept(&mut fixture.acceptor).await;

    // BrokerUp may still be in flight behind the greeting
    let mut attempt = 0;
    let status = loop {
        attempt += 1;
        let oid = format!("r{attempt}");
        fixture.order(&oid);
        let status = fixture.next_status().await;
        if status.resp == Resp::Pending || attempt == 50 {
            break status;
        }
        assert_eq!(status.reason.as_deref(), Some(NO_ROUTE));
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(status.resp, Resp::Pending);

    let request = next_request(&mut peer).await;
    assert_eq!(request["params"]["oid"], status.oid);
    fixture.stop().await;
}
