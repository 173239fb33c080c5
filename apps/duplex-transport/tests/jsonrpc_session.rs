//! Multiplexer behavior against scripted peers.

use std::sync::Arc;
use std::time::Duration;

use duplex_transport::{
    ChannelConfig, MemoryAcceptor, MemoryConnector, MemoryPeer, ReconnectConfig, RpcConfig,
    RpcError, RpcResponse, RpcSession, WsConnector,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

async fn open(start_id: u64, attempts: u32) -> (RpcSession, MemoryConnector, MemoryAcceptor, MemoryPeer) {
    let (connector, mut acceptor) = MemoryConnector::new();
    let channel = ChannelConfig::new("mem://venue")
        .with_reconnect(ReconnectConfig::fixed(Duration::from_millis(1), attempts));
    let session = RpcSession::connect(
        channel,
        RpcConfig { start_id },
        Arc::new(connector.clone()),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    let peer = acceptor.accept().await.unwrap();
    (session, connector, acceptor, peer)
}

fn id_of(request: &Value) -> u64 {
    request["id"].as_u64().unwrap()
}

#[tokio::test]
async fn call_returns_result_and_ids_start_at_configured_value() {
    let (session, _connector, _acceptor, mut peer) = open(100, 3).await;

    let server = tokio::spawn(async move {
        let request = peer.recv_json().await.unwrap();
        assert_eq!(request["jsonrpc"], "2.0");
        assert_eq!(request["method"], "public/get_time");
        peer.send_json(&serde_json::to_value(RpcResponse::success(id_of(&request), json!(1_700_000_000))).unwrap());
        id_of(&request)
    });

    let result = session.call("public/get_time", json!({})).await.unwrap();
    assert_eq!(result, json!(1_700_000_000));
    assert_eq!(server.await.unwrap(), 100);
}

#[tokio::test]
async fn out_of_order_responses_wake_the_right_callers() {
    let (session, _connector, _acceptor, mut peer) = open(0, 3).await;
    let session = Arc::new(session);

    let first = session.request("a", json!([1])).await.unwrap();
    let second = session.request("b", json!([2])).await.unwrap();
    assert_eq!((first.id(), second.id()), (0, 1));

    let a = peer.recv_json().await.unwrap();
    let b = peer.recv_json().await.unwrap();
    peer.send_json(&serde_json::to_value(RpcResponse::success(id_of(&b), json!("for-b"))).unwrap());
    peer.send_json(&serde_json::to_value(RpcResponse::success(id_of(&a), json!("for-a"))).unwrap());

    assert_eq!(second.response().await.unwrap(), json!("for-b"));
    assert_eq!(first.response().await.unwrap(), json!("for-a"));
}

#[tokio::test]
async fn error_field_becomes_remote_error() {
    let (session, _connector, _acceptor, mut peer) = open(0, 3).await;

    let server = tokio::spawn(async move {
        let request = peer.recv_json().await.unwrap();
        peer.send_json(
            &serde_json::to_value(RpcResponse::failure(id_of(&request), 10_009, "not_enough_funds")).unwrap(),
        );
    });

    let err = session.call("private/buy", json!({"amount": 10})).await.unwrap_err();
    server.await.unwrap();
    match err {
        RpcError::Remote(remote) => {
            assert_eq!(remote.code, Some(10_009));
            assert_eq!(remote.message, "not_enough_funds");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn unmatched_response_is_discarded() {
    let (session, _connector, _acceptor, mut peer) = open(0, 3).await;

    peer.send_json(&serde_json::to_value(RpcResponse::success(999, json!("stray"))).unwrap());

    let server = tokio::spawn(async move {
        let request = peer.recv_json().await.unwrap();
        peer.send_json(&serde_json::to_value(RpcResponse::success(id_of(&request), json!("mine"))).unwrap());
        // a late duplicate for the same id finds no slot
        peer.send_json(&serde_json::to_value(RpcResponse::success(id_of(&request), json!("dup"))).unwrap());
        peer
    });

    assert_eq!(session.call("x", json!(null)).await.unwrap(), json!("mine"));
    let _peer = server.await.unwrap();
    assert!(session.closed_reason().is_none());
}

#[tokio::test]
async fn notifications_are_forwarded_in_order() {
    let (session, _connector, _acceptor, peer) = open(0, 3).await;
    let mut notifications = session.notifications().unwrap();
    assert!(session.notifications().is_none());

    peer.send_json(&json!({"jsonrpc": "2.0", "method": "subscription", "params": {"seq": 1}}));
    peer.send_json(&json!({"jsonrpc": "2.0", "method": "subscription", "params": {"seq": 2}}));

    let one = notifications.recv().await.unwrap();
    let two = notifications.recv().await.unwrap();
    assert_eq!(one.method, "subscription");
    assert_eq!((one.params["seq"].clone(), two.params["seq"].clone()), (json!(1), json!(2)));
}

#[tokio::test]
async fn closing_session_cancels_outstanding_calls() {
    let (session, _connector, _acceptor, mut peer) = open(0, 3).await;
    let session = Arc::new(session);

    let caller = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.call("slow", json!({})).await })
    };
    // request reached the peer, so its slot is registered
    assert!(peer.recv_json().await.is_some());

    session.close();

    assert_eq!(caller.await.unwrap(), Err(RpcError::Cancelled));
    assert_eq!(session.call("after", json!({})).await, Err(RpcError::Cancelled));
}

#[tokio::test]
async fn exhaustion_fails_outstanding_and_later_calls() {
    let (session, connector, _acceptor, mut peer) = open(0, 2).await;
    let pending = session.request("slow", json!({})).await.unwrap();
    assert!(peer.recv_json().await.is_some());

    connector.refuse_all(true);
    peer.disconnect();

    assert!(matches!(pending.response().await, Err(RpcError::TransportExhausted(_))));
    assert!(matches!(
        session.call("again", json!({})).await,
        Err(RpcError::TransportExhausted(_))
    ));
}

#[tokio::test]
async fn call_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // echo server: answers every request with its params
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(Message::Text(text))) = ws.next().await {
            let request: Value = serde_json::from_str(text.as_str()).unwrap();
            let reply = RpcResponse::success(id_of(&request), request["params"].clone());
            let frame = serde_json::to_string(&reply).unwrap();
            ws.send(Message::Text(frame.into())).await.unwrap();
        }
    });

    let session = RpcSession::connect(
        ChannelConfig::new(format!("ws://{addr}")),
        RpcConfig::default(),
        Arc::new(WsConnector::new()),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let echoed: Vec<String> = session.call_as("echo", json!(["XBTUSD", "ETHUSD"])).await.unwrap();
    assert_eq!(echoed, vec!["XBTUSD".to_string(), "ETHUSD".to_string()]);
}
