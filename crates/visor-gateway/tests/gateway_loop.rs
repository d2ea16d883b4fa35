//! End-to-end transport tests against an in-process gateway speaking the
//! real envelope protocol over a local WebSocket.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use visor_core::errors::BridgeError;
use visor_gateway::{BackoffConfig, GatewayClient, GatewayConfig, RunTimeouts};

type Ws = WebSocketStream<TcpStream>;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> Ws {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn read_envelope(ws: &mut Ws) -> Value {
    loop {
        match ws.next().await.expect("socket closed").expect("read failed") {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(payload) => ws.send(Message::Pong(payload)).await.unwrap(),
            _ => continue,
        }
    }
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Accept the versioned handshake and ack it. Returns the request.
async fn ack_handshake(ws: &mut Ws) -> Value {
    let req = read_envelope(ws).await;
    assert_eq!(req["type"], "req");
    assert_eq!(req["method"], "connect");
    send_json(ws, json!({"type": "res", "id": req["id"], "ok": true})).await;
    req
}

fn fast_config(url: &str) -> GatewayConfig {
    GatewayConfig {
        url: url.to_string(),
        token: "test-token".into(),
        reconnect: BackoffConfig {
            base: Duration::from_millis(50),
            max: Duration::from_millis(200),
        },
        timeouts: RunTimeouts {
            soft: Duration::from_secs(10),
            hard: Duration::from_secs(30),
            end_grace: Duration::from_millis(100),
        },
        request_timeout: Duration::from_secs(5),
        handshake_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn connect_sends_versioned_handshake() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let req = ack_handshake(&mut ws).await;
        (req, ws)
    });

    let client = GatewayClient::new(fast_config(&url));
    client.connect().await.expect("connect should succeed");
    assert!(client.is_connected());

    let (req, _ws) = server.await.unwrap();
    assert_eq!(req["params"]["minProtocol"], 3);
    assert_eq!(req["params"]["maxProtocol"], 3);
    assert_eq!(req["params"]["auth"]["token"], "test-token");
    assert_eq!(req["params"]["client"]["id"], "visor-bridge");

    client.shutdown();
}

#[tokio::test]
async fn submitted_turn_resolves_from_matched_final() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        ack_handshake(&mut ws).await;

        let req = read_envelope(&mut ws).await;
        assert_eq!(req["method"], "chat.send");
        assert_eq!(req["params"]["message"], "hello");
        assert_eq!(req["params"]["sessionKey"], "agent:main:main");
        assert!(req["params"]["idempotencyKey"].as_str().unwrap().starts_with("visor-"));
        send_json(&mut ws, json!({"type": "res", "id": req["id"], "ok": true})).await;

        send_json(
            &mut ws,
            json!({"type": "event", "event": "agent", "payload": {
                "stream": "lifecycle", "runId": "r1", "data": {"phase": "start"}
            }}),
        )
        .await;
        send_json(
            &mut ws,
            json!({"type": "event", "event": "chat", "payload": {
                "state": "final", "runId": "r1",
                "message": {"role": "assistant", "content": "hi there"}
            }}),
        )
        .await;
        ws
    });

    let client = GatewayClient::new(fast_config(&url));
    client.connect().await.unwrap();

    let reply = client.submit_turn("hello".into(), None).await;
    assert_eq!(reply, "hi there");

    let _ws = server.await.unwrap();
    client.shutdown();
}

#[tokio::test]
async fn concurrent_turns_match_fifo_even_with_reordered_finals() {
    let (listener, url) = bind().await;
    let accept_task = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        ack_handshake(&mut ws).await;
        ws
    });

    let client = GatewayClient::new(fast_config(&url));
    client.connect().await.unwrap();
    let mut ws = accept_task.await.unwrap();

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.submit_turn("a".into(), None).await })
    };
    let req_a = read_envelope(&mut ws).await;
    assert_eq!(req_a["params"]["message"], "a");

    let second = {
        let client = client.clone();
        tokio::spawn(async move { client.submit_turn("b".into(), None).await })
    };
    let req_b = read_envelope(&mut ws).await;
    assert_eq!(req_b["params"]["message"], "b");

    send_json(&mut ws, json!({"type": "res", "id": req_a["id"], "ok": true})).await;
    send_json(&mut ws, json!({"type": "res", "id": req_b["id"], "ok": true})).await;

    // Runs start in request order; the second run's reply lands first.
    for run in ["r1", "r2"] {
        send_json(
            &mut ws,
            json!({"type": "event", "event": "agent", "payload": {
                "stream": "lifecycle", "runId": run, "data": {"phase": "start"}
            }}),
        )
        .await;
    }
    send_json(
        &mut ws,
        json!({"type": "event", "event": "chat", "payload": {
            "state": "final", "runId": "r2",
            "message": {"role": "assistant", "content": "for b"}
        }}),
    )
    .await;
    send_json(
        &mut ws,
        json!({"type": "event", "event": "chat", "payload": {
            "state": "final", "runId": "r1",
            "message": {"role": "assistant", "content": "for a"}
        }}),
    )
    .await;

    assert_eq!(first.await.unwrap(), "for a");
    assert_eq!(second.await.unwrap(), "for b");
    client.shutdown();
}

#[tokio::test]
async fn end_without_final_resolves_turn_empty() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        ack_handshake(&mut ws).await;

        let req = read_envelope(&mut ws).await;
        send_json(&mut ws, json!({"type": "res", "id": req["id"], "ok": true})).await;
        send_json(
            &mut ws,
            json!({"type": "event", "event": "agent", "payload": {
                "stream": "lifecycle", "runId": "r1", "data": {"phase": "start"}
            }}),
        )
        .await;
        send_json(
            &mut ws,
            json!({"type": "event", "event": "agent", "payload": {
                "stream": "lifecycle", "runId": "r1", "data": {"phase": "end"}
            }}),
        )
        .await;
        ws
    });

    let client = GatewayClient::new(fast_config(&url));
    client.connect().await.unwrap();

    let reply = client.submit_turn("anyone there?".into(), None).await;
    assert_eq!(reply, "", "end with no reply must resolve empty, not hang");

    let _ws = server.await.unwrap();
    client.shutdown();
}

#[tokio::test]
async fn handshake_rejection_reports_error_then_retries() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        // First attempt: refuse.
        let mut ws = accept(&listener).await;
        let req = read_envelope(&mut ws).await;
        send_json(
            &mut ws,
            json!({"type": "res", "id": req["id"], "ok": false, "error": {"code": "AUTH"}}),
        )
        .await;
        drop(ws);

        // Second attempt: accept.
        let mut ws = accept(&listener).await;
        ack_handshake(&mut ws).await;
        ws
    });

    let client = GatewayClient::new(fast_config(&url));
    let err = client.connect().await.err().expect("first handshake must fail");
    assert!(matches!(err, BridgeError::HandshakeRejected(_)), "got {err:?}");

    {
        let client = client.clone();
        wait_until("reconnect after rejection", move || client.is_connected()).await;
    }

    let _ws = server.await.unwrap();
    client.shutdown();
}

#[tokio::test]
async fn dropped_connection_fails_pending_request_and_reconnects() {
    let (listener, url) = bind().await;
    let accept_task = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        ack_handshake(&mut ws).await;
        (ws, listener)
    });

    let client = GatewayClient::new(fast_config(&url));
    client.connect().await.unwrap();
    let (mut ws, listener) = accept_task.await.unwrap();

    let probe = {
        let client = client.clone();
        tokio::spawn(async move { client.request("status.get", json!({})).await })
    };
    let req = read_envelope(&mut ws).await;
    assert_eq!(req["method"], "status.get");

    // Kill the link with the request still outstanding.
    drop(ws);

    let err = probe.await.unwrap().err().expect("pending request must fail");
    assert!(matches!(err, BridgeError::TransportClosed), "got {err:?}");

    // Supervisor reconnects on its own.
    let reconnect = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        ack_handshake(&mut ws).await;
        ws
    });
    {
        let client = client.clone();
        wait_until("reconnect after drop", move || client.is_connected()).await;
    }

    let _ws = reconnect.await.unwrap();
    client.shutdown();
}

#[tokio::test]
async fn cancel_all_resolves_in_flight_turn_empty() {
    let (listener, url) = bind().await;
    let accept_task = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        ack_handshake(&mut ws).await;
        ws
    });

    let client = GatewayClient::new(fast_config(&url));
    client.connect().await.unwrap();
    let mut ws = accept_task.await.unwrap();

    let turn = {
        let client = client.clone();
        tokio::spawn(async move { client.submit_turn("slow one".into(), None).await })
    };
    let req = read_envelope(&mut ws).await;
    send_json(&mut ws, json!({"type": "res", "id": req["id"], "ok": true})).await;
    send_json(
        &mut ws,
        json!({"type": "event", "event": "agent", "payload": {
            "stream": "lifecycle", "runId": "r1", "data": {"phase": "start"}
        }}),
    )
    .await;

    {
        let client = client.clone();
        wait_until("turn matched", move || client.status().matched_turns == 1).await;
    }

    assert_eq!(client.cancel_all_turns(), 1);
    assert_eq!(turn.await.unwrap(), "");

    // A late final for the cancelled run must be ignored.
    send_json(
        &mut ws,
        json!({"type": "event", "event": "chat", "payload": {
            "state": "final", "runId": "r1",
            "message": {"role": "assistant", "content": "too late"}
        }}),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.status().matched_turns, 0);

    client.shutdown();
}
