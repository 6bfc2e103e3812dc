//! End-to-end chat WebSocket tests against a live listener
//!
//! Upstreams are mocked: wiremock for the local pipeline, a tungstenite
//! server for the realtime backend.

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{self, Message};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use avatar_gateway::auth::DEV_TOKEN;
use avatar_gateway::config::ChatBackend;
use avatar_gateway::handlers::chat::messages::{
    ERR_CONNECT_FAILED, ERR_EMPTY_MESSAGE, ERR_INVALID_TYPE, ERR_RATE_LIMITED,
};
use avatar_gateway::state::AppState;

use common::{
    assert_silent, build_wav, chat_message, connect_chat, next_json, spawn_app, sse_body,
    test_config,
};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn expect_http_status<T>(result: Result<T, tungstenite::Error>, status: u16) {
    match result {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status().as_u16(), status),
        Err(e) => panic!("expected HTTP {status}, got {e}"),
        Ok(_) => panic!("expected HTTP {status}, connection was accepted"),
    }
}

#[tokio::test]
async fn test_subprotocol_token_is_echoed() {
    let addr = spawn_app(AppState::new(test_config()).unwrap()).await;

    let (_ws, response) = connect_chat(addr, Some(DEV_TOKEN), None).await.unwrap();
    assert_eq!(
        response.headers()["sec-websocket-protocol"],
        DEV_TOKEN
    );
}

#[tokio::test]
async fn test_open_mode_accepts_bearer_header() {
    let addr = spawn_app(AppState::new(test_config()).unwrap()).await;

    let (mut ws, response) = connect_chat(addr, None, Some(DEV_TOKEN)).await.unwrap();
    assert!(response.headers().get("sec-websocket-protocol").is_none());

    ws.send(chat_message("")).await.unwrap();
    assert_eq!(next_json(&mut ws).await["error"], ERR_EMPTY_MESSAGE);
}

#[tokio::test]
async fn test_bearer_jwt_admits_and_garbage_is_refused() {
    let mut config = test_config();
    config.jwt_secret = Some("ws-secret".to_string());
    let state = AppState::new(config).unwrap();
    let jwt = state.token_issuer.issue_unconditional().unwrap();
    let addr = spawn_app(state).await;

    let (_ws, response) = connect_chat(addr, None, Some(&jwt)).await.unwrap();
    assert!(response.headers().get("sec-websocket-protocol").is_none());

    // Same credential via subprotocol
    connect_chat(addr, Some(&jwt), None).await.unwrap();

    expect_http_status(connect_chat(addr, None, Some("garbage")).await, 401);
    expect_http_status(connect_chat(addr, None, None).await, 401);
}

#[tokio::test]
async fn test_local_exchange_frame_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body(&["Hello", " friend"])),
        )
        .expect(1)
        .mount(&server)
        .await;
    let samples: Vec<i16> = vec![7; 100];
    Mock::given(method("POST"))
        .and(path("/v1/audio/speech"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(build_wav(24_000, &samples)))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = test_config();
    config.local_llm_url = server.uri();
    config.tts_url = server.uri();
    let addr = spawn_app(AppState::new(config).unwrap()).await;

    let (mut ws, _) = connect_chat(addr, Some(DEV_TOKEN), None).await.unwrap();
    ws.send(chat_message("Hi there")).await.unwrap();

    assert_eq!(next_json(&mut ws).await, json!({ "type": "text_delta", "text": "Hello" }));
    assert_eq!(next_json(&mut ws).await, json!({ "type": "text_delta", "text": " friend" }));
    assert_eq!(next_json(&mut ws).await, json!({ "type": "text_done" }));

    let audio = next_json(&mut ws).await;
    assert_eq!(audio["type"], "audio_delta");
    assert!(!audio["audio"].as_str().unwrap().is_empty());

    assert_eq!(next_json(&mut ws).await, json!({ "type": "audio_done" }));
    assert_eq!(next_json(&mut ws).await, json!({ "type": "response_done" }));
}

#[tokio::test]
async fn test_local_upstream_failure_reports_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.local_llm_url = server.uri();
    let addr = spawn_app(AppState::new(config).unwrap()).await;

    let (mut ws, _) = connect_chat(addr, Some(DEV_TOKEN), None).await.unwrap();
    ws.send(chat_message("Hi")).await.unwrap();

    assert_eq!(
        next_json(&mut ws).await,
        json!({ "type": "error", "error": "Failed to generate response" })
    );

    // Session survives the failure
    ws.send(Message::Text(r#"{"type":"bogus"}"#.into())).await.unwrap();
    assert_eq!(
        next_json(&mut ws).await,
        json!({ "type": "error", "error": ERR_INVALID_TYPE })
    );
}

#[tokio::test]
async fn test_empty_message_never_reaches_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut config = test_config();
    config.local_llm_url = server.uri();
    config.tts_url = server.uri();
    let addr = spawn_app(AppState::new(config).unwrap()).await;

    let (mut ws, _) = connect_chat(addr, Some(DEV_TOKEN), None).await.unwrap();
    ws.send(chat_message("  \u{1}  ")).await.unwrap();

    assert_eq!(
        next_json(&mut ws).await,
        json!({ "type": "error", "error": ERR_EMPTY_MESSAGE })
    );
    assert_silent(&mut ws, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_oversized_message_rejected() {
    let mut config = test_config();
    config.max_message_length = 10;
    let addr = spawn_app(AppState::new(config).unwrap()).await;

    let (mut ws, _) = connect_chat(addr, Some(DEV_TOKEN), None).await.unwrap();
    ws.send(chat_message("01234567890")).await.unwrap();

    assert_eq!(
        next_json(&mut ws).await,
        json!({ "type": "error", "error": "Message must be between 1 and 10 characters" })
    );
}

#[tokio::test]
async fn test_message_rate_limit_burst() {
    let addr = spawn_app(AppState::new(test_config()).unwrap()).await;
    let (mut ws, _) = connect_chat(addr, Some(DEV_TOKEN), None).await.unwrap();

    // Empty messages consume tokens without touching the upstream
    for _ in 0..3 {
        ws.send(chat_message("")).await.unwrap();
        assert_eq!(next_json(&mut ws).await["error"], ERR_EMPTY_MESSAGE);
    }

    ws.send(chat_message("")).await.unwrap();
    assert_eq!(next_json(&mut ws).await["error"], ERR_RATE_LIMITED);
}

#[tokio::test]
async fn test_malformed_frame_is_not_fatal() {
    let addr = spawn_app(AppState::new(test_config()).unwrap()).await;
    let (mut ws, _) = connect_chat(addr, Some(DEV_TOKEN), None).await.unwrap();

    ws.send(Message::Text("{not json".into())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["error"], ERR_INVALID_TYPE);

    ws.send(chat_message("")).await.unwrap();
    assert_eq!(next_json(&mut ws).await["error"], ERR_EMPTY_MESSAGE);
}

#[tokio::test]
async fn test_per_ip_connection_limit() {
    let state = AppState::new(test_config()).unwrap();
    let addr = spawn_app(state.clone()).await;

    let mut open = Vec::new();
    for _ in 0..10 {
        let (ws, _) = connect_chat(addr, Some(DEV_TOKEN), None).await.unwrap();
        open.push(ws);
    }
    assert_eq!(state.registry.count(&LOCALHOST), 10);

    expect_http_status(connect_chat(addr, Some(DEV_TOKEN), None).await, 429);
    assert_eq!(state.registry.count(&LOCALHOST), 10);

    // Closing one frees its slot
    let mut ws = open.pop().unwrap();
    ws.close(None).await.unwrap();
    drop(ws);

    tokio::time::timeout(Duration::from_secs(5), async {
        while state.registry.count(&LOCALHOST) != 9 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("slot was not released");

    connect_chat(addr, Some(DEV_TOKEN), None).await.unwrap();
}

/// Realtime mock that refuses its first handshake, then plays a short
/// scripted response for every `response.create`. Client events are
/// forwarded to the returned channel.
async fn spawn_realtime_mock() -> (String, mpsc::UnboundedReceiver<Value>, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let handshakes = Arc::new(AtomicUsize::new(0));
    let counter = handshakes.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            let tx = tx.clone();
            tokio::spawn(async move {
                let callback = move |_req: &Request, resp: Response| {
                    if attempt == 0 {
                        let reject: ErrorResponse = http::Response::builder()
                            .status(503)
                            .body(None)
                            .unwrap();
                        Err(reject)
                    } else {
                        Ok(resp)
                    }
                };
                let Ok(mut ws) = accept_hdr_async(stream, callback).await else {
                    return;
                };

                while let Some(Ok(Message::Text(text))) = ws.next().await {
                    let event: Value = serde_json::from_str(&text).unwrap();
                    let is_response_create = event["type"] == "response.create";
                    let _ = tx.send(event);

                    if is_response_create {
                        for reply in [
                            json!({ "type": "response.created" }),
                            json!({ "type": "response.output_audio_transcript.delta", "delta": "Hey" }),
                            json!({ "type": "response.output_audio.delta", "delta": "AAAA" }),
                            json!({ "type": "error", "error": { "message": "ignored" } }),
                            json!({ "type": "response.output_audio_transcript.done" }),
                            json!({ "type": "response.output_audio.done" }),
                            json!({ "type": "response.done" }),
                        ] {
                            ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                        }
                    }
                }
            });
        }
    });

    (format!("ws://{addr}/v1/realtime"), rx, handshakes)
}

#[tokio::test]
async fn test_realtime_connect_failure_then_reconnect() {
    let (url, mut client_events, handshakes) = spawn_realtime_mock().await;

    let mut config = test_config();
    config.backend = ChatBackend::Realtime;
    config.openai_api_key = Some("sk-test".to_string());
    config.realtime_url = url;
    let addr = spawn_app(AppState::new(config).unwrap()).await;

    let (mut ws, _) = connect_chat(addr, Some(DEV_TOKEN), None).await.unwrap();

    ws.send(chat_message("first")).await.unwrap();
    assert_eq!(
        next_json(&mut ws).await,
        json!({ "type": "error", "error": ERR_CONNECT_FAILED })
    );

    ws.send(chat_message("second")).await.unwrap();
    assert_eq!(next_json(&mut ws).await, json!({ "type": "text_delta", "text": "Hey" }));
    assert_eq!(next_json(&mut ws).await, json!({ "type": "audio_delta", "audio": "AAAA" }));
    assert_eq!(next_json(&mut ws).await, json!({ "type": "text_done" }));
    assert_eq!(next_json(&mut ws).await, json!({ "type": "audio_done" }));
    assert_eq!(next_json(&mut ws).await, json!({ "type": "response_done" }));
    assert_eq!(handshakes.load(Ordering::SeqCst), 2);

    let update = client_events.recv().await.unwrap();
    assert_eq!(update["type"], "session.update");
    let item = client_events.recv().await.unwrap();
    assert_eq!(item["type"], "conversation.item.create");
    assert_eq!(item["item"]["content"][0]["text"], "second");
    let create = client_events.recv().await.unwrap();
    assert_eq!(create["type"], "response.create");

    // The open connection is reused: no new handshake, no second session.update
    ws.send(chat_message("third")).await.unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "text_delta");
    assert_eq!(
        client_events.recv().await.unwrap()["type"],
        "conversation.item.create"
    );
    assert_eq!(handshakes.load(Ordering::SeqCst), 2);
}
