//! Shared helpers for integration tests
#![allow(dead_code)]

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use avatar_gateway::{
    ServerConfig,
    config::{ChatBackend, FALLBACK_SYSTEM_PROMPT},
    routes,
    state::AppState,
};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Local-pipeline, open-auth configuration. Upstream URLs point nowhere.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        tls: None,
        backend: ChatBackend::LocalPipeline,
        system_prompt: FALLBACK_SYSTEM_PROMPT.to_string(),
        openai_api_key: None,
        openai_model: "gpt-realtime-mini".to_string(),
        realtime_url: "ws://127.0.0.1:9/v1/realtime".to_string(),
        realtime_voice: "cedar".to_string(),
        local_llm_url: "http://127.0.0.1:9".to_string(),
        local_llm_model: "test-model".to_string(),
        tts_url: "http://127.0.0.1:9".to_string(),
        tts_model: "tts-1".to_string(),
        tts_voice: "onyx".to_string(),
        tts_speed: 0.95,
        upstream_timeout_seconds: 5,
        jwt_secret: None,
        token_ttl_seconds: 1800,
        turnstile_secret: None,
        turnstile_site_key: "0x4AAAAAAA-test".to_string(),
        turnstile_verify_url: "http://127.0.0.1:9/siteverify".to_string(),
        cors_allowed_origins: Some("http://localhost:5173".to_string()),
        trusted_proxies: Vec::new(),
        rate_limit_requests_per_second: 100_000,
        rate_limit_burst_size: 20,
        max_connections_per_ip: 10,
        message_rate_period_seconds: 5,
        message_burst: 3,
        max_message_length: 4000,
        connection_timeout_seconds: 600,
        ping_interval_seconds: 60,
        strict_single_flight: false,
    }
}

/// Serve the full application on an ephemeral port.
pub async fn spawn_app(state: Arc<AppState>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = routes::create_app(state);

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    addr
}

/// Open `/ws/chat`, optionally presenting a subprotocol token or bearer header.
pub async fn connect_chat(
    addr: SocketAddr,
    protocol: Option<&str>,
    bearer: Option<&str>,
) -> Result<(WsClient, tungstenite::handshake::client::Response), tungstenite::Error> {
    let mut request = format!("ws://{addr}/ws/chat").into_client_request().unwrap();
    if let Some(protocol) = protocol {
        request
            .headers_mut()
            .insert("sec-websocket-protocol", protocol.parse().unwrap());
    }
    if let Some(token) = bearer {
        request
            .headers_mut()
            .insert("authorization", format!("Bearer {token}").parse().unwrap());
    }
    tokio_tungstenite::connect_async(request).await
}

/// Next JSON text frame, skipping control frames. Panics after 5 seconds.
pub async fn next_json(ws: &mut WsClient) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Assert that no text frame arrives within `wait`.
pub async fn assert_silent(ws: &mut WsClient, wait: Duration) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(wait, ws.next()).await {
        panic!("unexpected frame: {text}");
    }
}

pub fn chat_message(text: &str) -> Message {
    Message::Text(serde_json::json!({ "type": "message", "message": text }).to_string().into())
}

/// Mono 16-bit WAV at `sample_rate`
pub fn build_wav(sample_rate: u32, samples: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// SSE body in the chat completions streaming format
pub fn sse_body(deltas: &[&str]) -> String {
    let mut body = String::from(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
    );
    for delta in deltas {
        let chunk = serde_json::json!({ "choices": [{ "delta": { "content": delta } }] });
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}
