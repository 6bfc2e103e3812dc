//! OpenAI realtime upstream.
//!
//! # API Reference
//!
//! - Endpoint: `wss://api.openai.com/v1/realtime?model=<model>`
//! - Protocol: WebSocket with JSON events
//! - Audio: PCM 16-bit, 24kHz, mono, little-endian, base64 encoded
//!
//! Each call to [`OpenAIRealtimeConnector::connect`] opens one WebSocket and
//! splits it. The sink half stays with the session's message loop; the event
//! half is handed to the session's pump task.

pub mod messages;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use self::messages::{ClientEvent, decode_server_event};
use super::{
    RealtimeConnection, RealtimeConnector, RealtimeEvents, RealtimeSink, UpstreamError,
    UpstreamEvent, UpstreamResult,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens OpenAI realtime connections for one model and voice
#[derive(Clone)]
pub struct OpenAIRealtimeConnector {
    api_key: String,
    url: Url,
    voice: String,
}

impl std::fmt::Debug for OpenAIRealtimeConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIRealtimeConnector")
            .field("url", &self.url.as_str())
            .field("voice", &self.voice)
            .finish_non_exhaustive()
    }
}

impl Drop for OpenAIRealtimeConnector {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.api_key.zeroize();
    }
}

impl OpenAIRealtimeConnector {
    /// Build a connector for `base_url?model=<model>`.
    pub fn new(
        api_key: impl Into<String>,
        base_url: &str,
        model: &str,
        voice: impl Into<String>,
    ) -> UpstreamResult<Self> {
        let mut url = Url::parse(base_url)
            .map_err(|e| UpstreamError::Unavailable(format!("invalid realtime URL: {e}")))?;
        url.query_pairs_mut().append_pair("model", model);

        Ok(Self {
            api_key: api_key.into(),
            url,
            voice: voice.into(),
        })
    }

    /// Full endpoint including the model query parameter
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl RealtimeConnector for OpenAIRealtimeConnector {
    async fn connect(&self) -> UpstreamResult<RealtimeConnection> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| UpstreamError::Unavailable(e.to_string()))?;

        let auth = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| UpstreamError::Unavailable(format!("invalid API key header: {e}")))?;
        request.headers_mut().insert(http::header::AUTHORIZATION, auth);

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| UpstreamError::Unavailable(e.to_string()))?;

        info!(url = %self.url, "Connected to OpenAI realtime API");

        let (sink, stream) = ws_stream.split();

        Ok(RealtimeConnection {
            sink: Box::new(OpenAIRealtimeSink {
                sink,
                voice: self.voice.clone(),
            }),
            events: Box::new(OpenAIRealtimeEvents { stream }),
        })
    }
}

/// Write half of an OpenAI realtime connection
pub struct OpenAIRealtimeSink {
    sink: SplitSink<WsStream, Message>,
    voice: String,
}

impl OpenAIRealtimeSink {
    async fn send_event(&mut self, event: &ClientEvent) -> UpstreamResult<()> {
        let json = serde_json::to_string(event)
            .map_err(|e| UpstreamError::Protocol(e.to_string()))?;
        self.sink
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| UpstreamError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl RealtimeSink for OpenAIRealtimeSink {
    async fn configure(&mut self, system_prompt: &str) -> UpstreamResult<()> {
        let event = ClientEvent::session_update(system_prompt, &self.voice);
        self.send_event(&event).await.map_err(|e| match e {
            UpstreamError::SendFailed(detail) => UpstreamError::ConfigRejected(detail),
            other => other,
        })?;
        debug!(voice = %self.voice, "Realtime session configured");
        Ok(())
    }

    async fn send_user_text(&mut self, text: &str) -> UpstreamResult<()> {
        self.send_event(&ClientEvent::user_text(text)).await
    }

    async fn request_response(&mut self) -> UpstreamResult<()> {
        self.send_event(&ClientEvent::ResponseCreate).await
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!("Realtime socket close returned error: {}", e);
        }
    }
}

/// Read half of an OpenAI realtime connection
pub struct OpenAIRealtimeEvents {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl RealtimeEvents for OpenAIRealtimeEvents {
    async fn next_event(&mut self) -> UpstreamResult<UpstreamEvent> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => match decode_server_event(&text) {
                    Ok(event) => return Ok(event),
                    Err(e) => {
                        warn!("Undecodable realtime frame: {}", e);
                        continue;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Realtime upstream closed the connection");
                    return Err(UpstreamError::StreamEnded);
                }
                // Control frames are answered by tungstenite itself
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Binary(data))) => {
                    debug!(len = data.len(), "Ignoring binary realtime frame");
                    continue;
                }
                Some(Err(e)) => {
                    warn!("Realtime upstream read failed: {}", e);
                    return Err(UpstreamError::StreamEnded);
                }
                None => return Err(UpstreamError::StreamEnded),
            }
        }
    }
}
