//! Serialized writes to the browser socket
//!
//! Every task that talks to the browser (message loop, upstream pump,
//! keepalive) goes through an [`Outbox`]. One writer task owns the sink and
//! drains the queue in order, so frames are never interleaved. Any failed or
//! timed out write fires the session's done signal.

use axum::body::Bytes;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use std::fmt::Display;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::messages::ServerMessage;

/// Frames queued per session before senders wait
pub(super) const OUTBOX_CAPACITY: usize = 256;

/// Upper bound for a single socket write
pub(super) const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub(super) enum Outbound {
    Frame(ServerMessage),
    Ping,
}

/// Cloneable handle for queueing frames to the browser
#[derive(Clone, Debug)]
pub(super) struct Outbox {
    tx: mpsc::Sender<Outbound>,
}

impl Outbox {
    pub(super) fn channel() -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        (Self { tx }, rx)
    }

    /// Queue a frame. `false` once the writer has gone away.
    pub(super) async fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(Outbound::Frame(message)).await.is_ok()
    }

    pub(super) async fn error(&self, message: impl Into<String>) -> bool {
        self.send(ServerMessage::error(message)).await
    }

    async fn ping(&self) -> bool {
        self.tx.send(Outbound::Ping).await.is_ok()
    }
}

pub(super) struct WriterContext<S> {
    pub sink: S,
    pub rx: mpsc::Receiver<Outbound>,
    pub done: CancellationToken,
    pub client_ip: IpAddr,
    pub write_timeout: Duration,
}

/// Drain the outbox into the socket until done fires or a write fails.
pub(super) async fn write_loop<S>(ctx: WriterContext<S>)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let WriterContext {
        mut sink,
        mut rx,
        done,
        client_ip,
        write_timeout,
    } = ctx;

    loop {
        let outbound = tokio::select! {
            biased;
            _ = done.cancelled() => break,
            item = rx.recv() => match item {
                Some(outbound) => outbound,
                None => break,
            },
        };

        let message = match outbound {
            Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                Ok(json) => Message::Text(json.into()),
                Err(e) => {
                    error!(ip = %client_ip, "Failed to serialize outgoing frame: {}", e);
                    continue;
                }
            },
            Outbound::Ping => Message::Ping(Bytes::new()),
        };

        match timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(ip = %client_ip, "WebSocket write failed: {}", e);
                done.cancel();
                break;
            }
            Err(_) => {
                warn!(ip = %client_ip, timeout_secs = write_timeout.as_secs(), "WebSocket write timed out");
                done.cancel();
                break;
            }
        }
    }

    if let Ok(Err(e)) = timeout(CLOSE_TIMEOUT, sink.close()).await {
        debug!(ip = %client_ip, "WebSocket close returned error: {}", e);
    }
}

pub(super) struct KeepaliveContext {
    pub outbox: Outbox,
    pub done: CancellationToken,
    pub interval: Duration,
    pub client_ip: IpAddr,
}

/// Ping the browser every `interval` until done fires.
pub(super) async fn keepalive(ctx: KeepaliveContext) {
    let mut ticker = interval_at(Instant::now() + ctx.interval, ctx.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.done.cancelled() => break,
            _ = ticker.tick() => {
                if !ctx.outbox.ping().await {
                    debug!(ip = %ctx.client_ip, "Keepalive stopped, writer is gone");
                    ctx.done.cancel();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use futures::channel::mpsc as fmpsc;
    use std::net::Ipv4Addr;

    fn ip() -> IpAddr {
        Ipv4Addr::LOCALHOST.into()
    }

    #[tokio::test]
    async fn test_frames_written_in_order() {
        let (sink, mut written) = fmpsc::unbounded::<Message>();
        let (outbox, rx) = Outbox::channel();
        let done = CancellationToken::new();

        let writer = tokio::spawn(write_loop(WriterContext {
            sink,
            rx,
            done: done.clone(),
            client_ip: ip(),
            write_timeout: WRITE_TIMEOUT,
        }));

        assert!(outbox.send(ServerMessage::TextDelta { text: "a".into() }).await);
        assert!(outbox.send(ServerMessage::TextDone).await);

        let first = written.next().await.unwrap();
        let second = written.next().await.unwrap();
        assert_eq!(first, Message::Text(r#"{"type":"text_delta","text":"a"}"#.into()));
        assert_eq!(second, Message::Text(r#"{"type":"text_done"}"#.into()));

        done.cancel();
        writer.await.unwrap();
        assert!(!outbox.send(ServerMessage::TextDone).await);
    }

    #[tokio::test]
    async fn test_write_failure_fires_done() {
        let (sink, written) = fmpsc::unbounded::<Message>();
        drop(written);
        let (outbox, rx) = Outbox::channel();
        let done = CancellationToken::new();

        let writer = tokio::spawn(write_loop(WriterContext {
            sink,
            rx,
            done: done.clone(),
            client_ip: ip(),
            write_timeout: WRITE_TIMEOUT,
        }));

        outbox.error("boom").await;
        writer.await.unwrap();
        assert!(done.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_on_interval() {
        let (outbox, mut rx) = Outbox::channel();
        let done = CancellationToken::new();

        let task = tokio::spawn(keepalive(KeepaliveContext {
            outbox,
            done: done.clone(),
            interval: Duration::from_secs(60),
            client_ip: ip(),
        }));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(rx.recv().await, Some(Outbound::Ping)));

        done.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_keepalive_fires_done_when_writer_gone() {
        let (outbox, rx) = Outbox::channel();
        drop(rx);
        let done = CancellationToken::new();

        keepalive(KeepaliveContext {
            outbox,
            done: done.clone(),
            interval: Duration::from_millis(10),
            client_ip: ip(),
        })
        .await;

        assert!(done.is_cancelled());
    }
}
