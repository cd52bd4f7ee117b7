//! Shared WebSocket transport for the control-plane side of instance streams.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves. All WebSocket *clients* in the crate use this module
//! rather than `tokio-tungstenite` directly; server-side sockets are axum
//! upgrades and live next to their handlers.
//!
//! A single [`connect`] function handles URL→request building and returns a
//! ([`WsWriter`], [`WsReader`]) pair ready for use in `tokio::select!` loops.
//! [`connect_with_retries`] adds the bounded linear backoff used while an
//! instance is still binding its listener during launch.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    /// Send a pong frame in response to a ping.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("WebSocket send_pong failed")
    }

    /// Send a close frame.
    pub async fn send_close(&mut self) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Close(None))
            .await
            .context("WebSocket send_close failed")
    }

    /// Flush pending writes and close the sink.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message, returning `None` when the stream ends.
    ///
    /// Raw `Frame` variants are skipped internally.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(WsMessage::Text(text.to_string())));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(WsMessage::Binary(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    return Some(Ok(WsMessage::Ping(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Pong(data))) => {
                    return Some(Ok(WsMessage::Pong(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Some(Ok(tungstenite::Message::Frame(_))) => continue,
                Some(Err(e)) => return Some(Err(e.into())),
                None => return None,
            }
        }
    }
}

/// True when a close error carries a normal close code.
///
/// Normal closes are logged at info; anything else at debug (spec'd
/// propagation policy — the noise is almost always reconnect churn).
#[must_use]
pub fn is_normal_close(code: u16) -> bool {
    matches!(code, 1000 | 1001 | 1005)
}

/// Connect to `url` and split into writer/reader halves.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .with_context(|| format!("WebSocket connect failed: {url}"))?;
    let (sink, stream) = stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Connect with bounded retries and a fixed delay between attempts.
///
/// Used during launch: the instance server may still be completing its bind
/// when the first connect fires.
pub async fn connect_with_retries(
    url: &str,
    attempts: u32,
    delay: Duration,
) -> Result<(WsWriter, WsReader)> {
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        if attempt > 0 {
            tokio::time::sleep(delay).await;
        }
        match connect(url).await {
            Ok(pair) => return Ok(pair),
            Err(e) => {
                log::debug!("[ws] connect attempt {} to {url} failed: {e}", attempt + 1);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("connect attempts exhausted: {url}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_close_codes() {
        assert!(is_normal_close(1000));
        assert!(is_normal_close(1001));
        assert!(is_normal_close(1005));
        assert!(!is_normal_close(1006));
        assert!(!is_normal_close(1011));
    }

    #[tokio::test]
    async fn connect_refused_reports_url() {
        // Nothing listens on this port.
        let err = connect("ws://127.0.0.1:1/api/v1/agent/stream")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ws://127.0.0.1:1"), "got: {err}");
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let start = std::time::Instant::now();
        let result = connect_with_retries(
            "ws://127.0.0.1:1/stream",
            3,
            Duration::from_millis(10),
        )
        .await;
        assert!(result.is_err());
        // 3 attempts with two 10ms sleeps — comfortably under a second.
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
