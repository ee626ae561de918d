//! Shared helpers for the wasl integration test suites.
//!
//! Spins up full in-process servers on ephemeral ports and drives them
//! with plain tokio-tungstenite WebSocket clients speaking the client
//! JSON protocol.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use wasl_server::{Server, ServerConfig};

/// How long helpers wait for a single expected frame.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(10);

/// A running test server plus its scratch directory.
pub struct TestServer {
    pub server: Server,
    _dir: tempfile::TempDir,
}

impl TestServer {
    /// Start a server on an ephemeral port with test-friendly settings.
    pub async fn start(mutate: impl FnOnce(&mut ServerConfig)) -> TestServer {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = ServerConfig::default();
        config.network.host = "127.0.0.1".to_string();
        config.network.port = 0;
        config.storage.data_dir = dir.path().display().to_string();
        mutate(&mut config);
        let server = Server::start(config).await.expect("server start");
        TestServer { server, _dir: dir }
    }

    /// The real client WebSocket URL.
    pub fn ws_url(&self) -> String {
        format!("{}/ws", self.server.ws_base())
    }

    /// Shut the server down.
    pub async fn stop(self) {
        self.server.shutdown().await;
    }
}

/// A WebSocket test client speaking single-line JSON frames.
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl TestClient {
    /// Connect and consume the `server_info` greeting.
    pub async fn connect(url: &str) -> TestClient {
        let (ws, _) = connect_async(url).await.expect("ws connect");
        let mut client = TestClient { ws };
        let greeting = client.next_json().await.expect("server_info");
        assert_eq!(greeting["type"], "server_info", "greeting: {greeting}");
        client
    }

    /// Connect without waiting for the greeting.
    pub async fn connect_raw(url: &str) -> TestClient {
        let (ws, _) = connect_async(url).await.expect("ws connect");
        TestClient { ws }
    }

    /// Send one JSON value as a text frame.
    pub async fn send_json(&mut self, value: serde_json::Value) {
        let text = value.to_string();
        self.ws
            .send(Message::Text(text.into()))
            .await
            .expect("ws send");
    }

    /// Send a raw text frame (for malformed-input tests).
    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("ws send");
    }

    /// Next text frame as JSON, or `None` if the socket closed first.
    pub async fn next_json(&mut self) -> Option<serde_json::Value> {
        loop {
            let frame = tokio::time::timeout(FRAME_TIMEOUT, self.ws.next())
                .await
                .expect("frame timeout")?;
            match frame.ok()? {
                Message::Text(text) => {
                    return Some(serde_json::from_str(text.as_str()).expect("frame json"));
                }
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Read frames until one matches `type`, failing on close.
    pub async fn expect_type(&mut self, expected: &str) -> serde_json::Value {
        loop {
            let frame = self
                .next_json()
                .await
                .unwrap_or_else(|| panic!("socket closed waiting for {expected}"));
            if frame["type"] == expected {
                return frame;
            }
        }
    }

    /// Register a pairing code and wait for the ack.
    pub async fn register(&mut self, code: &str, public_key: &str) -> serde_json::Value {
        self.send_json(serde_json::json!({
            "type": "register",
            "pairingCode": code,
            "publicKey": public_key,
        }))
        .await;
        self.expect_type("registered").await
    }

    /// Whether the connection has been closed by the server.
    pub async fn wait_closed(&mut self) -> bool {
        loop {
            match tokio::time::timeout(FRAME_TIMEOUT, self.ws.next()).await {
                Err(_) => return false,
                Ok(None) => return true,
                Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }
}
