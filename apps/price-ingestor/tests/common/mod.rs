//! Local exchange stub shared by integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

/// How long a test waits for any single expected event.
pub const WAIT: Duration = Duration::from_secs(5);

enum Control {
    Text(String),
    Close,
}

/// A WebSocket server standing in for the exchange.
///
/// Records every text frame clients send, tagged with the connection
/// index, and lets the test push frames or close a given connection.
pub struct StubExchange {
    url: String,
    inbound: mpsc::UnboundedReceiver<(usize, String)>,
    connections: Arc<Mutex<Vec<mpsc::UnboundedSender<Control>>>>,
}

impl StubExchange {
    /// Bind on an ephemeral local port and start accepting.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let connections: Arc<Mutex<Vec<mpsc::UnboundedSender<Control>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let registered = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let (control_tx, control_rx) = mpsc::unbounded_channel();
                let id = {
                    let mut connections = registered.lock();
                    connections.push(control_tx);
                    connections.len() - 1
                };
                tokio::spawn(serve(id, ws, control_rx, inbound_tx.clone()));
            }
        });

        Self {
            url: format!("ws://{addr}"),
            inbound,
            connections,
        }
    }

    /// URL clients connect to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Next text frame from any client.
    pub async fn next_text(&mut self) -> (usize, String) {
        tokio::time::timeout(WAIT, self.inbound.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("stub exchange stopped")
    }

    /// Skip frames until one satisfies `matches`.
    pub async fn next_matching(&mut self, matches: impl Fn(&str) -> bool) -> (usize, String) {
        loop {
            let (id, text) = self.next_text().await;
            if matches(&text) {
                return (id, text);
            }
        }
    }

    /// Push a text frame to connection `id`.
    pub fn send(&self, id: usize, text: impl Into<String>) {
        self.connections.lock()[id]
            .send(Control::Text(text.into()))
            .unwrap();
    }

    /// Close connection `id` from the exchange side.
    pub fn close(&self, id: usize) {
        let _ = self.connections.lock()[id].send(Control::Close);
    }
}

async fn serve(
    id: usize,
    ws: WebSocketStream<TcpStream>,
    mut control: mpsc::UnboundedReceiver<Control>,
    inbound: mpsc::UnboundedSender<(usize, String)>,
) {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = inbound.send((id, text.as_str().to_string()));
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
            command = control.recv() => match command {
                Some(Control::Text(text)) => {
                    if write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Control::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}

/// Subscription frame for `tickers` in the default layout.
pub fn is_subscription(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .is_some_and(|v| v.get("assets_ids").is_some())
}
