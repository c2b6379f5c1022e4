#![allow(dead_code)]

use fleet_common::identity;
use fleetc::config::{AgentConfig, ReconnectConfig, RequestConfig};
use fleetc::Agent;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

pub type Responder = Arc<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

/// In-process relay: records every text frame the agent sends and answers
/// each one with whatever the responder returns.
pub struct MockRelay {
    pub addr: SocketAddr,
    frames: mpsc::UnboundedReceiver<Value>,
    conns: Arc<Mutex<Vec<mpsc::UnboundedSender<Message>>>>,
    accepted: Arc<AtomicUsize>,
}

impl MockRelay {
    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(&Value) -> Vec<String> + Send + Sync + 'static,
    {
        let responder: Responder = Arc::new(responder);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let conns = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));

        tokio::spawn({
            let conns = Arc::clone(&conns);
            let accepted = Arc::clone(&accepted);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                        continue;
                    };
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let (out_tx, out_rx) = mpsc::unbounded_channel();
                    conns.lock().unwrap().push(out_tx);
                    tokio::spawn(serve_connection(
                        ws,
                        out_rx,
                        frames_tx.clone(),
                        Arc::clone(&responder),
                    ));
                }
            }
        });

        Self {
            addr,
            frames,
            conns,
            accepted,
        }
    }

    /// Relay that answers every frame with `{"ok":true}`.
    pub async fn acking() -> Self {
        Self::start(|_| vec![ack()]).await
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Next frame received from any agent, parsed as JSON.
    pub async fn next_frame(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("relay stopped")
    }

    /// Frames received so far, without waiting.
    pub fn drain_frames(&mut self) -> Vec<Value> {
        std::iter::from_fn(|| self.frames.try_recv().ok()).collect()
    }

    /// Pushes a raw text frame to every open connection.
    pub fn push(&self, text: &str) {
        for conn in self.conns.lock().unwrap().iter() {
            let _ = conn.send(Message::Text(text.to_string()));
        }
    }

    /// Drops every open connection without a close handshake.
    pub fn drop_connections(&self) {
        self.conns.lock().unwrap().clear();
    }

    pub fn connections_accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

async fn serve_connection(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    frames_tx: mpsc::UnboundedSender<Value>,
    responder: Responder,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                    _ => break,
                };
                let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                let replies = responder(&frame);
                let _ = frames_tx.send(frame);
                for reply in replies {
                    if ws_tx.send(Message::Text(reply)).await.is_err() {
                        return;
                    }
                }
            }
            // Closed once the registry drops this connection's sender.
            out = out_rx.recv() => {
                let Some(out) = out else { break };
                if ws_tx.send(out).await.is_err() {
                    break;
                }
            }
        }
    }
}

pub fn ack() -> String {
    json!({"ok": true}).to_string()
}

/// A message from `from` as the relay forwards it, wrapped in a string
/// `message` field.
pub fn forwarded(from: &str, content: Value) -> String {
    let inner = json!({
        "timestamp": identity::unix_now().to_string(),
        "content": content,
        "from": from,
        "to": null,
    });
    json!({"message": inner.to_string()}).to_string()
}

/// The envelope carried in a `/send_signed_message` frame.
pub fn signed_envelope(frame: &Value) -> Option<Value> {
    if frame["action"] != "/send_signed_message" {
        return None;
    }
    let message = frame["signed_message"]["message"].as_str()?;
    serde_json::from_str(message).ok()
}

pub fn robot_peer_id(seed: u8) -> String {
    identity::peer_id(&identity::keypair_from_seed(&[seed; 32]).verifying_key().to_bytes())
}

pub fn test_config(url: &str) -> AgentConfig {
    AgentConfig {
        relay: url.to_string(),
        owner_key: "owner-secret".to_string(),
        secret_key: String::new(),
        reconnect: ReconnectConfig {
            interval_ms: 50,
            max_attempts: 5,
        },
        request: RequestConfig { timeout_ms: 2_000 },
    }
}

pub async fn connected_agent(config: &AgentConfig) -> Agent {
    let agent = Agent::new(config, identity::keypair_from_seed(&[1u8; 32]));
    agent.connect();
    agent
        .wait_connected(Duration::from_secs(5))
        .await
        .expect("agent should connect to mock relay");
    agent
}
