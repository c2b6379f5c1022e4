use crate::config::ReconnectConfig;
use crate::error::AgentError;
use crate::reconnect::ReconnectSchedule;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection status of the relay WebSocket link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Not connected, and no reconnection pending.
    Disconnected,
    /// Opening the socket, or waiting to retry.
    Connecting,
    /// Socket open; sends are accepted.
    Connected,
    /// Reconnection gave up; only an explicit connect restarts it.
    Failed,
}

/// Outbound half of the relay link, as seen by the dispatch bus.
pub trait Transport: Send + Sync {
    /// Queues one text frame for the relay.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::NotConnected`] when the socket is not open.
    fn send_text(&self, text: String) -> Result<(), AgentError>;
}

/// Counters describing the lifetime of a [`RelayConnection`].
#[derive(Debug, Default)]
pub struct ConnectionStats {
    open_attempts: AtomicU64,
    opens: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
}

impl ConnectionStats {
    /// Socket opens attempted, initial and reconnection alike.
    pub fn open_attempts(&self) -> u64 {
        self.open_attempts.load(Ordering::Relaxed)
    }

    /// Sockets successfully opened.
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    /// Frames written to the relay.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Text frames received from the relay.
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }
}

struct Supervisor {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

enum SocketEnd {
    Shutdown,
    Lost(anyhow::Error),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("connection lock poisoned, using recovered state");
            poisoned.into_inner()
        }
    }
}

/// The single logical connection to the relay.
///
/// A supervisor task owns the socket. It reconnects on a fixed interval
/// after drops or failed opens, up to the configured attempt cap, and is
/// stopped only by [`disconnect`](Self::disconnect).
pub struct RelayConnection {
    url: String,
    reconnect: ReconnectConfig,
    inbound_tx: mpsc::UnboundedSender<String>,
    status_tx: watch::Sender<ConnStatus>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    supervisor: Mutex<Option<Supervisor>>,
    epoch: AtomicU64,
    stats: ConnectionStats,
}

impl RelayConnection {
    /// Creates a disconnected manager. Every text frame received from the
    /// relay is forwarded to `inbound_tx`.
    pub fn new(
        url: impl Into<String>,
        reconnect: ReconnectConfig,
        inbound_tx: mpsc::UnboundedSender<String>,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ConnStatus::Disconnected);
        Arc::new(Self {
            url: url.into(),
            reconnect,
            inbound_tx,
            status_tx,
            writer: Mutex::new(None),
            supervisor: Mutex::new(None),
            epoch: AtomicU64::new(0),
            stats: ConnectionStats::default(),
        })
    }

    /// Relay URL this manager connects to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current status.
    pub fn status(&self) -> ConnStatus {
        *self.status_tx.borrow()
    }

    /// Watch channel following status changes.
    pub fn status_watch(&self) -> watch::Receiver<ConnStatus> {
        self.status_tx.subscribe()
    }

    /// Lifetime counters.
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Increases by one on every successful open.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Starts the connection supervisor.
    ///
    /// A no-op while a supervisor is already running. Starting a new one
    /// (after [`disconnect`](Self::disconnect) or after reconnection gave
    /// up) begins with a fresh attempt budget.
    pub fn connect(self: &Arc<Self>) {
        let mut supervisor = lock(&self.supervisor);
        if let Some(running) = supervisor.as_ref() {
            // A supervisor that reported Failed is already on its way out.
            if !running.handle.is_finished() && self.status() != ConnStatus::Failed {
                debug!(url = %self.url, "connect called while supervisor is running");
                return;
            }
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.supervise(shutdown_rx).await });
        *supervisor = Some(Supervisor {
            shutdown_tx,
            handle,
        });
    }

    /// Stops the supervisor, cancelling any pending reconnection, and
    /// closes the socket if it is open. Never triggers a reconnect.
    pub async fn disconnect(&self) {
        let running = lock(&self.supervisor).take();
        if let Some(Supervisor {
            shutdown_tx,
            handle,
        }) = running
        {
            let _ = shutdown_tx.send(());
            if let Err(e) = handle.await {
                warn!(error = %e, "connection supervisor ended abnormally");
            }
        }
        *lock(&self.writer) = None;
        self.status_tx.send_replace(ConnStatus::Disconnected);
    }

    /// Waits until the socket is open.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Timeout`] if the socket does not open in time,
    /// or [`AgentError::NotConnected`] if reconnection gives up first.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), AgentError> {
        let mut status = self.status_watch();
        let wait = async {
            loop {
                match *status.borrow_and_update() {
                    ConnStatus::Connected => return Ok(()),
                    ConnStatus::Failed => return Err(AgentError::NotConnected),
                    ConnStatus::Disconnected | ConnStatus::Connecting => {}
                }
                if status.changed().await.is_err() {
                    return Err(AgentError::NotConnected);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| AgentError::Timeout(timeout))?
    }

    async fn supervise(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        let mut schedule =
            ReconnectSchedule::new(self.reconnect.interval(), self.reconnect.max_attempts);

        loop {
            self.status_tx.send_replace(ConnStatus::Connecting);
            self.stats.open_attempts.fetch_add(1, Ordering::Relaxed);

            let opened = tokio::select! {
                res = tokio_tungstenite::connect_async(self.url.as_str()) => res,
                _ = &mut shutdown => break,
            };

            match opened {
                Ok((ws, _)) => {
                    schedule.reset();
                    match self.run_socket(ws, &mut shutdown).await {
                        SocketEnd::Shutdown => break,
                        SocketEnd::Lost(e) => warn!(error = %e, "relay connection lost"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, url = %self.url, "failed to open relay connection");
                }
            }
            self.status_tx.send_replace(ConnStatus::Disconnected);

            let Some(delay) = schedule.next_delay() else {
                let e = AgentError::MaxReconnectAttemptsExceeded(schedule.max_attempts());
                error!(error = %e, url = %self.url, "not reconnecting");
                self.status_tx.send_replace(ConnStatus::Failed);
                return;
            };
            info!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                attempt = schedule.attempts(),
                max_attempts = schedule.max_attempts(),
                "reconnecting"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = &mut shutdown => break,
            }
        }

        *lock(&self.writer) = None;
        self.status_tx.send_replace(ConnStatus::Disconnected);
        debug!(url = %self.url, "connection supervisor stopped");
    }

    async fn run_socket(&self, ws: WsStream, shutdown: &mut oneshot::Receiver<()>) -> SocketEnd {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();
        *lock(&self.writer) = Some(writer_tx);

        self.stats.opens.fetch_add(1, Ordering::Relaxed);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.status_tx.send_replace(ConnStatus::Connected);
        info!(url = %self.url, "connected to relay");

        let end = loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => break SocketEnd::Lost(e.into()),
                        None => break SocketEnd::Lost(anyhow::anyhow!("connection closed")),
                    };
                    match msg {
                        Message::Text(text) => self.forward_inbound(text),
                        Message::Binary(data) => match String::from_utf8(data) {
                            Ok(text) => self.forward_inbound(text),
                            Err(_) => debug!("ignoring non-UTF-8 binary frame"),
                        },
                        Message::Ping(data) => {
                            if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                                break SocketEnd::Lost(e.into());
                            }
                        }
                        Message::Close(_) => {
                            break SocketEnd::Lost(anyhow::anyhow!("relay closed the connection"));
                        }
                        _ => {}
                    }
                }

                outbound = writer_rx.recv() => {
                    // The sender lives in `self.writer` until this loop ends.
                    let Some(msg) = outbound else {
                        break SocketEnd::Lost(anyhow::anyhow!("outbound queue closed"));
                    };
                    if let Err(e) = ws_tx.send(msg).await {
                        break SocketEnd::Lost(e.into());
                    }
                    self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                }

                _ = &mut *shutdown => {
                    if let Err(e) = ws_tx.send(Message::Close(None)).await {
                        debug!(error = %e, "close frame not sent");
                    }
                    info!(url = %self.url, "disconnected from relay");
                    break SocketEnd::Shutdown;
                }
            }
        };

        *lock(&self.writer) = None;
        end
    }

    fn forward_inbound(&self, text: String) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        if self.inbound_tx.send(text).is_err() {
            debug!("inbound frame dropped: no receiver");
        }
    }
}

impl Transport for RelayConnection {
    fn send_text(&self, text: String) -> Result<(), AgentError> {
        let writer = lock(&self.writer);
        let Some(tx) = writer.as_ref() else {
            return Err(AgentError::NotConnected);
        };
        tx.send(Message::Text(text))
            .map_err(|_| AgentError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_reconnect(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            interval_ms: 20,
            max_attempts,
        }
    }

    async fn unused_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn send_before_connect_is_not_connected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = RelayConnection::new("ws://127.0.0.1:1", fast_reconnect(1), tx);
        assert_eq!(conn.status(), ConnStatus::Disconnected);
        assert!(matches!(
            conn.send_text("{}".into()),
            Err(AgentError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = RelayConnection::new(unused_url().await, fast_reconnect(5), tx);
        let mut status = conn.status_watch();
        conn.connect();

        tokio::time::timeout(Duration::from_secs(5), async {
            while *status.borrow_and_update() != ConnStatus::Failed {
                status.changed().await.unwrap();
            }
        })
        .await
        .expect("connection should give up");

        // one initial open plus five reconnection attempts
        assert_eq!(conn.stats().open_attempts(), 6);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(conn.stats().open_attempts(), 6, "no sixth reconnection");
        assert_eq!(conn.stats().opens(), 0);
    }

    #[tokio::test]
    async fn explicit_connect_after_failure_resets_budget() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = RelayConnection::new(unused_url().await, fast_reconnect(2), tx);
        let mut status = conn.status_watch();

        for round in 1..=2u64 {
            conn.connect();
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    status.changed().await.unwrap();
                    if *status.borrow_and_update() == ConnStatus::Failed {
                        break;
                    }
                }
            })
            .await
            .expect("connection should give up");
            assert_eq!(conn.stats().open_attempts(), round * 3);
        }
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_reconnect() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = RelayConnection::new(
            unused_url().await,
            ReconnectConfig {
                interval_ms: 50,
                max_attempts: 100,
            },
            tx,
        );
        conn.connect();
        tokio::time::sleep(Duration::from_millis(120)).await;
        conn.disconnect().await;
        let attempts = conn.stats().open_attempts();
        assert!(attempts >= 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(conn.stats().open_attempts(), attempts);
        assert_eq!(conn.status(), ConnStatus::Disconnected);
    }

    #[tokio::test]
    async fn wait_connected_reports_failure() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = RelayConnection::new(unused_url().await, fast_reconnect(1), tx);
        conn.connect();
        let result = conn.wait_connected(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(AgentError::NotConnected)));
    }
}
