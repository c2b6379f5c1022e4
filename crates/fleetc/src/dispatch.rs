use crate::connection::Transport;
use crate::error::AgentError;
use fleet_common::codec::{decode_chunk, RelayRequest};
use serde_json::Value;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// A subscriber callback. Receives every inbound message in arrival order.
pub type Callback = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`Dispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Removes its subscription when dropped.
#[must_use = "the subscription is removed as soon as the guard is dropped"]
pub struct SubscriptionGuard {
    dispatcher: Arc<Dispatcher>,
    id: SubscriptionId,
}

impl SubscriptionGuard {
    /// Id of the guarded subscription.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.dispatcher.unsubscribe(self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("dispatcher lock poisoned, using recovered state");
            poisoned.into_inner()
        }
    }
}

/// Publish/subscribe bus over the relay connection.
///
/// Replies carry no correlation id. A request registers a one-shot slot
/// before sending, and each inbound message resolves the oldest slot whose
/// caller is still waiting. Independently, every message is delivered to
/// every subscriber.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
    subscribers: Mutex<Vec<(SubscriptionId, Callback)>>,
    pending: Mutex<VecDeque<oneshot::Sender<Value>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    /// Creates a bus sending through `transport`.
    pub fn new(transport: Arc<dyn Transport>, request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            transport,
            request_timeout,
            subscribers: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// How long [`send_request`](Self::send_request) waits for a reply.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Sends a relay request and waits for the next inbound message.
    ///
    /// # Errors
    ///
    /// - [`AgentError::NotConnected`] if the socket is not open.
    /// - [`AgentError::Timeout`] if nothing arrives within the request timeout.
    /// - [`AgentError::Codec`] if the request cannot be encoded.
    pub async fn send_request(&self, request: &RelayRequest) -> Result<Value, AgentError> {
        let text = request.encode()?;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            pending.retain(|slot| !slot.is_closed());
            pending.push_back(tx);
        }

        debug!(action = %request.action, "sending relay request");
        // On failure the receiver is dropped here and the slot is skipped.
        self.transport.send_text(text)?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(AgentError::NotConnected),
            Err(_) => {
                debug!(action = %request.action, "relay request timed out");
                Err(AgentError::Timeout(self.request_timeout))
            }
        }
    }

    /// Registers a callback for every inbound message.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.subscribers).push((id, Arc::new(callback)));
        id
    }

    /// Like [`subscribe`](Self::subscribe), but removed when the returned
    /// guard is dropped.
    pub fn subscribe_scoped<F>(self: &Arc<Self>, callback: F) -> SubscriptionGuard
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.subscribe(callback);
        SubscriptionGuard {
            dispatcher: Arc::clone(self),
            id,
        }
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Decodes one inbound delivery and dispatches each message in order.
    ///
    /// An undecodable chunk is logged and dropped as a whole.
    pub fn dispatch_chunk(&self, chunk: &str) {
        let messages = match decode_chunk(chunk) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, len = chunk.len(), "dropping undecodable inbound chunk");
                return;
            }
        };
        for message in &messages {
            self.dispatch(message);
        }
    }

    fn dispatch(&self, message: &Value) {
        self.resolve_pending(message);

        let subscribers: Vec<(SubscriptionId, Callback)> = lock(&self.subscribers).clone();
        for (id, callback) in subscribers {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(subscription = id.0, error = %e, "subscriber callback failed"),
                Err(_) => error!(subscription = id.0, "subscriber callback panicked"),
            }
        }
    }

    fn resolve_pending(&self, message: &Value) {
        let mut pending = lock(&self.pending);
        while let Some(slot) = pending.pop_front() {
            if slot.send(message.clone()).is_ok() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    struct ChannelTransport(mpsc::UnboundedSender<String>);

    impl Transport for ChannelTransport {
        fn send_text(&self, text: String) -> Result<(), AgentError> {
            self.0.send(text).map_err(|_| AgentError::NotConnected)
        }
    }

    struct ClosedTransport;

    impl Transport for ClosedTransport {
        fn send_text(&self, _text: String) -> Result<(), AgentError> {
            Err(AgentError::NotConnected)
        }
    }

    fn bus() -> (Arc<Dispatcher>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(Arc::new(ChannelTransport(tx)), Duration::from_secs(10));
        (dispatcher, rx)
    }

    #[tokio::test]
    async fn request_resolves_with_next_message() {
        let (dispatcher, mut sent) = bus();
        let d = Arc::clone(&dispatcher);
        let task = tokio::spawn(async move {
            d.send_request(&RelayRequest::new("/config").with_action_param("owner"))
                .await
        });

        let frame = sent.recv().await.unwrap();
        assert_eq!(frame, r#"{"action":"/config","action_param":"owner"}"#);
        dispatcher.dispatch_chunk(r#"{"robots":[],"users":[],"version":3}"#);

        let reply = task.await.unwrap().unwrap();
        assert_eq!(reply["version"], 3);
    }

    #[tokio::test]
    async fn pending_requests_resolve_in_registration_order() {
        let (dispatcher, mut sent) = bus();
        let first = {
            let d = Arc::clone(&dispatcher);
            tokio::spawn(async move { d.send_request(&RelayRequest::new("/a")).await })
        };
        sent.recv().await.unwrap();
        let second = {
            let d = Arc::clone(&dispatcher);
            tokio::spawn(async move { d.send_request(&RelayRequest::new("/b")).await })
        };
        sent.recv().await.unwrap();

        dispatcher.dispatch_chunk(r#"{"n":1}{"n":2}"#);
        assert_eq!(first.await.unwrap().unwrap()["n"], 1);
        assert_eq!(second.await.unwrap().unwrap()["n"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_after_ten_seconds() {
        let (dispatcher, _sent) = bus();
        let start = tokio::time::Instant::now();
        let result = dispatcher.send_request(&RelayRequest::new("/config")).await;
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(AgentError::Timeout(_))));
        assert!(elapsed >= Duration::from_millis(9_500), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_secs(11), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_slot_does_not_swallow_later_reply() {
        let (dispatcher, mut sent) = bus();
        let stale = dispatcher.send_request(&RelayRequest::new("/stale")).await;
        assert!(matches!(stale, Err(AgentError::Timeout(_))));
        sent.recv().await.unwrap();

        let d = Arc::clone(&dispatcher);
        let fresh = tokio::spawn(async move { d.send_request(&RelayRequest::new("/fresh")).await });
        sent.recv().await.unwrap();
        dispatcher.dispatch_chunk(r#"{"fresh":true}"#);
        assert_eq!(fresh.await.unwrap().unwrap(), json!({"fresh": true}));
    }

    #[tokio::test]
    async fn send_without_connection_fails_fast() {
        let dispatcher = Dispatcher::new(Arc::new(ClosedTransport), Duration::from_secs(10));
        let result = dispatcher.send_request(&RelayRequest::new("/config")).await;
        assert!(matches!(result, Err(AgentError::NotConnected)));
    }

    #[test]
    fn every_subscriber_sees_every_message_in_order() {
        let (dispatcher, _sent) = bus();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            dispatcher.subscribe(move |msg| {
                seen.lock().unwrap().push(format!("{tag}{}", msg["n"]));
                Ok(())
            });
        }

        dispatcher.dispatch_chunk(r#"{"n":1}{"n":2}"#);
        assert_eq!(*seen.lock().unwrap(), vec!["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn failing_or_panicking_subscriber_does_not_block_others() {
        let (dispatcher, _sent) = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.subscribe(|_| Err(anyhow::anyhow!("boom")));
        dispatcher.subscribe(|_| panic!("subscriber panic"));
        let h = Arc::clone(&hits);
        dispatcher.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.dispatch_chunk(r#"{"x":1}"#);
        dispatcher.dispatch_chunk(r#"{"x":2}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn undecodable_chunk_is_dropped_whole() {
        let (dispatcher, _sent) = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        dispatcher.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.dispatch_chunk(r#"{"ok":true}{"broken":"#);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_and_scoped_guard() {
        let (dispatcher, _sent) = bus();
        let id = dispatcher.subscribe(|_| Ok(()));
        assert_eq!(dispatcher.subscriber_count(), 1);
        {
            let guard = dispatcher.subscribe_scoped(|_| Ok(()));
            assert_ne!(guard.id(), id);
            assert_eq!(dispatcher.subscriber_count(), 2);
        }
        assert_eq!(dispatcher.subscriber_count(), 1);
        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        assert_eq!(dispatcher.subscriber_count(), 0);
    }

    #[test]
    fn callback_may_unsubscribe_itself() {
        let (dispatcher, _sent) = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let own_id = Arc::new(Mutex::new(None::<SubscriptionId>));
        let id = {
            let d = Arc::clone(&dispatcher);
            let h = Arc::clone(&hits);
            let own_id = Arc::clone(&own_id);
            dispatcher.subscribe(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = *own_id.lock().unwrap() {
                    d.unsubscribe(id);
                }
                Ok(())
            })
        };
        *own_id.lock().unwrap() = Some(id);

        dispatcher.dispatch_chunk(r#"{"n":1}{"n":2}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.subscriber_count(), 0);
    }
}
