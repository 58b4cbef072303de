//! JSON-RPC session atop the padded framing transport: request/response
//! correlation, subscription registry and result cache, structured close.
//!
//! Grounded on the teacher's `ClientActor`/`Client` split
//! (`src/stratum/client/actor.rs`, `src/stratum/client.rs`): a background task
//! owns the connection's incoming half and a `BTreeMap<Id, oneshot::Sender<_>>`
//! of in-flight requests, while the public handle sends work to it and awaits
//! the matching oneshot.

use {
    super::*,
    bytes::Bytes,
    framing::Transport,
    std::{
        collections::{BTreeMap, HashMap},
        sync::atomic::{AtomicBool, AtomicU64, Ordering},
    },
    tokio::{
        sync::{mpsc, oneshot, Mutex},
        task::JoinSet,
    },
};

/// Deterministic identity of a subscription stream: the method name plus the
/// canonical (array-order, not sorted — JSON-RPC params are positional) JSON
/// serialization of its subscribe-time params. Never holds a reference; always
/// owned, so it can key a long-lived registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubKey(String, String);

impl SubKey {
    pub fn new(method: &str, params: &[Value]) -> Self {
        Self(
            method.to_string(),
            serde_json::to_string(params).expect("Value serialization never fails"),
        )
    }
}

/// Builds the delivered notification/subscribe payload: the subscribe-time
/// (or notification-key) params followed by the value, as `params + [value]`.
fn with_params(params: &[Value], value: Value) -> Value {
    let mut array = params.to_vec();
    array.push(value);
    Value::Array(array)
}

struct PendingRequest {
    respond_to: oneshot::Sender<Result<Value>>,
}

struct SharedState {
    pending: Mutex<BTreeMap<Id, PendingRequest>>,
    subscriptions: Mutex<HashMap<SubKey, Vec<mpsc::Sender<Value>>>>,
    cache: Mutex<HashMap<SubKey, Value>>,
    closing: AtomicBool,
}

pub struct NotificationSession {
    frames_tx: mpsc::Sender<Bytes>,
    id_counter: AtomicU64,
    default_timeout: Duration,
    shared: Arc<SharedState>,
}

impl NotificationSession {
    pub fn new(transport: Transport, default_timeout: Duration, join_set: &mut JoinSet<()>) -> Self {
        let shared = Arc::new(SharedState {
            pending: Mutex::new(BTreeMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
        });

        join_set.spawn(Self::dispatch_loop(transport.incoming_rx, shared.clone()));

        Self {
            frames_tx: transport.frames_tx,
            id_counter: AtomicU64::new(0),
            default_timeout,
            shared,
        }
    }

    fn next_id(&self) -> Id {
        Id::Number(self.id_counter.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    /// Best-effort graceful flush; safe to call more than once. `force_after`
    /// is reserved for a future hard-abort deadline — transport teardown
    /// itself is always the owning interface's `taskgroup` cancellation.
    pub async fn close(&self, _force_after: Duration) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let pending = std::mem::take(&mut *self.shared.pending.lock().await);
        for (_, req) in pending {
            let _ = req.respond_to.send(Err(PeerError::graceful("session closed")));
        }
    }

    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if self.is_closing() {
            return Err(PeerError::graceful("session is closing"));
        }

        let id = self.next_id();
        let (tx, rx) = oneshot::channel();

        self.shared
            .pending
            .lock()
            .await
            .insert(id.clone(), PendingRequest { respond_to: tx });

        let message = Message::request(id.clone(), method, params);
        let mut frame = serde_json::to_vec(&message).context(error::SerializationSnafu)?;
        frame.push(b'\n');

        if self.frames_tx.send(Bytes::from(frame)).await.is_err() {
            self.shared.pending.lock().await.remove(&id);
            return Err(PeerError::graceful("transport closed"));
        }

        let wait = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_recv_error)) => Err(PeerError::graceful("session closed before reply")),
            Err(_elapsed) => {
                self.shared.pending.lock().await.remove(&id);
                Err(PeerError::RequestTimedOut {
                    elapsed_secs: wait.as_secs(),
                })
            }
        }
    }

    /// Registers `queue` for notifications on `(method, params)`. Delivers a
    /// cached value immediately if present; otherwise issues exactly one
    /// request, caches the result, and delivers it. A second subscriber on an
    /// already-cached key never triggers network traffic.
    pub async fn subscribe(
        &self,
        method: &str,
        params: Vec<Value>,
        queue: mpsc::Sender<Value>,
    ) -> Result<()> {
        let key = SubKey::new(method, &params);

        if let Some(cached) = self.shared.cache.lock().await.get(&key).cloned() {
            self.shared
                .subscriptions
                .lock()
                .await
                .entry(key)
                .or_default()
                .push(queue.clone());
            let _ = queue.send(with_params(&params, cached)).await;
            return Ok(());
        }

        self.shared
            .subscriptions
            .lock()
            .await
            .entry(key.clone())
            .or_default()
            .push(queue.clone());

        let result = self.send_request(method, Value::Array(params.clone()), None).await?;
        self.shared.cache.lock().await.insert(key, result.clone());
        let _ = queue.send(with_params(&params, result)).await;
        Ok(())
    }

    /// Removes `queue` from every subscription key. The server is not
    /// notified; any notification already in flight for it is dropped.
    pub async fn unsubscribe(&self, queue: &mpsc::Sender<Value>) {
        let mut subs = self.shared.subscriptions.lock().await;
        for queues in subs.values_mut() {
            queues.retain(|q| !q.same_channel(queue));
        }
    }

    async fn dispatch_loop(mut incoming_rx: mpsc::Receiver<Message>, shared: Arc<SharedState>) {
        while let Some(message) = incoming_rx.recv().await {
            match message {
                Message::Response { id, result, error } => {
                    let pending = shared.pending.lock().await.remove(&id);
                    let Some(pending) = pending else {
                        tracing::warn!(%id, "unmatched JSON-RPC response");
                        continue;
                    };

                    let outcome = match error {
                        Some(err) => Err(PeerError::Rpc {
                            code: err.code,
                            message: err.message,
                        }),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                    let _ = pending.respond_to.send(outcome);
                }
                Message::Notification { method, params } => {
                    Self::handle_notification(&shared, method, params).await;
                }
                Message::Request { .. } => {
                    tracing::warn!("peer sent a request; ignoring (not a server role)");
                }
            }
        }

        shared.closing.store(true, Ordering::Release);
        let pending = std::mem::take(&mut *shared.pending.lock().await);
        for (_, req) in pending {
            let _ = req.respond_to.send(Err(PeerError::graceful("transport closed")));
        }
    }

    async fn handle_notification(shared: &Arc<SharedState>, method: String, params: Value) {
        let Ok(array) = validate::list_or_tuple(&params) else {
            tracing::warn!(%method, "notification params were not a list; closing session");
            shared.closing.store(true, Ordering::Release);
            return;
        };

        let Some((value, key_params)) = array.split_last() else {
            tracing::warn!(%method, "notification carried no value; closing session");
            shared.closing.store(true, Ordering::Release);
            return;
        };

        let key = SubKey::new(&method, key_params);
        let queues = shared.subscriptions.lock().await.get(&key).cloned();

        let Some(queues) = queues else {
            tracing::warn!(%method, "notification for unsubscribed key; closing session");
            shared.closing.store(true, Ordering::Release);
            return;
        };

        shared.cache.lock().await.insert(key, value.clone());
        let delivered = with_params(key_params, value.clone());
        for queue in queues {
            let _ = queue.send(delivered.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sub_key_is_positional_not_sorted() {
        let a = SubKey::new("blockchain.scripthash.subscribe", &[json!("abcd")]);
        let b = SubKey::new("blockchain.scripthash.subscribe", &[json!("abcd")]);
        assert_eq!(a, b);

        let c = SubKey::new("blockchain.scripthash.subscribe", &[json!("ffff")]);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn second_subscriber_on_cached_key_does_not_hit_network() {
        // Build a session directly atop an in-memory transport pair so we can
        // assert on outbound frame counts without a real socket.
        let (frames_tx, mut frames_rx) = mpsc::channel::<Bytes>(8);
        let (incoming_tx, incoming_rx) = mpsc::channel::<Message>(8);
        let transport = Transport {
            frames_tx,
            incoming_rx,
        };

        let mut join_set = JoinSet::new();
        let session = NotificationSession::new(transport, Duration::from_secs(5), &mut join_set);

        // Serve exactly one request, then stop responding.
        let server = tokio::spawn(async move {
            let frame = frames_rx.recv().await.unwrap();
            let msg: Message = serde_json::from_slice(&frame[..frame.len() - 1]).unwrap();
            let Message::Request { id, .. } = msg else {
                panic!("expected request");
            };
            incoming_tx
                .send(Message::Response {
                    id,
                    result: Some(json!({"height": 100, "hex": "00"})),
                    error: None,
                })
                .await
                .unwrap();
            // Keep the sender alive so the dispatch loop doesn't close.
            std::future::pending::<()>().await;
        });

        let (tx1, mut rx1) = mpsc::channel(4);
        session
            .subscribe("blockchain.headers.subscribe", vec![], tx1)
            .await
            .unwrap();
        let first = rx1.recv().await.unwrap();
        assert_eq!(first[0]["height"], 100);

        let (tx2, mut rx2) = mpsc::channel(4);
        session
            .subscribe("blockchain.headers.subscribe", vec![], tx2)
            .await
            .unwrap();
        let second = rx2.recv().await.unwrap();
        assert_eq!(second, first);

        // Only one request frame should ever have been sent: the second
        // subscribe must have been satisfied entirely from cache.
        assert!(frames_rx.try_recv().is_err());

        server.abort();
    }
}
