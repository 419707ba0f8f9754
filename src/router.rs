//! Pub/sub over a persistent WebSocket connection.
//!
//! Inbound envelopes are JSON objects with a `type` key. Each one is handed to
//! the callbacks subscribed to its type, then to the wildcard subscribers, in
//! registration order. The wildcard is itself the topic `"all"`, so an
//! envelope typed `"all"` reaches wildcard subscribers twice. A callback that fails or panics is logged and the
//! remaining callbacks still run.
//!
//! The socket sits behind a mutex. `listen` holds it for a single bounded
//! read at a time, so `send` and `disconnect` from other threads interleave
//! with a running listener.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::TcpStream;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::dispatch::{DetectionObserver, DetectionResult};
use crate::error::RouterError;
use crate::registry::Source;

pub const WILDCARD: &str = "all";
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);
const UNKNOWN_TYPE: &str = "unknown";
const ERROR_BACKOFF: Duration = Duration::from_millis(100);
const IDLE_PAUSE: Duration = Duration::from_millis(5);

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

pub type Callback = Arc<dyn Fn(&Envelope) -> anyhow::Result<()> + Send + Sync>;

/// One decoded message. `body` is the whole object, `type` key included.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub kind: String,
    pub body: Map<String, Value>,
}

impl Envelope {
    /// A missing `type` reads as `"unknown"`. A non-string `type` keeps its
    /// JSON text as `kind` and matches no typed subscription.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let body: Map<String, Value> = serde_json::from_str(text)?;
        let kind = match body.get("type") {
            None => UNKNOWN_TYPE.to_string(),
            Some(Value::String(kind)) => kind.clone(),
            Some(other) => other.to_string(),
        };
        Ok(Self { kind, body })
    }

    /// The subscription list this envelope is addressed to, if any.
    fn topic_key(&self) -> Option<&str> {
        match self.body.get("type") {
            None => Some(UNKNOWN_TYPE),
            Some(Value::String(kind)) => Some(kind.as_str()),
            Some(_) => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    All,
    Type(String),
}

impl Topic {
    pub fn parse(name: &str) -> Self {
        if name == WILDCARD {
            Topic::All
        } else {
            Topic::Type(name.to_string())
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouterState {
    Disconnected,
    Connected,
    Listening,
}

#[derive(Default)]
struct Subscriptions {
    by_type: HashMap<String, Vec<(SubscriptionId, Callback)>>,
    wildcard: Vec<(SubscriptionId, Callback)>,
}

impl Subscriptions {
    /// Exact-type subscribers, then wildcard subscribers. An envelope typed
    /// `"all"` has the wildcard list as its exact-type list too.
    fn matching(&self, key: Option<&str>) -> Vec<Callback> {
        let typed: &[(SubscriptionId, Callback)] = match key {
            Some(WILDCARD) => &self.wildcard,
            Some(kind) => self.by_type.get(kind).map(Vec::as_slice).unwrap_or(&[]),
            None => &[],
        };
        typed
            .iter()
            .chain(self.wildcard.iter())
            .map(|(_, cb)| cb.clone())
            .collect()
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        if let Some(pos) = self.wildcard.iter().position(|(sid, _)| *sid == id) {
            self.wildcard.remove(pos);
            return true;
        }
        for list in self.by_type.values_mut() {
            if let Some(pos) = list.iter().position(|(sid, _)| *sid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }
}

pub struct MessageRouter {
    url: String,
    read_timeout: Duration,
    socket: Mutex<Option<Socket>>,
    state: Mutex<RouterState>,
    subscriptions: RwLock<Subscriptions>,
    next_id: AtomicU64,
}

impl MessageRouter {
    pub fn new(url: &str, read_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            read_timeout,
            socket: Mutex::new(None),
            state: Mutex::new(RouterState::Disconnected),
            subscriptions: RwLock::new(Subscriptions::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> RouterState {
        *lock(&self.state)
    }

    fn set_state(&self, state: RouterState) {
        *lock(&self.state) = state;
    }

    pub fn connect(&self) -> Result<(), RouterError> {
        let connect_err = |reason: String| RouterError::Connect {
            url: self.url.clone(),
            reason,
        };
        let (socket, _response) =
            tungstenite::connect(self.url.as_str()).map_err(|e| connect_err(e.to_string()))?;
        match socket.get_ref() {
            MaybeTlsStream::Plain(stream) => stream
                .set_read_timeout(Some(self.read_timeout))
                .map_err(|e| connect_err(e.to_string()))?,
            _ => log::warn!("router: no read timeout on {}, listen may block", self.url),
        }

        *lock(&self.socket) = Some(socket);
        self.set_state(RouterState::Connected);
        log::info!("router: connected to {}", self.url);
        Ok(())
    }

    /// Read and dispatch messages until the connection closes or
    /// `disconnect` is called. Receive errors are logged and reading resumes.
    pub fn listen(&self) {
        if lock(&self.socket).is_none() {
            log::warn!("router: not connected to {}", self.url);
            return;
        }
        self.set_state(RouterState::Listening);

        loop {
            let read = {
                let mut guard = lock(&self.socket);
                let Some(socket) = guard.as_mut() else {
                    break;
                };
                socket.read()
            };
            match read {
                Ok(Message::Text(text)) => {
                    self.handle(&text);
                }
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => {
                        self.handle(&text);
                    }
                    Err(_) => log::warn!("router: dropping non-UTF-8 binary message"),
                },
                Ok(Message::Close(frame)) => {
                    log::info!("router: server closed connection: {:?}", frame);
                    break;
                }
                Ok(_) => {}
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    log::info!("router: connection closed");
                    break;
                }
                Err(tungstenite::Error::Io(err))
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    // Let a pending send take the socket.
                    thread::sleep(IDLE_PAUSE);
                }
                Err(tungstenite::Error::Io(err))
                    if matches!(
                        err.kind(),
                        ErrorKind::ConnectionReset
                            | ErrorKind::ConnectionAborted
                            | ErrorKind::BrokenPipe
                            | ErrorKind::UnexpectedEof
                    ) =>
                {
                    log::warn!("router: connection lost: {}", err);
                    break;
                }
                Err(err) => {
                    log::error!("router: error receiving message: {}", err);
                    thread::sleep(ERROR_BACKOFF);
                }
            }
        }

        lock(&self.socket).take();
        self.set_state(RouterState::Disconnected);
        log::info!("router: stopped listening on {}", self.url);
    }

    /// Decode one inbound message and fan it out. Returns how many
    /// callbacks were invoked; a malformed message invokes none.
    pub fn handle(&self, text: &str) -> usize {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                log::warn!("router: dropping malformed message ({}): {}", err, text);
                return 0;
            }
        };

        let callbacks = self
            .subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .matching(envelope.topic_key());

        for callback in &callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(&envelope))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    log::error!("router: callback for {} failed: {:#}", envelope.kind, err)
                }
                Err(_) => log::error!("router: callback for {} panicked", envelope.kind),
            }
        }
        callbacks.len()
    }

    /// Subscribe to a message type, or to every message with `"all"`.
    /// Registering the same callback twice delivers each message twice.
    pub fn register_callback<F>(&self, topic: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let callback: Callback = Arc::new(callback);
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match Topic::parse(topic) {
            Topic::All => subs.wildcard.push((id, callback)),
            Topic::Type(kind) => subs.by_type.entry(kind).or_default().push((id, callback)),
        }
        log::info!("router: registered callback for message type: {}", topic);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id)
    }

    pub fn send(&self, value: &Value) -> Result<(), RouterError> {
        let text = serde_json::to_string(value)?;
        let mut guard = lock(&self.socket);
        let socket = guard.as_mut().ok_or(RouterError::NotConnected)?;
        socket
            .send(Message::Text(text))
            .map_err(|e| RouterError::Send(e.to_string()))
    }

    /// Close the connection. A running `listen` returns shortly after.
    pub fn disconnect(&self) {
        if let Some(mut socket) = lock(&self.socket).take() {
            if let Err(err) = socket.close(None) {
                log::debug!("router: close handshake failed: {}", err);
            }
            // Best effort: push the close frame out before the stream drops.
            let _ = socket.flush();
            log::info!("router: disconnected from {}", self.url);
        }
        self.set_state(RouterState::Disconnected);
    }
}

/// Publishes every non-empty detection result as a `detection` envelope.
pub struct RouterPublisher {
    router: Arc<MessageRouter>,
}

impl RouterPublisher {
    pub fn new(router: Arc<MessageRouter>) -> Self {
        Self { router }
    }
}

impl DetectionObserver for RouterPublisher {
    fn on_detections(&self, source: &Source, result: &DetectionResult) {
        let message = json!({
            "type": "detection",
            "camera_id": source.id,
            "camera_name": source.name,
            "timestamp": result.captured_at.to_rfc3339(),
            "detections": result.detections,
        });
        match self.router.send(&message) {
            Ok(()) => {}
            Err(RouterError::NotConnected) => {
                log::debug!("router: not connected, detection for source {} not published", source.id)
            }
            Err(err) => log::warn!("router: failed to publish detection: {}", err),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter(router: &MessageRouter, topic: &str) -> (SubscriptionId, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let id = router.register_callback(topic, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (id, hits)
    }

    fn router() -> MessageRouter {
        MessageRouter::new("ws://127.0.0.1:9/ws", DEFAULT_READ_TIMEOUT)
    }

    #[test]
    fn envelope_without_type_is_unknown() {
        let envelope = Envelope::parse(r#"{"camera_id": 1}"#).unwrap();
        assert_eq!(envelope.kind, "unknown");
        assert_eq!(envelope.get("camera_id"), Some(&Value::from(1)));
        assert!(Envelope::parse("[1, 2]").is_err());
        assert!(Envelope::parse("{not json").is_err());
    }

    #[test]
    fn malformed_message_reaches_nobody() {
        let router = router();
        let (_, all) = counter(&router, "all");
        assert_eq!(router.handle("{not json"), 0);
        assert_eq!(all.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wildcard_and_typed_callbacks_both_fire() {
        let router = router();
        let (_, detection) = counter(&router, "detection");
        let (_, all) = counter(&router, "all");

        assert_eq!(router.handle(r#"{"type": "detection"}"#), 2);
        assert_eq!(router.handle(r#"{"type": "status"}"#), 1);
        assert_eq!(detection.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn envelope_typed_all_runs_wildcard_list_twice() {
        let router = router();
        let (_, all) = counter(&router, "all");
        let (_, status) = counter(&router, "status");

        assert_eq!(router.handle(r#"{"type": "all"}"#), 2);
        assert_eq!(all.load(Ordering::SeqCst), 2);
        assert_eq!(status.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn non_string_type_reaches_only_wildcard() {
        let router = router();
        let (_, unknown) = counter(&router, "unknown");
        let (_, five) = counter(&router, "5");
        let (_, all) = counter(&router, "all");

        assert_eq!(Envelope::parse(r#"{"type": 5}"#).unwrap().kind, "5");
        assert_eq!(router.handle(r#"{"type": 5}"#), 1);
        assert_eq!(router.handle(r#"{"type": null}"#), 1);
        assert_eq!(unknown.load(Ordering::SeqCst), 0);
        assert_eq!(five.load(Ordering::SeqCst), 0);
        assert_eq!(all.load(Ordering::SeqCst), 2);

        assert_eq!(router.handle(r#"{"camera_id": 3}"#), 2);
        assert_eq!(unknown.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let router = router();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (topic, tag) in [("all", "wild"), ("alert", "first"), ("alert", "second")] {
            let order = order.clone();
            router.register_callback(topic, move |_| {
                order.lock().unwrap().push(tag);
                Ok(())
            });
        }
        router.handle(r#"{"type": "alert"}"#);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "wild"]);
    }

    #[test]
    fn failing_and_panicking_callbacks_are_isolated() {
        let router = router();
        router.register_callback("alert", |_| anyhow::bail!("subscriber down"));
        router.register_callback("alert", |_| panic!("subscriber bug"));
        let (_, after) = counter(&router, "alert");

        assert_eq!(router.handle(r#"{"type": "alert"}"#), 3);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let router = router();
        let (id, hits) = counter(&router, "detection");
        router.handle(r#"{"type": "detection"}"#);
        assert!(router.unsubscribe(id));
        assert!(!router.unsubscribe(id));
        router.handle(r#"{"type": "detection"}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn send_without_connection_fails() {
        let router = router();
        assert_eq!(router.state(), RouterState::Disconnected);
        let err = router.send(&json!({"type": "ping"})).unwrap_err();
        assert!(matches!(err, RouterError::NotConnected));
    }

    #[test]
    fn connect_failure_stays_disconnected() {
        let router = router();
        let err = router.connect().unwrap_err();
        assert!(matches!(err, RouterError::Connect { .. }), "{err:?}");
        assert_eq!(router.state(), RouterState::Disconnected);
    }
}
