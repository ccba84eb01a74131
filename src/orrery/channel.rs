//! Persistent bidirectional channels with ordering and retry.
//!
//! A [`Channel`] links two named agents. Local channels deliver envelopes
//! in-process; remote channels serialize onto a consumed [`Transport`].
//! Either way the channel guarantees per-channel FIFO: for two sends `e1`
//! then `e2`, every handler sees `e1` before `e2`. There is no
//! cross-channel ordering.
//!
//! State machine:
//!
//! ```text
//! connecting ──→ open ──→ closed
//!      ↑          ↓
//!   reconnecting (remote transport only)
//! ```
//!
//! Failed transport writes retry up to [`SEND_RETRIES`] times with
//! exponential backoff; exhaustion surfaces a delivery-failure event and
//! error-listener call without changing channel state.
//!
//! The [`ChannelManager`] keeps one canonical channel per unordered agent
//! pair.

use crate::orrery::envelope::Envelope;
use crate::orrery::observability::{FabricEvent, ObservabilitySink};
use crate::orrery::router::{HandlerId, ReceiveHandler};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Retries after the first failed transport write.
pub const SEND_RETRIES: u32 = 3;

/// Base backoff unit; retry `n` sleeps `BACKOFF_BASE_MS << (n - 1)`,
/// so the retries wait 50, 100, then 200ms.
const BACKOFF_BASE_MS: u64 = 50;

/// Cap on the per-channel message log.
const MESSAGE_LOG_CAP: usize = 256;

/// Consumed byte transport. Local endpoints bypass this entirely.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, bytes: &[u8]) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Register the receive path. The transport calls the handler once
    /// per inbound frame.
    fn on_receive(&self, handler: Box<dyn Fn(Vec<u8>) + Send + Sync>);

    async fn close(&self);
}

/// Loopback transport that accepts every frame and keeps what it was
/// given. Useful for tests and single-process deployments that still
/// want the serialization path exercised.
pub struct LocalTransport {
    sent: RwLock<Vec<Vec<u8>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            sent: RwLock::new(Vec::new()),
        }
    }

    /// Frames accepted so far, in order.
    pub async fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.read().await.clone()
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, bytes: &[u8]) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.sent.write().await.push(bytes.to_vec());
        Ok(())
    }

    fn on_receive(&self, _handler: Box<dyn Fn(Vec<u8>) + Send + Sync>) {}

    async fn close(&self) {}
}

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelStatus::Connecting => write!(f, "connecting"),
            ChannelStatus::Open => write!(f, "open"),
            ChannelStatus::Reconnecting => write!(f, "reconnecting"),
            ChannelStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Errors raised by channel sends.
#[derive(Debug, Clone)]
pub enum ChannelError {
    /// Send on a closed channel.
    Closed,
    /// The transport rejected the frame on every attempt.
    DeliveryFailed { attempts: u32 },
    /// The envelope could not be serialized for the wire.
    Serialization(String),
}

impl ChannelError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelError::Closed => "state-violation",
            ChannelError::DeliveryFailed { .. } => "delivery-failed",
            ChannelError::Serialization(_) => "schema-mismatch",
        }
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Closed => write!(f, "Channel is closed"),
            ChannelError::DeliveryFailed { attempts } => {
                write!(f, "Delivery failed after {} attempts", attempts)
            }
            ChannelError::Serialization(msg) => write!(f, "Envelope serialization failed: {}", msg),
        }
    }
}

impl Error for ChannelError {}

/// Listener invoked when a send exhausts its retries.
pub type DeliveryErrorListener = Arc<dyn Fn(&ChannelError) + Send + Sync>;

/// A bidirectional link between two named agents.
pub struct Channel {
    id: String,
    local_agent: String,
    remote_agent: String,
    status: RwLock<ChannelStatus>,
    transport: Option<Arc<dyn Transport>>,
    /// Ordered-send lock; the one lock in the crate deliberately held
    /// across suspension points, because releasing it mid-send would
    /// reorder the queue.
    send_queue: Mutex<()>,
    handlers: Arc<RwLock<Vec<(HandlerId, ReceiveHandler)>>>,
    error_listeners: RwLock<Vec<(HandlerId, DeliveryErrorListener)>>,
    next_handler: AtomicU64,
    message_log: RwLock<VecDeque<Envelope>>,
    sink: Arc<ObservabilitySink>,
}

impl Channel {
    /// Canonical id for an unordered agent pair.
    fn pair_id(a: &str, b: &str) -> String {
        if a <= b {
            format!("{}<->{}", a, b)
        } else {
            format!("{}<->{}", b, a)
        }
    }

    /// Open an in-process channel. Local channels skip `connecting` and
    /// are usable immediately.
    pub fn open_local(
        local_agent: impl Into<String>,
        remote_agent: impl Into<String>,
        sink: Arc<ObservabilitySink>,
    ) -> Arc<Channel> {
        let local_agent = local_agent.into();
        let remote_agent = remote_agent.into();
        Arc::new(Channel {
            id: Self::pair_id(&local_agent, &remote_agent),
            local_agent,
            remote_agent,
            status: RwLock::new(ChannelStatus::Open),
            transport: None,
            send_queue: Mutex::new(()),
            handlers: Arc::new(RwLock::new(Vec::new())),
            error_listeners: RwLock::new(Vec::new()),
            next_handler: AtomicU64::new(1),
            message_log: RwLock::new(VecDeque::new()),
            sink,
        })
    }

    /// Begin connecting over a transport. The channel starts in
    /// `connecting`; call [`mark_open`](Self::mark_open) once the
    /// transport acknowledges. Inbound frames are parsed and delivered to
    /// the channel's handlers in arrival order.
    pub fn connect_remote(
        local_agent: impl Into<String>,
        remote_agent: impl Into<String>,
        transport: Arc<dyn Transport>,
        sink: Arc<ObservabilitySink>,
    ) -> Arc<Channel> {
        let local_agent = local_agent.into();
        let remote_agent = remote_agent.into();
        let handlers: Arc<RwLock<Vec<(HandlerId, ReceiveHandler)>>> =
            Arc::new(RwLock::new(Vec::new()));

        {
            // The transport callback holds the handler table, not the
            // channel, so channel drop is never blocked by the transport.
            let handlers = handlers.clone();
            transport.on_receive(Box::new(move |bytes: Vec<u8>| {
                let handlers = handlers.clone();
                tokio::spawn(async move {
                    let raw = String::from_utf8_lossy(&bytes).to_string();
                    match Envelope::from_json(&raw) {
                        Ok(envelope) => {
                            let snapshot: Vec<ReceiveHandler> = handlers
                                .read()
                                .await
                                .iter()
                                .map(|(_, handler)| handler.clone())
                                .collect();
                            for handler in snapshot {
                                handler(envelope.clone()).await;
                            }
                        }
                        Err(e) => log::warn!("channel: dropping inbound frame: {}", e),
                    }
                });
            }));
        }

        Arc::new(Channel {
            id: Self::pair_id(&local_agent, &remote_agent),
            local_agent,
            remote_agent,
            status: RwLock::new(ChannelStatus::Connecting),
            transport: Some(transport),
            send_queue: Mutex::new(()),
            handlers,
            error_listeners: RwLock::new(Vec::new()),
            next_handler: AtomicU64::new(1),
            message_log: RwLock::new(VecDeque::new()),
            sink,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_agent(&self) -> &str {
        &self.local_agent
    }

    pub fn remote_agent(&self) -> &str {
        &self.remote_agent
    }

    pub async fn status(&self) -> ChannelStatus {
        *self.status.read().await
    }

    /// Transport acknowledged: `connecting`/`reconnecting` → `open`.
    pub async fn mark_open(&self) {
        let mut status = self.status.write().await;
        if matches!(
            *status,
            ChannelStatus::Connecting | ChannelStatus::Reconnecting
        ) {
            *status = ChannelStatus::Open;
        }
    }

    /// Remote transport dropped: `open` → `reconnecting`. No-op for
    /// local channels.
    pub async fn mark_disconnected(&self) {
        if self.transport.is_none() {
            return;
        }
        let mut status = self.status.write().await;
        if *status == ChannelStatus::Open {
            *status = ChannelStatus::Reconnecting;
            log::debug!("channel {}: reconnecting", self.id);
        }
    }

    /// Register an in-order delivery handler.
    pub async fn on_message(&self, handler: ReceiveHandler) -> HandlerId {
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().await.push((id, handler));
        id
    }

    /// Remove a delivery handler. Returns whether it was registered.
    pub async fn remove_handler(&self, handler_id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().await;
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != handler_id);
        handlers.len() != before
    }

    /// Register a listener for exhausted-retry delivery failures.
    pub async fn on_error(&self, listener: DeliveryErrorListener) -> HandlerId {
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        self.error_listeners.write().await.push((id, listener));
        id
    }

    /// Send an envelope over the channel, in FIFO order relative to every
    /// other send on this channel.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ChannelError> {
        if self.status().await == ChannelStatus::Closed {
            return Err(ChannelError::Closed);
        }

        // FIFO barrier: the queue lock is held across the whole attempt
        // sequence, including backoff sleeps.
        let _queued = self.send_queue.lock().await;

        if self.status().await == ChannelStatus::Closed {
            return Err(ChannelError::Closed);
        }

        match &self.transport {
            Some(transport) => {
                let bytes = envelope
                    .to_json()
                    .map_err(|e| ChannelError::Serialization(e.to_string()))?
                    .into_bytes();
                let mut attempts = 0;
                loop {
                    attempts += 1;
                    match transport.send(&bytes).await {
                        Ok(()) => break,
                        Err(e) if attempts <= SEND_RETRIES => {
                            let delay = BACKOFF_BASE_MS << (attempts - 1);
                            log::debug!(
                                "channel {}: send attempt {} failed ({}), retrying in {}ms",
                                self.id,
                                attempts,
                                e,
                                delay
                            );
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                        }
                        Err(e) => {
                            log::warn!(
                                "channel {}: delivery failed after {} attempts: {}",
                                self.id,
                                attempts,
                                e
                            );
                            let error = ChannelError::DeliveryFailed { attempts };
                            self.sink
                                .emit(FabricEvent::DeliveryFailed {
                                    channel_id: self.id.clone(),
                                    envelope_id: envelope.id.clone(),
                                    attempts,
                                })
                                .await;
                            let listeners: Vec<DeliveryErrorListener> = self
                                .error_listeners
                                .read()
                                .await
                                .iter()
                                .map(|(_, listener)| listener.clone())
                                .collect();
                            for listener in listeners {
                                listener(&error);
                            }
                            return Err(error);
                        }
                    }
                }
            }
            None => {
                // Local channel: deliver straight to the handlers.
                let snapshot: Vec<ReceiveHandler> = self
                    .handlers
                    .read()
                    .await
                    .iter()
                    .map(|(_, handler)| handler.clone())
                    .collect();
                for handler in snapshot {
                    handler(envelope.clone()).await;
                }
            }
        }

        let mut message_log = self.message_log.write().await;
        if message_log.len() == MESSAGE_LOG_CAP {
            message_log.pop_front();
        }
        message_log.push_back(envelope);
        Ok(())
    }

    /// Envelopes successfully sent on this channel, oldest first, capped.
    pub async fn message_log(&self) -> Vec<Envelope> {
        self.message_log.read().await.iter().cloned().collect()
    }

    /// Terminal transition. Buffered state is released; subsequent sends
    /// fail with [`ChannelError::Closed`]. Does not interrupt a send in
    /// flight.
    pub async fn close(&self) {
        {
            let mut status = self.status.write().await;
            if *status == ChannelStatus::Closed {
                return;
            }
            *status = ChannelStatus::Closed;
        }
        self.message_log.write().await.clear();
        if let Some(transport) = &self.transport {
            transport.close().await;
        }
        self.sink
            .emit(FabricEvent::ChannelClosed {
                channel_id: self.id.clone(),
            })
            .await;
        log::debug!("channel {}: closed", self.id);
    }
}

/// Keeps one canonical channel per unordered agent pair.
pub struct ChannelManager {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    sink: Arc<ObservabilitySink>,
}

impl ChannelManager {
    pub fn new(sink: Arc<ObservabilitySink>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            sink,
        }
    }

    /// Return the existing channel for the pair or open a fresh local
    /// one. `open_channel(a, b)` and `open_channel(b, a)` yield the same
    /// channel.
    pub async fn open_channel(&self, a: &str, b: &str) -> Arc<Channel> {
        let (channel, created) = {
            let mut channels = self.channels.write().await;
            let key = Channel::pair_id(a, b);
            match channels.get(&key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let channel = Channel::open_local(a, b, self.sink.clone());
                    channels.insert(key, channel.clone());
                    (channel, true)
                }
            }
        };
        if created {
            self.sink
                .emit(FabricEvent::ChannelOpened {
                    channel_id: channel.id().to_string(),
                    local_agent: a.to_string(),
                    remote_agent: b.to_string(),
                })
                .await;
        }
        channel
    }

    pub async fn get_channel(&self, a: &str, b: &str) -> Option<Arc<Channel>> {
        self.channels.read().await.get(&Channel::pair_id(a, b)).cloned()
    }

    pub async fn list_channels(&self) -> Vec<Arc<Channel>> {
        self.channels.read().await.values().cloned().collect()
    }

    /// Close every channel and empty the table.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Channel>> = {
            let mut channels = self.channels.write().await;
            channels.drain().map(|(_, channel)| channel).collect()
        };
        for channel in drained {
            channel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orrery::envelope::EnvelopeFactory;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;

    fn recorder(seen: Arc<StdMutex<Vec<String>>>) -> ReceiveHandler {
        Arc::new(move |envelope: Envelope| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(envelope.id);
            })
        })
    }

    #[tokio::test]
    async fn local_channel_opens_immediately_and_delivers_in_order() {
        let sink = Arc::new(ObservabilitySink::new());
        let channel = Channel::open_local("sun", "mars", sink);
        assert_eq!(channel.status().await, ChannelStatus::Open);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        channel.on_message(recorder(seen.clone())).await;

        let factory = EnvelopeFactory::new("sun");
        let mut expected = Vec::new();
        for i in 0..20 {
            let envelope = factory.create_request("mars", serde_json::json!({ "seq": i }));
            expected.push(envelope.id.clone());
            channel.send(envelope).await.unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), expected);
        assert_eq!(channel.message_log().await.len(), 20);
    }

    #[tokio::test]
    async fn send_on_closed_channel_fails() {
        let sink = Arc::new(ObservabilitySink::new());
        let channel = Channel::open_local("sun", "mars", sink);
        channel.close().await;
        assert_eq!(channel.status().await, ChannelStatus::Closed);

        let envelope = EnvelopeFactory::new("sun").create_request("mars", serde_json::json!({}));
        let err = channel.send(envelope).await.unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
        assert_eq!(err.kind(), "state-violation");
        assert!(channel.message_log().await.is_empty());
    }

    struct FlakyTransport {
        /// Fail this many sends before accepting.
        failures_left: AtomicU32,
        accepted: AtomicU32,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn send(&self, _bytes: &[u8]) -> Result<(), Box<dyn Error + Send + Sync>> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err("connection reset".into());
            }
            self.accepted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_receive(&self, _handler: Box<dyn Fn(Vec<u8>) + Send + Sync>) {}

        async fn close(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_are_retried_with_backoff() {
        let transport = Arc::new(FlakyTransport {
            failures_left: AtomicU32::new(2),
            accepted: AtomicU32::new(0),
        });
        let sink = Arc::new(ObservabilitySink::new());
        let channel =
            Channel::connect_remote("earth", "neptune", transport.clone(), sink.clone());
        channel.mark_open().await;

        let envelope = EnvelopeFactory::new("earth").create_request("neptune", serde_json::json!({}));
        channel.send(envelope).await.unwrap();
        assert_eq!(transport.accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_without_state_change() {
        let transport = Arc::new(FlakyTransport {
            failures_left: AtomicU32::new(u32::MAX),
            accepted: AtomicU32::new(0),
        });
        let sink = Arc::new(ObservabilitySink::new());
        let channel =
            Channel::connect_remote("earth", "neptune", transport, sink.clone());
        channel.mark_open().await;

        let failures = Arc::new(StdMutex::new(Vec::new()));
        {
            let failures = failures.clone();
            channel
                .on_error(Arc::new(move |error: &ChannelError| {
                    failures.lock().unwrap().push(error.kind());
                }))
                .await;
        }

        let envelope = EnvelopeFactory::new("earth").create_request("neptune", serde_json::json!({}));
        let err = channel.send(envelope).await.unwrap_err();
        assert!(matches!(
            err,
            ChannelError::DeliveryFailed {
                attempts
            } if attempts == SEND_RETRIES + 1
        ));
        assert_eq!(channel.status().await, ChannelStatus::Open);
        assert_eq!(*failures.lock().unwrap(), vec!["delivery-failed"]);
        assert_eq!(sink.metrics().await.messages_failed, 1);
    }

    #[tokio::test]
    async fn remote_channel_walks_the_state_machine() {
        let sink = Arc::new(ObservabilitySink::new());
        let channel = Channel::connect_remote(
            "earth",
            "neptune",
            Arc::new(LocalTransport::new()),
            sink,
        );
        assert_eq!(channel.status().await, ChannelStatus::Connecting);
        channel.mark_open().await;
        assert_eq!(channel.status().await, ChannelStatus::Open);
        channel.mark_disconnected().await;
        assert_eq!(channel.status().await, ChannelStatus::Reconnecting);
        channel.mark_open().await;
        assert_eq!(channel.status().await, ChannelStatus::Open);
        channel.close().await;
        assert_eq!(channel.status().await, ChannelStatus::Closed);
        // Closed is terminal.
        channel.mark_open().await;
        assert_eq!(channel.status().await, ChannelStatus::Closed);
    }

    #[tokio::test]
    async fn manager_keeps_one_channel_per_unordered_pair() {
        let sink = Arc::new(ObservabilitySink::new());
        let manager = ChannelManager::new(sink);

        let ab = manager.open_channel("sun", "mars").await;
        let ba = manager.open_channel("mars", "sun").await;
        assert!(Arc::ptr_eq(&ab, &ba));
        assert_eq!(manager.list_channels().await.len(), 1);

        manager.open_channel("sun", "venus").await;
        assert_eq!(manager.list_channels().await.len(), 2);

        manager.close_all().await;
        assert!(manager.list_channels().await.is_empty());
        assert_eq!(ab.status().await, ChannelStatus::Closed);
    }
}
