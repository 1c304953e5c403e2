//! Topic-based fan-out from one producer to many independently paced
//! subscribers.
//!
//! # Architecture
//!
//! ```text
//! publish() --try_send--> [bounded queue] --> forwarder thread --> subscriber 1 (bounded)
//!   (capture thread,                            (tag check,     --> subscriber 2 (bounded)
//!    never blocks)                               per-endpoint   --> BusBridge --> TCP peer
//!                                                overflow policy)
//! ```
//!
//! The producer only ever does a non-blocking enqueue: if the queue is full
//! the message is dropped and counted, if the bus is stopped it is dropped
//! silently. The forwarder does the actual delivery on its own thread so a
//! slow subscriber can only stall the forwarder, never the producer.
//!
//! The forwarder holds off delivery for a startup grace period, so
//! subscribers that attach shortly after the bus starts still receive the
//! first messages. On stop it flushes what is already queued (best-effort),
//! sends [`Payload::Stop`] to every subscriber, waits the grace period once
//! more and exits.

pub mod socket;

use nanotrack_core::{AppResult, Frame, StopSignal, TrackedPoint};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, info, trace, warn};

pub use socket::{BridgeConfig, BusBridge, RemoteSubscriber};

/// Control text that ends a subscriber loop.
pub const STOP_TEXT: &str = "stop";

/// What travels on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// A camera frame, shared without copying in-process
    Frame(Arc<Frame>),
    /// Tracked points refined on `frame_index`
    Points {
        /// Frame the points were refined on
        frame_index: u64,
        /// Current estimates
        points: Vec<TrackedPoint>,
    },
    /// One window of analog samples
    Samples(Vec<f64>),
    /// Free-form text
    Text(String),
    /// Shutdown sentinel. Control only, never data.
    Stop,
}

impl Payload {
    /// True for the shutdown sentinel, including the legacy `"stop"` text.
    pub fn is_stop(&self) -> bool {
        match self {
            Payload::Stop => true,
            Payload::Text(t) => t == STOP_TEXT,
            _ => false,
        }
    }
}

/// A payload tagged with its topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Topic the payload was published on
    pub topic: String,
    /// The message
    pub payload: Payload,
}

/// Bus tuning.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Producer-side queue length
    pub queue_capacity: usize,
    /// Default per-subscriber buffer
    pub subscriber_buffer: usize,
    /// Delay before the first delivery and before exit on stop
    pub grace: Duration,
    /// Forwarder poll interval when idle or retrying a full subscriber
    pub poll_interval: Duration,
    /// Default overflow policy for subscribers: drop instead of waiting
    pub drop_on_overflow: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            subscriber_buffer: 256,
            grace: Duration::from_millis(100),
            poll_interval: Duration::from_millis(1),
            drop_on_overflow: false,
        }
    }
}

/// Per-subscriber settings.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Messages buffered for this subscriber
    pub buffer: usize,
    /// Drop when the buffer is full instead of holding up the forwarder
    pub drop_on_overflow: bool,
}

/// Bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Messages accepted into the queue
    pub published: u64,
    /// Messages rejected because the queue was full
    pub dropped_at_publish: u64,
    /// Deliveries to subscriber buffers
    pub delivered: u64,
    /// Deliveries dropped on a full subscriber buffer
    pub dropped_at_delivery: u64,
    /// Live subscribers
    pub subscribers: usize,
}

struct Endpoint {
    id: u64,
    topic: String,
    config: SubscriberConfig,
    tx: mpsc::Sender<Arc<Envelope>>,
    dropped: Arc<AtomicU64>,
}

impl Endpoint {
    fn accepts(&self, topic: &str) -> bool {
        self.topic == topic
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    dropped_at_publish: AtomicU64,
    delivered: AtomicU64,
    dropped_at_delivery: AtomicU64,
    next_id: AtomicU64,
}

struct Shared {
    config: BusConfig,
    stop: StopSignal,
    stopped: AtomicBool,
    endpoints: RwLock<Vec<Arc<Endpoint>>>,
    counters: Counters,
}

struct Inner {
    shared: Arc<Shared>,
    queue: mpsc::Sender<Envelope>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn shutdown(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.stop.trigger();
        if let Some(handle) = self.forwarder.lock().take() {
            if handle.join().is_err() {
                warn!("Bus forwarder panicked");
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cheap handle for publishing from any thread.
#[derive(Clone)]
pub struct Publisher {
    queue: mpsc::Sender<Envelope>,
    shared: Arc<Shared>,
}

impl Publisher {
    /// Enqueue `payload` on `topic` without blocking.
    ///
    /// Returns `false` if the message was dropped, either because the bus is
    /// stopped or because the queue is full.
    pub fn publish(&self, topic: &str, payload: Payload) -> bool {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let envelope = Envelope {
            topic: topic.to_string(),
            payload,
        };
        match self.queue.try_send(envelope) {
            Ok(()) => {
                self.shared.counters.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                let n = self
                    .shared
                    .counters
                    .dropped_at_publish
                    .fetch_add(1, Ordering::Relaxed);
                if n % 100 == 0 {
                    warn!(topic, dropped = n + 1, "Bus queue full, dropping messages");
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Non-owning bus handle, see [`BroadcastBus::downgrade`].
#[derive(Clone)]
pub struct WeakBus {
    inner: Weak<Inner>,
}

impl WeakBus {
    /// The bus, unless every owning handle has been dropped.
    pub fn upgrade(&self) -> Option<BroadcastBus> {
        self.inner.upgrade().map(|inner| BroadcastBus { inner })
    }
}

/// In-process broadcast bus with a dedicated forwarder thread.
#[derive(Clone)]
pub struct BroadcastBus {
    inner: Arc<Inner>,
}

impl BroadcastBus {
    /// Create the bus and start its forwarder.
    pub fn start(config: BusConfig) -> AppResult<Self> {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            config,
            stop: StopSignal::new(),
            stopped: AtomicBool::new(false),
            endpoints: RwLock::new(Vec::new()),
            counters: Counters::default(),
        });
        let forwarder_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("bus-forwarder".into())
            .spawn(move || forward(&forwarder_shared, rx))?;
        info!(
            queue = shared.config.queue_capacity,
            grace_ms = shared.config.grace.as_millis() as u64,
            "Started broadcast bus"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                shared,
                queue,
                forwarder: Mutex::new(Some(handle)),
            }),
        })
    }

    /// A handle that does not keep the bus alive: once every
    /// `BroadcastBus` clone is dropped the bus shuts down.
    pub fn downgrade(&self) -> WeakBus {
        WeakBus {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// A publishing handle that can be moved into other threads.
    pub fn publisher(&self) -> Publisher {
        Publisher {
            queue: self.inner.queue.clone(),
            shared: Arc::clone(&self.inner.shared),
        }
    }

    /// Enqueue `payload` on `topic`. See [`Publisher::publish`].
    pub fn publish(&self, topic: &str, payload: Payload) -> bool {
        self.publisher().publish(topic, payload)
    }

    /// Attach a subscriber to `topic` with the bus defaults.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let config = &self.inner.shared.config;
        self.subscribe_with(
            topic,
            SubscriberConfig {
                buffer: config.subscriber_buffer,
                drop_on_overflow: config.drop_on_overflow,
            },
        )
    }

    /// Attach a subscriber to `topic`.
    ///
    /// Subscribing to a stopped bus yields a subscription that ends at once.
    pub fn subscribe_with(&self, topic: &str, config: SubscriberConfig) -> Subscription {
        let shared = &self.inner.shared;
        let (tx, rx) = mpsc::channel(config.buffer.max(1));
        let endpoint = Arc::new(Endpoint {
            id: shared.counters.next_id.fetch_add(1, Ordering::Relaxed),
            topic: topic.to_string(),
            config,
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        });
        {
            // checked under the lock the forwarder clears endpoints with
            let mut endpoints = shared.endpoints.write();
            if !shared.stopped.load(Ordering::SeqCst) {
                endpoints.push(Arc::clone(&endpoint));
                debug!(topic, id = endpoint.id, "Subscriber attached");
            }
        }
        Subscription {
            topic: topic.to_string(),
            rx,
            dropped: Arc::clone(&endpoint.dropped),
            ended: false,
        }
    }

    /// Stop accepting messages, flush, tell every subscriber to stop and
    /// wait for the forwarder. Idempotent.
    pub fn stop(&self) {
        self.inner.shutdown();
    }

    /// True once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.shared.stopped.load(Ordering::SeqCst)
    }

    /// Current counters.
    pub fn stats(&self) -> BusStats {
        let c = &self.inner.shared.counters;
        BusStats {
            published: c.published.load(Ordering::Relaxed),
            dropped_at_publish: c.dropped_at_publish.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped_at_delivery: c.dropped_at_delivery.load(Ordering::Relaxed),
            subscribers: self.inner.shared.endpoints.read().len(),
        }
    }
}

fn forward(shared: &Shared, mut rx: mpsc::Receiver<Envelope>) {
    let poll = shared.config.poll_interval;
    if !shared.stop.sleep(shared.config.grace) {
        debug!("Bus grace period over, delivering");
    }

    loop {
        let stopping = shared.stop.is_triggered();
        match rx.try_recv() {
            Ok(envelope) => deliver(shared, Arc::new(envelope), stopping),
            Err(TryRecvError::Empty) if stopping => break,
            Err(TryRecvError::Empty) => thread::sleep(poll),
            Err(TryRecvError::Disconnected) => break,
        }
    }

    let sentinel = Arc::new(Envelope {
        topic: String::new(),
        payload: Payload::Stop,
    });
    for endpoint in shared.endpoints.read().iter() {
        let _ = endpoint.tx.try_send(Arc::clone(&sentinel));
    }
    thread::sleep(shared.config.grace);
    let detached = std::mem::take(&mut *shared.endpoints.write());
    info!(
        subscribers = detached.len(),
        delivered = shared.counters.delivered.load(Ordering::Relaxed),
        "Bus forwarder exiting"
    );
}

fn deliver(shared: &Shared, envelope: Arc<Envelope>, stopping: bool) {
    let endpoints: Vec<Arc<Endpoint>> = shared.endpoints.read().clone();
    let mut closed = Vec::new();
    for endpoint in endpoints.iter().filter(|e| e.accepts(&envelope.topic)) {
        let mut message = Arc::clone(&envelope);
        loop {
            match endpoint.tx.try_send(message) {
                Ok(()) => {
                    shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(TrySendError::Full(m)) => {
                    if endpoint.config.drop_on_overflow || shared.stop.is_triggered() || stopping
                    {
                        endpoint.dropped.fetch_add(1, Ordering::Relaxed);
                        shared
                            .counters
                            .dropped_at_delivery
                            .fetch_add(1, Ordering::Relaxed);
                        trace!(topic = %envelope.topic, id = endpoint.id, "Subscriber full, dropped");
                        break;
                    }
                    message = m;
                    thread::sleep(shared.config.poll_interval);
                }
                Err(TrySendError::Closed(_)) => {
                    closed.push(endpoint.id);
                    break;
                }
            }
        }
    }
    if !closed.is_empty() {
        shared.endpoints.write().retain(|e| !closed.contains(&e.id));
        debug!(n = closed.len(), "Subscribers detached");
    }
}

/// Receiving end for one topic.
///
/// Dropping it detaches the subscriber on the next delivery.
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<Arc<Envelope>>,
    dropped: Arc<AtomicU64>,
    ended: bool,
}

impl Subscription {
    /// Topic this subscription listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Messages dropped for this subscriber because its buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn accept(&mut self, message: Option<Arc<Envelope>>) -> Option<Arc<Envelope>> {
        match message {
            Some(m) if m.payload.is_stop() => {
                self.ended = true;
                None
            }
            Some(m) => Some(m),
            None => {
                self.ended = true;
                None
            }
        }
    }

    /// Block for the next message. `None` once the bus has stopped.
    ///
    /// Must not be called from inside an async runtime; use
    /// [`recv_async`](Self::recv_async) there.
    pub fn recv(&mut self) -> Option<Arc<Envelope>> {
        if self.ended {
            return None;
        }
        let message = self.rx.blocking_recv();
        self.accept(message)
    }

    /// Await the next message. `None` once the bus has stopped.
    pub async fn recv_async(&mut self) -> Option<Arc<Envelope>> {
        if self.ended {
            return None;
        }
        let message = self.rx.recv().await;
        self.accept(message)
    }

    /// Next message if one is buffered.
    pub fn try_recv(&mut self) -> Option<Arc<Envelope>> {
        if self.ended {
            return None;
        }
        match self.rx.try_recv() {
            Ok(m) => self.accept(Some(m)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => self.accept(None),
        }
    }

    /// True after the stop sentinel or a closed channel was seen.
    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

impl Iterator for Subscription {
    type Item = Arc<Envelope>;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}
