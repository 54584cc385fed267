//! Subscriber registry and fan-out

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::event::Event;
use crate::PipelineError;
use crate::sync_utils::lock;

/// Why a delivery failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// Subscriber is not keeping up
    Full,
    /// Subscriber went away
    Closed,
}

/// Anything that can take one serialized event without waiting.
///
/// A failed delivery is treated as subscriber death.
pub trait SubscriberChannel: Send + Sync + 'static {
    fn try_send(&self, message: Arc<str>) -> Result<(), DeliveryFailure>;
}

struct MpscChannel {
    tx: mpsc::Sender<Arc<str>>,
}

impl SubscriberChannel for MpscChannel {
    fn try_send(&self, message: Arc<str>) -> Result<(), DeliveryFailure> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryFailure::Full,
            TrySendError::Closed(_) => DeliveryFailure::Closed,
        })
    }
}

/// Receiving half handed to a subscriber
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<str>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next serialized event, or `None` once the broadcaster dropped us
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> ReceiverStream<Arc<str>> {
        ReceiverStream::new(self.rx)
    }
}

struct Registry {
    subscribers: Mutex<HashMap<u64, Arc<dyn SubscriberChannel>>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// Fan-out point for result and telemetry events.
///
/// Cloning is cheap; all clones share one registry. Publishing never waits
/// on a subscriber.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Registry>,
}

impl Broadcaster {
    /// `capacity` bounds each subscription's queue
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Registry {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Open a queue-backed subscription, greeted with a status event
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let channel = MpscChannel { tx };
        match Event::connected().to_json() {
            Ok(greeting) => {
                let _ = channel.try_send(greeting.into());
            }
            Err(e) => warn!("{}", e),
        }
        let id = self.register(Arc::new(channel));
        Subscription { id, rx }
    }

    /// Add a caller-provided channel, returning its id
    pub fn register(&self, channel: Arc<dyn SubscriberChannel>) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut subscribers = lock(&self.inner.subscribers);
            subscribers.insert(id, channel);
            subscribers.len()
        };
        info!("Subscriber {} connected ({} total)", id, count);
        id
    }

    /// Returns `false` if `id` was not registered
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = lock(&self.inner.subscribers).remove(&id).is_some();
        if removed {
            info!("Subscriber {} disconnected", id);
        }
        removed
    }

    /// Deliver `event` to every subscriber and return how many accepted it.
    ///
    /// Subscribers that fail are removed once the pass is complete.
    pub fn publish(&self, event: &Event) -> usize {
        let message: Arc<str> = match event.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                warn!("Dropping event: {}", e);
                return 0;
            }
        };

        let mut subscribers = lock(&self.inner.subscribers);
        let mut failed = Vec::new();
        for (&id, channel) in subscribers.iter() {
            if let Err(failure) = channel.try_send(message.clone()) {
                failed.push((id, failure));
            }
        }

        for (id, failure) in &failed {
            subscribers.remove(id);
            let reason = match failure {
                DeliveryFailure::Full => "queue full",
                DeliveryFailure::Closed => "channel closed",
            };
            let error =
                PipelineError::SubscriberDelivery { subscriber: *id, reason: reason.into() };
            warn!("{}", error);
        }

        let delivered = subscribers.len();
        debug!(kind = event.kind(), delivered, pruned = failed.len(), "Published event");
        delivered
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscriber; queue-backed subscriptions see end of stream
    pub fn close_all(&self) -> usize {
        let closed = std::mem::take(&mut *lock(&self.inner.subscribers)).len();
        info!("Closed {} subscriber channels", closed);
        closed
    }
}
