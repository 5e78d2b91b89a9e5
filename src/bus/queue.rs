use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::{mpsc, Notify};
use tracing::debug;

use super::events::{InboundMessage, OutboundMessage};

const DEFAULT_INBOUND_CAPACITY: usize = 256;
const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// A bounded single-consumer queue that drops the oldest entry on
/// overflow rather than blocking the publisher. Used for inbound
/// traffic so a slow or wedged agent loop cannot stall channels.
struct DropOldestQueue<T> {
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> DropOldestQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, item: T) -> bool {
        let mut dropped = false;
        {
            let mut guard = self.inner.lock().expect("queue mutex poisoned");
            if guard.len() >= self.capacity {
                guard.pop_front();
                dropped = true;
            }
            guard.push_back(item);
        }
        self.notify.notify_one();
        dropped
    }

    async fn pop(&self) -> T {
        loop {
            {
                let mut guard = self.inner.lock().expect("queue mutex poisoned");
                if let Some(item) = guard.pop_front() {
                    return item;
                }
            }
            self.notify.notified().await;
        }
    }
}

type Predicate = Box<dyn Fn(&OutboundMessage) -> bool + Send + Sync>;

struct OutboundSubscriber {
    predicate: Predicate,
    sender: mpsc::Sender<OutboundMessage>,
}

/// In-process pub/sub connecting channels to the agent loop. No
/// durability: a crash loses anything still queued.
pub struct MessageBus {
    inbound: Arc<DropOldestQueue<InboundMessage>>,
    outbound_subscribers: Mutex<Vec<OutboundSubscriber>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INBOUND_CAPACITY)
    }

    pub fn with_capacity(inbound_capacity: usize) -> Self {
        Self {
            inbound: Arc::new(DropOldestQueue::new(inbound_capacity)),
            outbound_subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Non-blocking up to capacity; drops the oldest queued message
    /// past that point so a wedged dispatcher cannot stall channels.
    pub fn publish_inbound(&self, msg: InboundMessage) {
        let session_key = msg.session_key();
        if self.inbound.push(msg) {
            debug!(session_key, "inbound bus dropped oldest queued message");
        }
    }

    pub async fn recv_inbound(&self) -> InboundMessage {
        self.inbound.pop().await
    }

    /// Registers a new subscriber matching `predicate`. Delivery to
    /// this subscriber blocks the publisher once its bounded queue is
    /// full, trading publisher latency for no silent outbound drops.
    pub fn subscribe_outbound(
        &self,
        predicate: impl Fn(&OutboundMessage) -> bool + Send + Sync + 'static,
    ) -> mpsc::Receiver<OutboundMessage> {
        let (tx, rx) = mpsc::channel(DEFAULT_OUTBOUND_CAPACITY);
        let mut subs = self
            .outbound_subscribers
            .lock()
            .expect("subscriber mutex poisoned");
        subs.push(OutboundSubscriber {
            predicate: Box::new(predicate),
            sender: tx,
        });
        rx
    }

    /// Delivers `msg` to every matching subscriber, blocking per
    /// subscriber whose queue is currently full. A subscriber whose
    /// receiver has been dropped is pruned.
    pub async fn publish_outbound(&self, msg: OutboundMessage) {
        let matching: Vec<mpsc::Sender<OutboundMessage>> = {
            let mut subs = self
                .outbound_subscribers
                .lock()
                .expect("subscriber mutex poisoned");
            subs.retain(|s| !s.sender.is_closed());
            subs.iter()
                .filter(|s| (s.predicate)(&msg))
                .map(|s| s.sender.clone())
                .collect()
        };
        for sender in matching {
            if sender.send(msg.clone()).await.is_err() {
                debug!("outbound subscriber dropped before delivery");
            }
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
