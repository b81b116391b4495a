//! In-process publish/subscribe bus for status and progress messages.
//!
//! Publishers never block: each subscriber owns a bounded mailbox that drops
//! its oldest entry when full, and a dedicated forwarding task drains the
//! mailbox into the subscriber's callback. The subscriber list is copy-on-write,
//! so the lock is held only long enough to clone a snapshot.

mod message;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, trace};

pub use message::{Message, MessageStatus, Progress};

/// Default number of messages buffered per subscriber.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

struct Mailbox {
    queue: Mutex<VecDeque<Arc<Message>>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, message: Arc<Message>) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(message);
        }
        self.notify.notify_one();
    }

    fn drain(&self) -> Vec<Arc<Message>> {
        self.queue.lock().drain(..).collect()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct Slot {
    id: u64,
    mailbox: Arc<Mailbox>,
}

struct Inner {
    subscribers: RwLock<Arc<[Arc<Slot>]>>,
    next_id: AtomicU64,
    mailbox_capacity: usize,
}

impl Inner {
    fn remove(&self, id: u64) {
        let mut subscribers = self.subscribers.write();
        let remaining: Vec<Arc<Slot>> = subscribers
            .iter()
            .filter(|slot| slot.id != id)
            .cloned()
            .collect();
        *subscribers = remaining.into();
    }
}

/// Fan-out message bus. Cheap to clone; clones share subscribers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAILBOX_CAPACITY)
    }

    /// Create a dispatcher whose subscribers buffer up to `mailbox_capacity`
    /// undelivered messages each.
    pub fn with_capacity(mailbox_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(Arc::from(Vec::new())),
                next_id: AtomicU64::new(1),
                mailbox_capacity,
            }),
        }
    }

    /// Publish a message to every live subscriber.
    pub fn publish(&self, message: Message) {
        let message = Arc::new(message);
        let snapshot = self.inner.subscribers.read().clone();
        trace!(id = %message.id, subscribers = snapshot.len(), "publishing message");
        for slot in snapshot.iter() {
            slot.mailbox.push(message.clone());
        }
    }

    /// Attach a subscriber. Messages are delivered in publish order on a
    /// dedicated task; dropping or cancelling the returned handle detaches it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe<F>(&self, on_message: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mailbox = Arc::new(Mailbox::new(self.inner.mailbox_capacity));
        let callback: Callback = Arc::new(on_message);

        tokio::spawn(forward(id, mailbox.clone(), callback));

        {
            let mut subscribers = self.inner.subscribers.write();
            let mut next: Vec<Arc<Slot>> = subscribers.iter().cloned().collect();
            next.push(Arc::new(Slot {
                id,
                mailbox: mailbox.clone(),
            }));
            *subscribers = next.into();
        }
        debug!(subscriber = id, "subscriber attached");

        Subscription {
            id,
            mailbox,
            dispatcher: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

async fn forward(id: u64, mailbox: Arc<Mailbox>, callback: Callback) {
    loop {
        let pending = mailbox.drain();
        if pending.is_empty() {
            if mailbox.is_closed() {
                break;
            }
            mailbox.notify.notified().await;
            continue;
        }
        for message in pending {
            if mailbox.is_closed() {
                break;
            }
            callback(&message);
        }
    }
    let dropped = mailbox.dropped.load(Ordering::Relaxed);
    debug!(subscriber = id, dropped, "subscriber detached");
}

/// Handle for an attached subscriber.
pub struct Subscription {
    id: u64,
    mailbox: Arc<Mailbox>,
    dispatcher: Weak<Inner>,
}

impl Subscription {
    /// Detach the subscriber. Messages still in flight may be discarded.
    pub fn cancel(self) {
        drop(self);
    }

    /// Number of messages discarded because the subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.dispatcher.upgrade() {
            inner.remove(self.id);
        }
        self.mailbox.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_delivers_in_publish_order() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = dispatcher.subscribe(move |m| {
            sink.lock().push(m.progress.map(|p| p.current).unwrap_or_default())
        });

        let base = Message::info("episode").pinned();
        for current in 0..50u64 {
            let mut update = base.clone();
            update.progress = Some(Progress::new(current, 49));
            dispatcher.publish(update);
        }

        wait_until(|| seen.lock().len() == 50).await;
        let seen = seen.lock();
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let dispatcher = Dispatcher::new();
        let a = Arc::new(AtomicU64::new(0));
        let b = Arc::new(AtomicU64::new(0));
        let (ca, cb) = (a.clone(), b.clone());
        let _sa = dispatcher.subscribe(move |_| {
            ca.fetch_add(1, Ordering::SeqCst);
        });
        let _sb = dispatcher.subscribe(move |_| {
            cb.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(dispatcher.subscriber_count(), 2);

        dispatcher.publish(Message::success("done"));
        wait_until(|| a.load(Ordering::SeqCst) == 1 && b.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_cancelled_subscriber_receives_nothing_new() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let sub = dispatcher.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.publish(Message::info("one"));
        wait_until(|| count.load(Ordering::SeqCst) == 1).await;

        sub.cancel();
        assert_eq!(dispatcher.subscriber_count(), 0);
        dispatcher.publish(Message::info("two"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_subscriber_does_not_block_publisher() {
        let dispatcher = Dispatcher::with_capacity(4);
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let gate_rx = std::sync::Mutex::new(gate_rx);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let sub = dispatcher.subscribe(move |m| {
            // Block until the test opens the gate.
            let _ = gate_rx.lock().unwrap().recv();
            sink.lock().push(m.text.clone());
        });

        let started = std::time::Instant::now();
        for i in 0..100 {
            dispatcher.publish(Message::info(format!("m{i}")));
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        for _ in 0..100 {
            let _ = gate_tx.send(());
        }
        wait_until(|| received.lock().last().map(String::as_str) == Some("m99")).await;

        // At most one drained batch plus one full mailbox got through.
        let delivered = received.lock().len() as u64;
        assert!(delivered <= 8);
        assert_eq!(delivered + sub.dropped(), 100);
    }
}
