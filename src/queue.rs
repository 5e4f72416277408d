//! Send queue: unbounded concurrent FIFO with wake-on-enqueue.
//!
//! Any number of producers may enqueue; the single consumer is the
//! engine's write loop, which parks on [`SendQueue::wait`] and is woken by
//! the `source_has_more` notification that every push issues. Items from
//! one producer keep their relative order; the engine never reorders.

use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::Notify;

/// One queued outbound item.
#[derive(Debug, Clone)]
pub enum QueueItem {
    /// An encoded packet body awaiting compression/framing.
    Packet {
        /// Command tag, kept for logging and the large-packet policy.
        tag: String,
        /// Serialized body (encoder already applied at enqueue time).
        body: Bytes,
        /// Wire id of the encoder that produced `body`.
        encoder: u8,
    },
    /// Raw bytes written verbatim, bypassing the codec (fault injection).
    Raw(Bytes),
}

/// Unbounded thread-safe FIFO of pending outbound items.
pub struct SendQueue {
    items: Mutex<VecDeque<QueueItem>>,
    notify: Notify,
}

impl SendQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Enqueue an item and wake the write loop.
    pub fn push(&self, item: QueueItem) {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(item);
        self.source_has_more();
    }

    /// Announce pending data to the write loop.
    ///
    /// This is the backpressure signal: an idle writer consumes no CPU
    /// until some producer raises it.
    pub fn source_has_more(&self) {
        self.notify.notify_one();
    }

    /// Non-blocking pop following the original contract:
    /// `(item_or_none, must_start_new_frame, more_pending)`.
    pub fn get_next_packet(&self) -> (Option<QueueItem>, bool, bool) {
        let mut items = self
            .items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let item = items.pop_front();
        let more = !items.is_empty();
        (item, false, more)
    }

    /// Suspend until the next `source_has_more` signal.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Check whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard all queued items (close path: no flush, no delivery
    /// guarantee past this point).
    pub fn discard(&self) {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn packet_item(tag: &str) -> QueueItem {
        QueueItem::Packet {
            tag: tag.to_string(),
            body: Bytes::from_static(b"body"),
            encoder: 1,
        }
    }

    fn tag_of(item: &QueueItem) -> &str {
        match item {
            QueueItem::Packet { tag, .. } => tag,
            QueueItem::Raw(_) => "<raw>",
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = SendQueue::new();
        queue.push(packet_item("a"));
        queue.push(packet_item("b"));
        queue.push(packet_item("c"));

        let (first, _, more) = queue.get_next_packet();
        assert_eq!(tag_of(&first.unwrap()), "a");
        assert!(more);
        let (second, _, more) = queue.get_next_packet();
        assert_eq!(tag_of(&second.unwrap()), "b");
        assert!(more);
        let (third, _, more) = queue.get_next_packet();
        assert_eq!(tag_of(&third.unwrap()), "c");
        assert!(!more);
    }

    #[test]
    fn test_empty_pop() {
        let queue = SendQueue::new();
        let (item, new_frame, more) = queue.get_next_packet();
        assert!(item.is_none());
        assert!(!new_frame);
        assert!(!more);
    }

    #[test]
    fn test_discard() {
        let queue = SendQueue::new();
        queue.push(packet_item("a"));
        queue.push(QueueItem::Raw(Bytes::from_static(b"junk")));
        assert_eq!(queue.len(), 2);

        queue.discard();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_push_wakes_waiter() {
        let queue = Arc::new(SendQueue::new());
        let waiter = queue.clone();

        let handle = tokio::spawn(async move {
            waiter.wait().await;
            let (item, _, _) = waiter.get_next_packet();
            item.unwrap()
        });

        // Give the waiter a chance to park first.
        tokio::task::yield_now().await;
        queue.push(packet_item("wake"));

        let item = handle.await.unwrap();
        assert_eq!(tag_of(&item), "wake");
    }

    #[test]
    fn test_concurrent_producers_preserve_per_producer_order() {
        let queue = Arc::new(SendQueue::new());
        let a = queue.clone();
        let b = queue.clone();

        let ta = std::thread::spawn(move || {
            a.push(packet_item("a1"));
            a.push(packet_item("a2"));
        });
        let tb = std::thread::spawn(move || {
            b.push(packet_item("b1"));
        });
        ta.join().unwrap();
        tb.join().unwrap();

        let mut order = Vec::new();
        while let (Some(item), _, _) = queue.get_next_packet() {
            order.push(tag_of(&item).to_string());
        }
        assert_eq!(order.len(), 3);
        let a1 = order.iter().position(|t| t == "a1").unwrap();
        let a2 = order.iter().position(|t| t == "a2").unwrap();
        assert!(a1 < a2, "a1 must be written before a2: {order:?}");
    }
}
