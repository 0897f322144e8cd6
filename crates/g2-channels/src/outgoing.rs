//! FIFO delivery queue for outbound messages (§4.11). A message stays at the
//! head of the queue until its send succeeds, so a transport outage backs up
//! delivery instead of reordering or dropping messages.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use g2_core::domain::Jid;

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub jid: Jid,
    pub text: String,
}

/// Single-flush-at-a-time outbound queue. `flush` is safe to call concurrently;
/// a flush already in progress causes later callers to return immediately.
pub struct OutgoingMessageQueue {
    queue: Mutex<VecDeque<OutgoingMessage>>,
    flushing: AtomicBool,
}

impl Default for OutgoingMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OutgoingMessageQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
        }
    }

    pub fn enqueue(&self, jid: Jid, text: impl Into<String>) {
        self.queue.lock().unwrap().push_back(OutgoingMessage {
            jid,
            text: text.into(),
        });
    }

    pub fn size(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Drains the queue in order, calling `send` for each message. The message
    /// is popped only after `send` returns `Ok`; an `Err` halts the flush and
    /// leaves the failed message at the head for the next attempt.
    pub async fn flush<F, Fut, E>(&self, mut send: F) -> Result<(), E>
    where
        F: FnMut(OutgoingMessage) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let result = self.flush_inner(&mut send).await;
        self.flushing.store(false, Ordering::SeqCst);
        result
    }

    async fn flush_inner<F, Fut, E>(&self, send: &mut F) -> Result<(), E>
    where
        F: FnMut(OutgoingMessage) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        loop {
            let next = { self.queue.lock().unwrap().front().cloned() };
            let Some(message) = next else {
                return Ok(());
            };
            send(message).await?;
            self.queue.lock().unwrap().pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn flush_drains_in_fifo_order() {
        let q = OutgoingMessageQueue::new();
        q.enqueue(Jid("a@loop".into()), "one");
        q.enqueue(Jid("b@loop".into()), "two");

        let seen: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let result: Result<(), String> = q
            .flush(|m| {
                seen.lock().unwrap().push(m.text.clone());
                async move { Ok(()) }
            })
            .await;

        assert!(result.is_ok());
        assert!(q.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn failed_send_leaves_message_at_head() {
        let q = OutgoingMessageQueue::new();
        q.enqueue(Jid("a@loop".into()), "one");
        q.enqueue(Jid("b@loop".into()), "two");

        let attempts = AtomicUsize::new(0);
        let result: Result<(), &'static str> = q
            .flush(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move { Err("boom") }
            })
            .await;

        assert_eq!(result, Err("boom"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(q.size(), 2);
    }

    #[tokio::test]
    async fn reentrant_flush_returns_immediately() {
        let q = OutgoingMessageQueue::new();
        q.enqueue(Jid("a@loop".into()), "one");

        // Simulate an in-progress flush by flipping the flag directly.
        q.flushing.store(true, Ordering::SeqCst);
        let result: Result<(), String> = q.flush(|_| async move { Ok(()) }).await;
        assert!(result.is_ok());
        assert_eq!(q.size(), 1, "message must not be drained by the re-entrant call");
    }
}
