//! Bounded in-memory spillover for ingestion payloads that failed to send.
use std::collections::VecDeque;

use crate::{transport::Transport, Result};

/// Holds payloads that could not be delivered and retries them after the next successful send.
///
/// Memory is bounded by the total byte length of queued payloads. When a new failure does not
/// fit, the oldest payloads are evicted first; a payload larger than the whole budget is dropped.
#[derive(Debug)]
pub struct RetryQueue {
    queue: VecDeque<String>,
    memory_size: usize,
    max_memory_size: usize,
}

impl Default for RetryQueue {
    fn default() -> Self {
        RetryQueue::new(RetryQueue::DEFAULT_MAX_MEMORY_SIZE)
    }
}

impl RetryQueue {
    /// Default memory budget (200 MB).
    pub const DEFAULT_MAX_MEMORY_SIZE: usize = 200_000_000;

    pub fn new(max_memory_size: usize) -> Self {
        RetryQueue {
            queue: VecDeque::new(),
            memory_size: 0,
            max_memory_size,
        }
    }

    /// Change the memory budget. Already queued payloads are only evicted by the next failure.
    pub fn set_max_memory(&mut self, bytes: usize) {
        self.max_memory_size = bytes;
    }

    /// Number of queued payloads.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total byte length of queued payloads.
    pub fn memory_size(&self) -> usize {
        self.memory_size
    }

    /// Try to send `payload`. On success, drain previously queued payloads oldest-first, stopping
    /// at the first renewed failure. On failure, queue `payload` and return the transport error.
    pub async fn send<T: Transport>(
        &mut self,
        url: &str,
        payload: String,
        transport: &T,
    ) -> Result<()> {
        match transport.send(url, payload.clone()).await {
            Ok(()) => {
                self.drain(url, transport).await;
                Ok(())
            }
            Err(err) => {
                log::debug!(target: "flagger", url; "failed to send payload, queueing for retry: {}", err);
                self.enqueue(payload);
                Err(err)
            }
        }
    }

    async fn drain<T: Transport>(&mut self, url: &str, transport: &T) {
        while let Some(payload) = self.queue.front() {
            if let Err(err) = transport.send(url, payload.clone()).await {
                log::debug!(target: "flagger", url, queued = self.queue.len(); "retry failed: {}", err);
                return;
            }
            if let Some(sent) = self.queue.pop_front() {
                self.memory_size -= sent.len();
            }
        }
    }

    fn enqueue(&mut self, payload: String) {
        let size = payload.len();
        if size > self.max_memory_size {
            log::warn!(target: "flagger",
                       size,
                       max_memory_size = self.max_memory_size;
                       "payload exceeds retry memory budget, dropping it");
            return;
        }

        while self.memory_size + size > self.max_memory_size {
            let Some(evicted) = self.queue.pop_front() else {
                break;
            };
            self.memory_size -= evicted.len();
            log::warn!(target: "flagger", size = evicted.len(); "retry queue is full, dropping oldest payload");
        }

        self.memory_size += size;
        self.queue.push_back(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::RetryQueue;
    use crate::transport::MockTransport;

    #[tokio::test]
    async fn queues_failures_and_drains_after_success() {
        let transport = MockTransport::default();
        let mut queue = RetryQueue::default();

        transport.set_failing(true);
        assert!(queue.send("url", "{}".to_owned(), &transport).await.is_err());
        assert_eq!(queue.len(), 1);
        assert!(queue.send("url", "[]".to_owned(), &transport).await.is_err());
        assert_eq!(queue.len(), 2);

        transport.set_failing(false);
        assert!(queue.send("url", "\"ok\"".to_owned(), &transport).await.is_ok());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.memory_size(), 0);
        assert_eq!(transport.sent_bodies(), vec!["\"ok\"", "{}", "[]"]);
    }

    #[tokio::test]
    async fn drops_payload_larger_than_budget() {
        let transport = MockTransport::default();
        transport.set_failing(true);
        let mut queue = RetryQueue::new(0);

        let _ = queue.send("url", "{}".to_owned(), &transport).await;

        assert_eq!(queue.len(), 0);
        assert_eq!(queue.memory_size(), 0);
    }

    #[tokio::test]
    async fn oversized_payload_does_not_evict_others() {
        let transport = MockTransport::default();
        transport.set_failing(true);
        let mut queue = RetryQueue::new(8);

        let _ = queue.send("url", "\"a\"".to_owned(), &transport).await;
        let _ = queue.send("url", "\"too long\"".to_owned(), &transport).await;

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.memory_size(), 3);
    }

    #[tokio::test]
    async fn evicts_oldest_when_full() {
        let transport = MockTransport::default();
        transport.set_failing(true);
        let mut queue = RetryQueue::new(7);

        let _ = queue.send("url", "\"test\"".to_owned(), &transport).await;
        assert_eq!(queue.len(), 1);

        let _ = queue.send("url", "\"tes\"".to_owned(), &transport).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.memory_size(), 5);

        transport.set_failing(false);
        let _ = queue.send("url", "1".to_owned(), &transport).await;
        assert_eq!(transport.sent_bodies(), vec!["1", "\"tes\""]);
    }

    #[tokio::test]
    async fn stops_draining_at_first_failure() {
        let transport = MockTransport::default();
        transport.set_failing(true);
        let mut queue = RetryQueue::default();
        for body in ["1", "2", "3"] {
            let _ = queue.send("url", body.to_owned(), &transport).await;
        }
        assert_eq!(queue.len(), 3);

        let flaky = move |_url: String, body: String| async move {
            if body == "2" {
                Err(crate::Error::transport("flaky"))
            } else {
                Ok(())
            }
        };
        assert!(queue.send("url", "4".to_owned(), &flaky).await.is_ok());

        // "1" drained, "2" failed again and stays at the front
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.memory_size(), 2);
    }
}
