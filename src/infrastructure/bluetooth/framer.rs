//! Outbound chunk queue.
//!
//! Messages are encoded into wrapped chunks up front and drained one write at
//! a time. The watch has no flow control, so consecutive writes are spaced by
//! a fixed delay instead of waiting for acknowledgments.

use crate::infrastructure::bluetooth::protocol;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct PendingMessage {
    writes: Vec<Vec<u8>>,
    cursor: usize,
}

pub struct OutboundFramer {
    chunk_size: usize,
    chunk_delay: Duration,
    queue: VecDeque<PendingMessage>,
    ready_at: Instant,
}

impl OutboundFramer {
    pub fn new(chunk_size: usize, chunk_delay: Duration) -> Self {
        Self {
            chunk_size,
            chunk_delay,
            queue: VecDeque::new(),
            ready_at: Instant::now(),
        }
    }

    /// Queue a message behind everything already queued. Returns its chunk count.
    pub fn enqueue(&mut self, message: &str) -> usize {
        let writes = protocol::encode_message(message, self.chunk_size);
        let count = writes.len();
        debug!("Queued message as {} chunk(s)", count);
        self.queue.push_back(PendingMessage { writes, cursor: 0 });
        count
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// When the next write may go out, if anything is queued.
    pub fn deadline(&self) -> Option<Instant> {
        (!self.is_idle()).then_some(self.ready_at)
    }

    /// Take the next write if the inter-chunk delay has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<Vec<u8>> {
        if now < self.ready_at {
            return None;
        }
        let message = self.queue.front_mut()?;
        let write = std::mem::take(&mut message.writes[message.cursor]);
        message.cursor += 1;
        if message.cursor == message.writes.len() {
            self.queue.pop_front();
        }
        self.ready_at = now + self.chunk_delay;
        Some(write)
    }

    /// Drop everything queued. Returns the number of messages lost.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }
}
