/// A validated remote command waiting for rate-limited application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedCommand {
    pub pin: i32,
    pub desired_state: bool,
    pub enqueued_at_ms: u64,
}

/// Bounded FIFO absorbing inbound remote commands so relay actuation cannot
/// be flooded. Overflow rejects the newest entry; the queue never grows and
/// never blocks.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    slots: Vec<QueuedCommand>,
    capacity: usize,
    dropped: u64,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Commands rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Returns false when the command was rejected (queue full).
    pub fn enqueue(&mut self, pin: i32, desired_state: bool, now_ms: u64) -> bool {
        if self.slots.len() >= self.capacity {
            self.dropped += 1;
            return false;
        }
        self.slots.push(QueuedCommand {
            pin,
            desired_state,
            enqueued_at_ms: now_ms,
        });
        true
    }

    /// Removes up to `max` commands in FIFO order. Called once per tick with
    /// the configured per-tick budget.
    pub fn dequeue_batch(&mut self, max: usize) -> Vec<QueuedCommand> {
        let take = max.min(self.slots.len());
        self.slots.drain(..take).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn preserves_fifo_order() {
        let mut queue = CommandQueue::new(16);
        for pin in 0..5 {
            assert!(queue.enqueue(pin, true, 100));
        }

        let batch = queue.dequeue_batch(3);
        let pins: Vec<i32> = batch.iter().map(|c| c.pin).collect();
        assert_eq!(pins, vec![0, 1, 2]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn rejects_newest_when_full() {
        let mut queue = CommandQueue::new(2);
        assert!(queue.enqueue(1, true, 0));
        assert!(queue.enqueue(2, true, 0));
        assert!(!queue.enqueue(3, true, 0));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        let pins: Vec<i32> = queue.dequeue_batch(8).iter().map(|c| c.pin).collect();
        assert_eq!(pins, vec![1, 2]);
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut queue = CommandQueue::new(16);
        for i in 0..100 {
            queue.enqueue(i, false, 0);
            assert!(queue.len() <= 16);
        }
        assert_eq!(queue.dropped(), 84);
    }

    #[test]
    fn dequeue_is_rate_limited_by_caller_budget() {
        let mut queue = CommandQueue::new(16);
        for i in 0..12 {
            queue.enqueue(i, true, 0);
        }

        assert_eq!(queue.dequeue_batch(5).len(), 5);
        assert_eq!(queue.dequeue_batch(5).len(), 5);
        assert_eq!(queue.dequeue_batch(5).len(), 2);
        assert!(queue.is_empty());
    }
}
