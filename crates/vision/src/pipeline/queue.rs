//! Bounded single-producer/single-consumer queue with a drop-oldest policy,
//! built on a bounded crossbeam channel.
//!
//! A push into a full queue evicts the oldest queued item and hands it back to
//! the producer, so the consumer always sees the freshest items available. The
//! producer may wait up to a configured grace window for the consumer to make
//! room before evicting; a zero window never blocks. Eviction goes through a
//! receiver handle the producer keeps for itself.
//!
//! Dropping the sender closes the queue: the receiver drains what is left and
//! then observes the end. Dropping the receiver makes further pushes fail.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{
    Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError, bounded,
};

/// Producer half of a [`leaky_queue`].
pub struct LeakySender<T> {
    tx: Sender<T>,
    oldest: Receiver<T>,
    grace: Duration,
    evicted: AtomicU64,
    receiver_alive: Arc<AtomicBool>,
}

/// Consumer half of a [`leaky_queue`].
pub struct LeakyReceiver<T> {
    rx: Receiver<T>,
    alive: Arc<AtomicBool>,
}

/// Returned when pushing into a queue whose receiver is gone.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueClosed<T>(pub T);

impl<T> fmt::Display for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue receiver dropped")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopTimeoutError {
    Timeout,
    Closed,
}

/// Creates a leaky queue holding at most `capacity` items (minimum one).
pub fn leaky_queue<T>(capacity: usize, grace: Duration) -> (LeakySender<T>, LeakyReceiver<T>) {
    let (tx, rx) = bounded(capacity.max(1));
    let alive = Arc::new(AtomicBool::new(true));
    (
        LeakySender {
            tx,
            oldest: rx.clone(),
            grace,
            evicted: AtomicU64::new(0),
            receiver_alive: Arc::clone(&alive),
        },
        LeakyReceiver { rx, alive },
    )
}

impl<T> LeakySender<T> {
    /// Enqueues `item`, returning the evicted oldest item if the queue was full.
    pub fn push(&self, item: T) -> Result<Option<T>, QueueClosed<T>> {
        if !self.receiver_alive.load(Ordering::SeqCst) {
            return Err(QueueClosed(item));
        }
        let mut item = match self.offer(item) {
            Ok(()) => return Ok(None),
            Err(item) => item,
        };
        if !self.receiver_alive.load(Ordering::SeqCst) {
            return Err(QueueClosed(item));
        }

        let mut evicted = None;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return Ok(evicted),
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if let Ok(oldest) = self.oldest.try_recv() {
                        self.evicted.fetch_add(1, Ordering::Relaxed);
                        evicted = Some(oldest);
                    }
                }
                Err(TrySendError::Disconnected(back)) => return Err(QueueClosed(back)),
            }
        }
    }

    /// Sends without evicting, waiting up to the grace window for room.
    fn offer(&self, item: T) -> Result<(), T> {
        if self.grace.is_zero() {
            return self.tx.try_send(item).map_err(TrySendError::into_inner);
        }
        self.tx
            .send_timeout(item, self.grace)
            .map_err(SendTimeoutError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Total items evicted since the queue was created.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl<T> LeakyReceiver<T> {
    /// Blocks until an item is available; `None` once the sender is gone and the queue is empty.
    pub fn pop(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Result<T, PopTimeoutError> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => PopTimeoutError::Timeout,
            RecvTimeoutError::Disconnected => PopTimeoutError::Closed,
        })
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> Drop for LeakyReceiver<T> {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use super::*;

    #[test]
    fn keeps_the_most_recent_items_in_order() {
        let (tx, rx) = leaky_queue(2, Duration::ZERO);
        let mut evicted = Vec::new();
        for item in 0..5 {
            if let Some(old) = tx.push(item).unwrap() {
                evicted.push(old);
            }
        }
        assert_eq!(evicted, vec![0, 1, 2]);
        assert_eq!(tx.evicted(), 3);
        drop(tx);
        assert_eq!(rx.pop(), Some(3));
        assert_eq!(rx.pop(), Some(4));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn every_push_beyond_capacity_evicts_exactly_one() {
        let (tx, _rx) = leaky_queue(3, Duration::ZERO);
        for item in 0..3 {
            assert_eq!(tx.push(item).unwrap(), None);
        }
        for item in 3..10 {
            assert_eq!(tx.push(item).unwrap(), Some(item - 3));
            assert_eq!(tx.len(), 3);
        }
    }

    #[test]
    fn grace_window_lets_a_consumer_catch_up() {
        let (tx, rx) = leaky_queue(1, Duration::from_secs(5));
        tx.push(1).unwrap();
        let consumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let first = rx.pop();
            let second = rx.pop();
            (first, second)
        });
        assert_eq!(tx.push(2).unwrap(), None);
        drop(tx);
        assert_eq!(consumer.join().unwrap(), (Some(1), Some(2)));
    }

    #[test]
    fn grace_window_expires_into_eviction() {
        let (tx, _rx) = leaky_queue(1, Duration::from_millis(20));
        tx.push(1).unwrap();
        let started = Instant::now();
        assert_eq!(tx.push(2).unwrap(), Some(1));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn pop_drains_before_reporting_close() {
        let (tx, rx) = leaky_queue(4, Duration::ZERO);
        tx.push("a").unwrap();
        drop(tx);
        assert_eq!(rx.pop_timeout(Duration::from_millis(1)), Ok("a"));
        assert_eq!(
            rx.pop_timeout(Duration::from_millis(1)),
            Err(PopTimeoutError::Closed)
        );
    }

    #[test]
    fn pop_timeout_on_idle_queue() {
        let (_tx, rx) = leaky_queue::<u8>(1, Duration::ZERO);
        assert_eq!(
            rx.pop_timeout(Duration::from_millis(5)),
            Err(PopTimeoutError::Timeout)
        );
    }

    #[test]
    fn push_fails_after_receiver_drops() {
        let (tx, rx) = leaky_queue(1, Duration::ZERO);
        drop(rx);
        assert_eq!(tx.push(7), Err(QueueClosed(7)));
    }

    #[test]
    fn push_into_a_closed_queue_does_not_wait_out_the_grace() {
        let (tx, rx) = leaky_queue(1, Duration::from_secs(5));
        tx.push(1).unwrap();
        drop(rx);
        let started = Instant::now();
        assert_eq!(tx.push(2), Err(QueueClosed(2)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn blocked_consumer_wakes_on_sender_drop() {
        let (tx, rx) = leaky_queue::<u32>(1, Duration::ZERO);
        let consumer = thread::spawn(move || rx.pop());
        thread::sleep(Duration::from_millis(20));
        drop(tx);
        assert_eq!(consumer.join().unwrap(), None);
    }
}
