//! Bounded, lossy event streams.
//!
//! Producers never block: when the stream is full the item is dropped and
//! counted. Blocking would stall offset advancement for the file being read.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

/// Sending half of a bounded stream with drop-on-full semantics.
pub struct Publisher<T> {
    tx: Sender<T>,
    dropped: Arc<AtomicU64>,
    label: &'static str,
    quiet: bool,
}

/// Creates a bounded stream of `capacity` items.
pub fn bounded<T>(capacity: usize, label: &'static str) -> (Publisher<T>, Receiver<T>) {
    let (tx, rx) = channel::bounded(capacity);
    let publisher = Publisher {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
        label,
        quiet: false,
    };
    (publisher, rx)
}

impl<T> Publisher<T> {
    /// Drops on a full stream are logged at debug level instead of warn.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Tries to enqueue `item`. Returns `false` if it was dropped.
    pub fn publish(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if self.quiet {
                    debug!(stream = self.label, dropped = total, "stream full, dropping item");
                } else {
                    warn!(stream = self.label, dropped = total, "stream full, dropping item");
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Shared counter of items dropped because the stream was full.
    pub fn drop_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_drops_when_full() {
        let (publisher, rx) = bounded::<u32>(2, "test");
        assert!(publisher.publish(1));
        assert!(publisher.publish(2));
        assert!(!publisher.publish(3));
        assert_eq!(publisher.drop_counter().load(Ordering::Relaxed), 1);

        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropping_publisher_closes_stream() {
        let (publisher, rx) = bounded::<u32>(4, "test");
        publisher.publish(7);
        drop(publisher);
        assert_eq!(rx.iter().collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn test_disconnected_receiver_is_not_counted_as_drop() {
        let (publisher, rx) = bounded::<u32>(1, "test");
        drop(rx);
        assert!(!publisher.publish(1));
        assert_eq!(publisher.drop_counter().load(Ordering::Relaxed), 0);
    }
}
