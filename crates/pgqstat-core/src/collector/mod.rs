//! Query-event collectors.
//!
//! Two interchangeable producers turn PostgreSQL telemetry into `QueryEvent`s:
//!
//! ```text
//! ┌──────────────────────────────┐      ┌──────────────────────────────┐
//! │         LogCollector         │      │      SamplingCollector       │
//! │  glob → FileTailer (per file)│      │  pg_stat_activity snapshots  │
//! │  LineClassifier + pending    │      │  diff against previous tick  │
//! │  Deduplicator                │      │                              │
//! └──────────────┬───────────────┘      └──────────────┬───────────────┘
//!                │ LogSource (trait)                   │ ActivitySource (trait)
//!        ┌───────┴────────┐                            │
//!  ┌─────▼──────┐ ┌───────▼────────┐          ┌────────▼─────────┐
//!  │ FsLogSource│ │PgReadFileSource│          │ PgActivitySource │
//!  └────────────┘ └────────────────┘          └──────────────────┘
//! ```
//!
//! Each collector runs one producer thread that exclusively owns its state
//! and publishes onto two bounded streams (events, errors). The streams
//! close when the producer thread exits.

pub mod error;
pub mod event;
pub mod log_collector;
pub mod sampling;
pub mod stream;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::Receiver;

pub use error::CollectorError;
pub use event::QueryEvent;
pub use log_collector::{LogCollector, LogCollectorConfig};
pub use sampling::{ActiveQuery, ActivitySource, PgActivitySource, SamplingCollector};

/// Granularity of `StopSignal::wait`.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cooperative cancellation flag shared between a collector and its owner.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests every holder of this signal to stop.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration`, waking early if the signal is triggered.
    ///
    /// Returns `true` if the signal was triggered.
    pub fn wait(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            if self.is_stopped() {
                return true;
            }
            let step = remaining.min(STOP_POLL_INTERVAL);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        self.is_stopped()
    }
}

/// A source of query events with its own producer loop.
pub trait QueryCollector: Send {
    /// Stream of finalized query events.
    fn events(&self) -> Receiver<QueryEvent>;

    /// Best-effort diagnostics stream.
    fn errors(&self) -> Receiver<CollectorError>;

    /// Number of events dropped because the event stream was full.
    fn dropped_events(&self) -> Arc<AtomicU64>;

    /// Moves the collector onto its producer thread.
    ///
    /// The thread runs until `stop` is triggered, then closes both streams.
    fn start(self: Box<Self>, stop: StopSignal) -> io::Result<JoinHandle<()>>;
}
