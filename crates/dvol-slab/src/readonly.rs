//! The read-only bus.
//!
//! Fatal errors are broadcast rather than handled in place: every mutating
//! subsystem holds a cloned notifier, and a single sink drains the events to
//! drive the cascade (reject new mutations, start draining). Entering
//! read-only mode is one-shot and sticky, and is testable by draining the
//! channel.

use dvol_error::DvolError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use tracing::error;

/// One broadcast fatal failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOnlyEvent {
    /// Which subsystem raised it.
    pub source: &'static str,
    /// Rendered error detail.
    pub detail: String,
}

struct Shared {
    read_only: AtomicBool,
    sender: Mutex<Sender<ReadOnlyEvent>>,
}

/// Sender side of the bus, cloned into each mutating subsystem.
#[derive(Clone)]
pub struct ReadOnlyNotifier {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ReadOnlyNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyNotifier")
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

impl ReadOnlyNotifier {
    /// Create a connected notifier/sink pair.
    #[must_use]
    pub fn new() -> (Self, ReadOnlySink) {
        let (sender, receiver) = channel();
        let shared = Arc::new(Shared {
            read_only: AtomicBool::new(false),
            sender: Mutex::new(sender),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            ReadOnlySink { shared, receiver },
        )
    }

    /// Broadcast a fatal error and flip the volume read-only.
    pub fn enter_read_only(&self, source: &'static str, err: &DvolError) {
        let first = !self.shared.read_only.swap(true, Ordering::AcqRel);
        error!(
            target: "dvol::readonly",
            source,
            error = %err,
            first,
            "entering read-only mode"
        );
        // A dropped sink just means nobody is listening; the sticky flag
        // still gates all mutations.
        let _ = self.shared.sender.lock().send(ReadOnlyEvent {
            source,
            detail: err.to_string(),
        });
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.shared.read_only.load(Ordering::Acquire)
    }
}

/// Receiver side: drains broadcast events and drives the cascade.
pub struct ReadOnlySink {
    shared: Arc<Shared>,
    receiver: Receiver<ReadOnlyEvent>,
}

impl ReadOnlySink {
    /// Drain all pending events.
    pub fn drain(&self) -> Vec<ReadOnlyEvent> {
        self.receiver.try_iter().collect()
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.shared.read_only.load(Ordering::Acquire)
    }
}
