use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{debug, info};

/// Why the pipeline is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// Operator interrupt or an explicit API request.
    Requested,
    /// A file source reached its natural end.
    EndOfStream,
    SourceFault,
    DetectionFault,
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutdownCause::Requested => "shutdown requested",
            ShutdownCause::EndOfStream => "end of stream",
            ShutdownCause::SourceFault => "source failure",
            ShutdownCause::DetectionFault => "detector failure",
        })
    }
}

struct Inner {
    triggered: AtomicBool,
    cause: Mutex<Option<ShutdownCause>>,
}

/// One-shot cancellation signal shared by every stage.
///
/// Only the first trigger takes effect; later triggers are no-ops. Capture
/// checks the signal between reads; the remaining stages stop when their input
/// queue closes behind it.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("triggered", &self.is_triggered())
            .field("cause", &self.cause())
            .finish()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                cause: Mutex::new(None),
            }),
        }
    }

    /// Fires the signal. Returns `true` only for the call that actually fired it.
    pub fn trigger(&self, cause: ShutdownCause) -> bool {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            debug!(%cause, "shutdown already in progress");
            return false;
        }
        *self
            .inner
            .cause
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(cause);
        info!(%cause, "pipeline shutdown triggered");
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub fn cause(&self) -> Option<ShutdownCause> {
        *self
            .inner
            .cause
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn first_trigger_wins() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        assert!(signal.trigger(ShutdownCause::Requested));
        assert!(!signal.trigger(ShutdownCause::SourceFault));
        assert!(signal.is_triggered());
        assert_eq!(signal.cause(), Some(ShutdownCause::Requested));
    }

    #[test]
    fn concurrent_triggers_fire_once() {
        let signal = ShutdownSignal::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let signal = signal.clone();
                thread::spawn(move || signal.trigger(ShutdownCause::Requested))
            })
            .collect();
        let fired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|fired| *fired)
            .count();
        assert_eq!(fired, 1);
    }
}
