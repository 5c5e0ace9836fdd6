use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

struct Inner {
    triggered: AtomicBool,
    // Dropping the only sender wakes every receiver at once.
    wake: Mutex<Option<Sender<()>>>,
    sleeper: Receiver<()>,
}

/// Cooperative stop flag shared by workers and schedulers.
///
/// Sleeping through [`ShutdownSignal::wait_timeout`] returns as soon as the
/// signal is triggered, so a long poll interval never delays shutdown.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                wake: Mutex::new(Some(tx)),
                sleeper: rx,
            }),
        }
    }

    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        let sender = match self.inner.wake.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Sleeps up to `timeout`. Returns true when shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        match self.inner.sleeper.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => self.is_triggered(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
