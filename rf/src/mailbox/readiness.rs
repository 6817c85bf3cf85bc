//! Readiness flags: level-triggered booleans with one producer and one consumer

use tokio::sync::watch;
use tracing::debug;

/// Error returned when the producing side of a flag has gone away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateClosed;

impl std::fmt::Display for GateClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "readiness flag producer dropped")
    }
}

impl std::error::Error for GateClosed {}

/// Create a cleared flag, returning its producer and consumer halves
pub fn readiness_flag() -> (ReadinessSetter, ReadinessGate) {
    let (tx, rx) = watch::channel(false);
    (ReadinessSetter { tx }, ReadinessGate { rx })
}

/// Producer half; owned by the demultiplexer route for a status-class topic
#[derive(Debug)]
pub struct ReadinessSetter {
    tx: watch::Sender<bool>,
}

impl ReadinessSetter {
    /// Set or clear the flag
    ///
    /// Returns true if the value changed. Repeating the current value does
    /// not wake the consumer.
    pub fn update(&self, value: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
        debug!(value, changed, "ReadinessSetter::update");
        changed
    }

    pub fn set(&self) -> bool {
        self.update(true)
    }

    pub fn clear(&self) -> bool {
        self.update(false)
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Consumer half; not cloneable, so exactly one task waits on a flag
#[derive(Debug)]
pub struct ReadinessGate {
    rx: watch::Receiver<bool>,
}

impl ReadinessGate {
    /// Current value
    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the flag is set; returns immediately if it already is
    pub async fn wait(&mut self) -> Result<(), GateClosed> {
        self.wait_for(true).await
    }

    /// Wait until the flag is cleared; returns immediately if it already is
    pub async fn wait_cleared(&mut self) -> Result<(), GateClosed> {
        self.wait_for(false).await
    }

    async fn wait_for(&mut self, value: bool) -> Result<(), GateClosed> {
        self.rx.wait_for(|v| *v == value).await.map(|_| ()).map_err(|_| GateClosed)
    }

    /// Wait for the next transition and return the new value
    pub async fn changed(&mut self) -> Result<bool, GateClosed> {
        self.rx.changed().await.map_err(|_| GateClosed)?;
        Ok(*self.rx.borrow_and_update())
    }

    /// Check whether a transition happened that has not been observed yet
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }
}
