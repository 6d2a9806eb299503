//! Deadline-bound single-settlement promises.
//!
//! [`pair`] returns a [`Settler`] and a [`DeadlineFuture`]. The settler may be
//! cloned and handed to whichever task eventually produces the outcome; the
//! future yields that outcome, or [`DeadlineError::TimedOut`] once the
//! deadline passes. Only the first settlement counts.
//!
//! The clock starts when the pair is created, not when the future is first
//! awaited, so work done between the two counts against the deadline.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Deadline applied when callers do not pick one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Reasons a [`DeadlineFuture`] completes without a value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeadlineError<E> {
    /// The deadline elapsed before anyone settled.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// A settler rejected the promise.
    #[error("rejected")]
    Rejected(E),

    /// Every settler was dropped without settling.
    #[error("abandoned before settlement")]
    Abandoned,
}

impl<E> DeadlineError<E> {
    /// Whether this error is the deadline elapsing.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }
}

type Slot<T, E> = Arc<Mutex<Option<oneshot::Sender<Result<T, E>>>>>;

/// Settling half of a deadline pair.
pub struct Settler<T, E> {
    slot: Slot<T, E>,
}

impl<T, E> Clone for Settler<T, E> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T, E> std::fmt::Debug for Settler<T, E> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Settler")
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<T, E> Settler<T, E> {
    /// Settles with a value. Returns `false` when already settled or timed out.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settles with an error. Returns `false` when already settled or timed out.
    pub fn reject(&self, error: E) -> bool {
        self.settle(Err(error))
    }

    /// Whether the promise has already been settled or has timed out.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.slot.lock().is_none()
    }

    fn settle(&self, outcome: Result<T, E>) -> bool {
        let Some(sender) = self.slot.lock().take() else {
            return false;
        };
        // The settlement counts as the first one even with the waiter gone.
        if sender.send(outcome).is_err() {
            tracing::trace!("deadline waiter dropped before settlement");
        }
        true
    }
}

/// Waiting half of a deadline pair.
#[derive(Debug)]
pub struct DeadlineFuture<T, E> {
    receiver: oneshot::Receiver<Result<T, E>>,
    slot: Weak<Mutex<Option<oneshot::Sender<Result<T, E>>>>>,
    timeout: Duration,
    deadline: Instant,
}

impl<T, E> DeadlineFuture<T, E> {
    /// Configured deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Instant at which the promise times out.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Waits for settlement or the deadline, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadlineError::Rejected`] when a settler rejected,
    /// [`DeadlineError::TimedOut`] when the deadline passed first and
    /// [`DeadlineError::Abandoned`] when every settler was dropped.
    pub async fn wait(mut self) -> Result<T, DeadlineError<E>> {
        match tokio::time::timeout_at(self.deadline, &mut self.receiver).await {
            Ok(Ok(outcome)) => outcome.map_err(DeadlineError::Rejected),
            Ok(Err(_)) => Err(DeadlineError::Abandoned),
            Err(_) => {
                let closed = self
                    .slot
                    .upgrade()
                    .is_some_and(|slot| slot.lock().take().is_some());
                if closed {
                    return Err(DeadlineError::TimedOut(self.timeout));
                }
                // A settler won the race against the timer.
                match self.receiver.try_recv() {
                    Ok(outcome) => outcome.map_err(DeadlineError::Rejected),
                    Err(_) => Err(DeadlineError::TimedOut(self.timeout)),
                }
            }
        }
    }
}

/// Creates a settler and future that times out `timeout` from now.
#[must_use]
pub fn pair<T, E>(timeout: Duration) -> (Settler<T, E>, DeadlineFuture<T, E>) {
    let (sender, receiver) = oneshot::channel();
    let slot = Arc::new(Mutex::new(Some(sender)));
    let future = DeadlineFuture {
        receiver,
        slot: Arc::downgrade(&slot),
        timeout,
        deadline: Instant::now() + timeout,
    };
    (Settler { slot }, future)
}
