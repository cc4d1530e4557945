use std::sync::{Arc, OnceLock};

use tokio::sync::Semaphore;

/// Why a cancellation fired. Recorded by the first [`CancelHandle::cancel`]
/// caller and reported to every receiver, so a closing daemon can say
/// whether its provider rejected credentials, throttled us off, or the
/// whole run was stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// The provider rejected our credentials (401/403).
    AuthFailed,
    /// The provider signalled a rate limit too severe to wait out.
    RateLimited,
    /// The operator (ctrl-c) or an enclosing scope stopped the work.
    Interrupted,
}

/// A one-shot cancellation signal with an attached [`CancelReason`].
///
/// The same type drives both cancellation planes: every source daemon gets
/// its own handle (threaded through each task's request options so the
/// session can fire it on auth failure or severe throttling), and one
/// process-wide handle backs ctrl-c.
///
/// - Multi-producer and multi-consumer - simply clone to get another
///   handle.
/// - The first [`cancel`] wins: racing causes (e.g. a 401 and a 429 from
///   parallel workers) record a single reason, and later calls are
///   harmless no-ops.
/// - Every clone observes the signal at-most-once via [`recv`]; select
///   loops rely on this to react to a cancellation exactly once.
/// - Consumers can observe a signal that was fired before they subscribed.
///
/// Wakeup rides on a zero-permit [`Semaphore`]: firing the signal closes
/// the semaphore, and a waiter's failed [`acquire`] is its notification.
/// The reason is recorded before the close, so a woken waiter always finds
/// it.
///
/// [`cancel`]: CancelHandle::cancel
/// [`recv`]: CancelHandle::recv
/// [`acquire`]: Semaphore::acquire
#[derive(Debug)]
pub struct CancelHandle {
    inner: Arc<Inner>,
    have_recved: bool,
}

#[derive(Debug)]
struct Inner {
    reason: OnceLock<CancelReason>,
    closed: Semaphore,
}

impl CancelHandle {
    /// Construct a new, unfired [`CancelHandle`].
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                reason: OnceLock::new(),
                closed: Semaphore::new(0),
            }),
            have_recved: false,
        }
    }

    /// Fire the signal, causing all actors waiting on this channel to
    /// complete their call to [`recv`]. The first caller's `reason` is the
    /// one recorded.
    ///
    /// [`recv`]: CancelHandle::recv
    pub fn cancel(&self, reason: CancelReason) {
        // Record before closing so no receiver wakes to find it missing.
        let _ = self.inner.reason.set(reason);
        self.inner.closed.close();
    }

    /// Wait for the signal and learn why it fired.
    ///
    /// NOTE: If this `CancelHandle` has already observed the signal,
    /// _this future will never return!_
    pub async fn recv(&mut self) -> CancelReason {
        if self.have_recved {
            // A second observation through the same handle never resolves;
            // select loops rely on this to react to a cancellation only
            // once.
            std::future::pending().await
        } else {
            self.inner
                .closed
                .acquire()
                .await
                .map_err(|_| ())
                .expect_err("Shouldn't've been able to acquire a permit");
            // we've seen the signal; if this method gets called again
            // through this handle, it won't yield.
            self.have_recved = true;
            self.reason().unwrap_or(CancelReason::Interrupted)
        }
    }

    /// Immediately returns whether the signal has been fired.
    /// This bypasses the at-most-once logic; calling this function will NOT
    /// consume the signal for a later call to [`recv`](Self::recv).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.closed.is_closed()
    }

    /// The recorded reason, if the signal has fired.
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.reason.get().copied()
    }
}

impl Clone for CancelHandle {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            // Every clone gets a chance to see the signal, even if the
            // original has already seen it.
            have_recved: false,
        }
    }
}
