use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::Notify;

/// Tracks a count of outstanding promises, most commonly subtask promises
/// made by tasks whose response handlers will emit further tasks.
///
/// A daemon [`add`]s one promise per task it emits with the subtask flag
/// set; the task's cleanup hook calls [`done`] when the handler has
/// returned. [`wait`] resolves once the count returns to zero, which is the
/// signal that the fan-out has quiesced and the daemon's output may close.
///
/// Unlike a [`tokio::sync::Barrier`], the count may grow while waiters are
/// parked; [`wait`] only resolves on a zero observed *after* all prior
/// `add`s.
///
/// [`add`]: WaitGroup::add
/// [`done`]: WaitGroup::done
/// [`wait`]: WaitGroup::wait
#[derive(Clone, Debug)]
pub struct WaitGroup {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    count: AtomicU64,
    zero: Notify,
}

impl WaitGroup {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                count: AtomicU64::new(0),
                zero: Notify::new(),
            }),
        }
    }

    /// Register `n` outstanding promises.
    pub fn add(&self, n: u64) {
        self.inner.count.fetch_add(n, Ordering::SeqCst);
    }

    /// Release one promise. Panics if the count would go negative, which
    /// indicates a double-released cleanup hook.
    pub fn done(&self) {
        let prev = self.inner.count.fetch_sub(1, Ordering::SeqCst);
        assert!(prev != 0, "WaitGroup released more times than acquired");
        if prev == 1 {
            self.inner.zero.notify_waiters();
        }
    }

    /// Current number of outstanding promises.
    pub fn count(&self) -> u64 {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Wait until the count reaches zero. Resolves immediately if no
    /// promises are outstanding.
    pub async fn wait(&self) {
        loop {
            // Register as a waiter *before* checking the count; merely
            // creating the future doesn't register it, and `notify_waiters`
            // stores no permit, so a `done` landing between an unregistered
            // check and the await would be lost.
            let notified = self.inner.zero.notified();
            tokio::pin!(notified);
            // An already-pending notification is fine; the count check
            // below decides whether we still need to park.
            let _ = notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}
