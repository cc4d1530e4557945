use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    cancel::CancelHandle,
    task::{Cleanup, ExecHandle, Task},
    waitgroup::WaitGroup,
};

/// Maps an input domain to the source's initial [`Task`]. A callable field
/// stored on the source record, not a method override: providers differ in
/// the task they build, not in daemon behavior.
pub type Dispatcher =
    Box<dyn Fn(&Arc<Source>, &str) -> Task + Send + Sync>;

/// One passive provider: its capability flags, credential ring and
/// dispatcher. The daemon loop below is shared by every source.
pub struct Source {
    /// Canonical lowercase name; also the rate-limit table key.
    pub name: &'static str,
    /// Whether the source participates in the default set.
    pub is_default: bool,
    /// Whether the source accepts subdomains of subdomains, not just root
    /// domains.
    pub recursive: bool,
    /// Whether the source requires an API key.
    pub needs_key: bool,
    pub keys: KeyRing,
    pub dispatch: Dispatcher,
}

impl Source {
    /// True when the source requires keys and none were configured; the
    /// daemon exits before emitting anything.
    pub fn missing_keys(&self) -> bool {
        self.needs_key && self.keys.is_empty()
    }

    pub fn add_keys(&mut self, keys: impl IntoIterator<Item = String>) {
        self.keys.add(keys);
    }

    /// Rotates round-robin through the configured keys, in insertion order.
    pub fn next_key(&self) -> Option<&str> {
        self.keys.next_key()
    }

    /// The per-source daemon: converts input domains into tasks until the
    /// input closes or the source is cancelled.
    ///
    /// Every emitted task gets this daemon's cancel handle; tasks promising
    /// subtasks are registered with the daemon's own wait-group and the
    /// executor's, released by the task's cleanup hook. On input close the
    /// daemon drains outstanding promises before dropping its channel
    /// handle (its "output"); on cancel it drops the handle promptly and
    /// lets already-emitted tasks fail in the session.
    pub async fn daemon(
        self: Arc<Self>,
        mut input: mpsc::Receiver<String>,
        handle: ExecHandle,
        cancel: CancelHandle,
        executor_subtasks: WaitGroup,
    ) {
        if self.missing_keys() {
            debug!(source = self.name, "missing api keys, skipping");
            return;
        }

        let promises = WaitGroup::new();
        let mut cancel_rx = cancel.clone();
        loop {
            tokio::select! {
                biased;
                reason = cancel_rx.recv() => {
                    debug!(source = self.name, ?reason, "cancelled, closing");
                    return;
                }
                maybe_domain = input.recv() => match maybe_domain {
                    Some(domain) => {
                        let mut task = (self.dispatch)(&self, &domain);
                        task.opts.cancel = cancel.clone();
                        if task.has_subtasks {
                            promises.add(1);
                            executor_subtasks.add(1);
                            let promises = promises.clone();
                            let executor_subtasks = executor_subtasks.clone();
                            task.cleanup = Some(Cleanup::new(move || {
                                promises.done();
                                executor_subtasks.done();
                            }));
                        }
                        handle.submit(task).await;
                    }
                    None => break,
                },
            }
        }

        // Input closed: wait out in-flight subtask promises so handlers can
        // still submit through an open channel, unless the source is
        // cancelled in the meantime.
        tokio::select! {
            reason = cancel_rx.recv() => {
                debug!(source = self.name, ?reason, "cancelled while draining");
            }
            () = promises.wait() => {}
        }
        debug!(source = self.name, "closing");
    }
}

/// An ordered credential ring. `next_key` rotates round-robin with ties
/// broken by insertion order.
#[derive(Debug, Default)]
pub struct KeyRing {
    keys: Vec<String>,
    next: AtomicUsize,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, keys: impl IntoIterator<Item = String>) {
        self.keys.extend(keys);
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn next_key(&self) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        Some(self.keys[index % self.keys.len()].as_str())
    }
}

/// Splits a composite `user:pass` credential into its two parts. Returns
/// `None` unless the key has exactly two parts.
pub fn split_multipart_key(key: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = key.split(':').collect();
    match parts[..] {
        [a, b] => Some((a, b)),
        _ => None,
    }
}
