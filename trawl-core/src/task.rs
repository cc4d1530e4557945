use std::{any::Any, collections::HashMap, fmt, sync::Arc};

use futures::future::BoxFuture;
use http::Method;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{cancel::CancelHandle, extractor::Extractor};

/// Opaque per-task state, e.g. the current page of a paginated source.
///
/// Metadata is immutable after a task has been emitted; pagination handlers
/// pass updated state to their subtasks via [`Task::with_metadata`], never
/// by mutating the parent's.
pub type Metadata = Arc<dyn Any + Send + Sync>;

/// Invoked with the HTTP response after transport success and status
/// screening. May emit results, emit further tasks (subtasks), or return an
/// error (which becomes an [`ResultKind::Error`] result). Responsible for
/// consuming the response body.
pub type OnResponse = Arc<
    dyn Fn(Task, reqwest::Response, ExecHandle) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// Optional pre-execution callback. When present and returning `Ok`, it
/// *replaces* the HTTP path entirely (used by sources that speak a non-HTTP
/// protocol such as SQL). An `Err` return falls through to the HTTP path.
pub type Bypass = Arc<
    dyn Fn(Task, ExecHandle) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// Credentials for the `Authorization: Basic` header.
#[derive(Clone, Debug, Default)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// HTTP request blueprint carried by a [`Task`].
#[derive(Clone, Debug)]
pub struct RequestOpts {
    pub method: Method,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub cookies: Option<String>,
    pub content_type: Option<String>,
    pub body: Option<Vec<u8>>,
    pub basic_auth: Option<BasicAuth>,
    /// Canonical source label, used for result tagging and rate limiting.
    pub source: &'static str,
    /// Per-credential shard key for rate limiting.
    pub uid: Option<String>,
    /// Stops the originating source's daemon; fired by the session on auth
    /// failure or a severe remote rate limit.
    pub cancel: CancelHandle,
}

impl Default for RequestOpts {
    fn default() -> Self {
        Self {
            method: Method::GET,
            url: String::new(),
            headers: HashMap::new(),
            cookies: None,
            content_type: None,
            body: None,
            basic_auth: None,
            source: "",
            uid: None,
            cancel: CancelHandle::new(),
        }
    }
}

/// A deferred hook guaranteed to run exactly once on every task exit path,
/// including panic unwind: the executor holds it across the task body and
/// the hook fires on drop.
pub struct Cleanup(Option<Box<dyn FnOnce() + Send + Sync>>);

impl Cleanup {
    pub fn new(hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(hook)))
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if let Some(hook) = self.0.take() {
            hook();
        }
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cleanup(..)")
    }
}

/// The unit of work: a request blueprint bundled with its response handler,
/// created by a source dispatcher and consumed by exactly one worker.
pub struct Task {
    /// The apex domain this task belongs to.
    pub domain: String,
    pub opts: RequestOpts,
    pub on_response: Option<OnResponse>,
    pub bypass: Option<Bypass>,
    /// When true, the task promises to emit further tasks before it is
    /// logically complete; the daemon arms `cleanup` to release the promise.
    pub has_subtasks: bool,
    pub metadata: Option<Metadata>,
    pub(crate) cleanup: Option<Cleanup>,
    pub(crate) handle: Option<ExecHandle>,
}

impl Task {
    pub fn new(domain: impl Into<String>, opts: RequestOpts) -> Self {
        Self {
            domain: domain.into(),
            opts,
            on_response: None,
            bypass: None,
            has_subtasks: false,
            metadata: None,
            cleanup: None,
            handle: None,
        }
    }

    /// Attach opaque state for the handler of this task (or its subtasks).
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Downcast this task's metadata to a concrete type.
    pub fn metadata<T: 'static>(&self) -> Option<&T> {
        self.metadata.as_deref().and_then(|m| m.downcast_ref())
    }
}

/// Cloning yields a subtask template: domain, request blueprint and
/// handlers are preserved (mutating the clone's `opts` does not touch the
/// parent's), while the subtask promise, cleanup hook and channel handle
/// deliberately are not - a clone makes no promise of its own and receives
/// a handle when it is submitted.
impl Clone for Task {
    fn clone(&self) -> Self {
        Self {
            domain: self.domain.clone(),
            opts: self.opts.clone(),
            on_response: self.on_response.clone(),
            bypass: self.bypass.clone(),
            has_subtasks: false,
            metadata: None,
            cleanup: None,
            handle: None,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("domain", &self.domain)
            .field("source", &self.opts.source)
            .field("url", &self.opts.url)
            .field("has_subtasks", &self.has_subtasks)
            .finish_non_exhaustive()
    }
}

/// A discovery (or failure) reported by a source for one input domain.
#[derive(Debug)]
pub struct SourceResult {
    pub input: String,
    pub source: &'static str,
    pub kind: ResultKind,
}

#[derive(Debug)]
pub enum ResultKind {
    /// The raw hostname as discovered; normalization (lowercasing, `*.`
    /// stripping) is the consumer's job.
    Subdomain(String),
    Error(anyhow::Error),
}

/// A task's capability surface: submit subtasks, emit results, and match
/// against the shared extractor.
///
/// Handle lifetime doubles as liveness accounting: daemons and in-flight
/// tasks each own a clone, so the task and result channels close exactly
/// when every daemon has finished and no task is queued or running.
#[derive(Clone)]
pub struct ExecHandle {
    tasks: mpsc::Sender<Task>,
    results: mpsc::Sender<SourceResult>,
    pub extractor: Arc<Extractor>,
}

impl ExecHandle {
    pub(crate) fn new(
        tasks: mpsc::Sender<Task>,
        results: mpsc::Sender<SourceResult>,
        extractor: Arc<Extractor>,
    ) -> Self {
        Self {
            tasks,
            results,
            extractor,
        }
    }

    /// Queue a task (or subtask) for execution. Blocks when the task
    /// channel is full; this backpressure is what keeps one fast source
    /// from starving memory.
    pub async fn submit(&self, mut task: Task) {
        task.handle = Some(self.clone());
        if self.tasks.send(task).await.is_err() {
            debug!("task channel closed; dropping task");
        }
    }

    /// Emit a discovered hostname.
    pub async fn subdomain(
        &self,
        input: &str,
        source: &'static str,
        value: impl Into<String>,
    ) {
        self.emit(SourceResult {
            input: input.to_owned(),
            source,
            kind: ResultKind::Subdomain(value.into()),
        })
        .await;
    }

    /// Emit a source failure.
    pub async fn error(
        &self,
        input: &str,
        source: &'static str,
        err: anyhow::Error,
    ) {
        self.emit(SourceResult {
            input: input.to_owned(),
            source,
            kind: ResultKind::Error(err),
        })
        .await;
    }

    async fn emit(&self, result: SourceResult) {
        // Dropped results are forbidden; a closed receiver means the run is
        // unwinding, in which case losing the result is the intent.
        if self.results.send(result).await.is_err() {
            debug!("result channel closed; dropping result");
        }
    }
}
