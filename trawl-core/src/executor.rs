use std::{any::Any, sync::Arc};

use anyhow::anyhow;
use futures::FutureExt;
use tokio::{
    sync::{Semaphore, mpsc},
    time::Instant,
};
use tracing::{debug, error, warn};

use crate::{
    cancel::CancelHandle,
    config::Config,
    extractor::Extractor,
    session::Session,
    spawn::NamedTask,
    task::{ExecHandle, SourceResult, Task},
    waitgroup::WaitGroup,
};

/// The worker pool: consumes tasks from the bounded task channel, runs up
/// to `max_tasks` task bodies concurrently, and emits results on the result
/// channel.
///
/// Termination is ownership-driven: every daemon and every queued or
/// running task owns an [`ExecHandle`] (and with it a task-channel sender),
/// so the dispatch loop's `recv` returns `None` exactly when all daemons
/// have closed and the dynamic fan-out of subtasks has quiesced. The result
/// channel closes once the last in-flight body drops its handle.
pub struct Executor {
    session: Arc<Session>,
    global_cancel: CancelHandle,
    handle: ExecHandle,
    task_rx: mpsc::Receiver<Task>,
    semaphore: Arc<Semaphore>,
    subtasks: WaitGroup,
    max_tasks: usize,
}

impl Executor {
    /// Builds the executor and hands back the result stream for the caller
    /// to drain. Results must be drained or producers will block: dropped
    /// results are forbidden, so a slow consumer applies backpressure.
    pub fn new(
        config: &Config,
        session: Arc<Session>,
        extractor: Arc<Extractor>,
        global_cancel: CancelHandle,
    ) -> (Self, mpsc::Receiver<SourceResult>) {
        let max_tasks = config.max_tasks.max(1);
        let buffer = config.task_buffer_size.max(1);
        let (task_tx, task_rx) = mpsc::channel(buffer);
        let (result_tx, result_rx) = mpsc::channel(buffer);
        let handle = ExecHandle::new(task_tx, result_tx, extractor);

        let executor = Self {
            session,
            global_cancel,
            handle,
            task_rx,
            semaphore: Arc::new(Semaphore::new(max_tasks)),
            subtasks: WaitGroup::new(),
            max_tasks,
        };
        (executor, result_rx)
    }

    /// A fresh channel capability for a daemon (or a test driver). Handles
    /// not dropped by the time the input ends will stall termination, so
    /// hand them out deliberately.
    pub fn handle(&self) -> ExecHandle {
        self.handle.clone()
    }

    /// The executor-level count of outstanding subtask promises; daemons
    /// register every task they emit with the subtask flag set.
    pub fn subtask_group(&self) -> WaitGroup {
        self.subtasks.clone()
    }

    /// Consumes the executor and spawns the dispatch loop. The returned
    /// task completes once every source daemon has closed, the task channel
    /// has drained, every running body has finished and the subtask count
    /// is back to zero.
    pub fn start(self) -> NamedTask<()> {
        let Self {
            session,
            global_cancel,
            handle,
            task_rx,
            semaphore,
            subtasks,
            max_tasks,
        } = self;
        // The template handle must die here; otherwise the task channel
        // never closes.
        drop(handle);

        NamedTask::spawn(
            "executor",
            dispatch(
                task_rx,
                semaphore,
                session,
                global_cancel,
                subtasks,
                max_tasks,
            ),
        )
    }
}

async fn dispatch(
    mut task_rx: mpsc::Receiver<Task>,
    semaphore: Arc<Semaphore>,
    session: Arc<Session>,
    global_cancel: CancelHandle,
    subtasks: WaitGroup,
    max_tasks: usize,
) {
    let mut cancel = global_cancel.clone();
    loop {
        // Concurrency gate first: don't pull a task we can't run yet.
        let permit = tokio::select! {
            biased;
            _ = cancel.recv() => break,
            permit = semaphore.clone().acquire_owned() =>
                permit.expect("semaphore never closed"),
        };
        let task = tokio::select! {
            biased;
            _ = cancel.recv() => break,
            maybe_task = task_rx.recv() => match maybe_task {
                Some(task) => task,
                None => break,
            },
        };

        let session = session.clone();
        let global_cancel = global_cancel.clone();
        let name = format!("task-{}", task.opts.source);
        NamedTask::spawn(name, async move {
            // Returning the permit is what marks this body as finished.
            let _permit = permit;
            execute(task, session, global_cancel).await;
        })
        .detach();
    }

    // Queued-but-undispatched tasks are dropped here; their cleanup guards
    // release any subtask promises.
    drop(task_rx);

    // All permits back means no body is still running.
    let permits = u32::try_from(max_tasks).unwrap_or(u32::MAX);
    let _all = semaphore
        .acquire_many_owned(permits)
        .await
        .expect("semaphore never closed");
    subtasks.wait().await;
    debug!("executor quiesced");
}

/// Runs one task body. The cleanup hook is armed as a drop guard before
/// anything else so it fires on every exit path, including unwind.
async fn execute(
    mut task: Task,
    session: Arc<Session>,
    global_cancel: CancelHandle,
) {
    let started = Instant::now();
    let _cleanup = task.cleanup.take();
    let handle = match task.handle.take() {
        Some(handle) => handle,
        None => {
            warn!(
                source = task.opts.source,
                "dropping task that was never submitted through a handle"
            );
            return;
        }
    };
    let domain = task.domain.clone();
    let source = task.opts.source;

    // A buggy source must not bring the process down; panics become error
    // results like any other handler failure.
    let outcome = std::panic::AssertUnwindSafe(execute_inner(
        task,
        &handle,
        &session,
        &global_cancel,
    ))
    .catch_unwind()
    .await;

    if let Err(panic) = outcome {
        let msg = panic_message(panic.as_ref());
        error!(source, "task panicked: {msg}");
        handle
            .error(&domain, source, anyhow!("task panicked: {msg}"))
            .await;
    }

    debug!(source, elapsed = ?started.elapsed(), "task finished");
}

async fn execute_inner(
    task: Task,
    handle: &ExecHandle,
    session: &Session,
    global_cancel: &CancelHandle,
) {
    let domain = task.domain.clone();
    let source = task.opts.source;

    if let Some(bypass) = task.bypass.clone() {
        match bypass(task.clone(), handle.clone()).await {
            Ok(()) => return,
            Err(err) => {
                debug!(
                    source,
                    "bypass failed, falling back to http: {err:#}"
                );
                if task.on_response.is_none() {
                    handle.error(&domain, source, err).await;
                    return;
                }
            }
        }
    }

    let on_response = match task.on_response.clone() {
        Some(on_response) => on_response,
        None => return,
    };

    let response = match session.send(global_cancel, &task.opts).await {
        Ok(response) => response,
        Err(err) => match err.into_response() {
            // Non-success status that still produced a response: the
            // handler screens it itself (e.g. raw-file fetches tolerating
            // 404s).
            Ok(response) => response,
            Err(err) => {
                handle.error(&domain, source, err.into()).await;
                return;
            }
        },
    };

    if let Err(err) = on_response(task, response, handle.clone()).await {
        handle.error(&domain, source, err).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}
