use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
    cancel::CancelHandle, config::Config, executor::Executor,
    source::Source, spawn::NamedTask,
};

/// Owns the roster of source daemons and fans the input-domain stream out
/// to every one of them.
///
/// Sources arrive already configured: keys added, enablement filtering
/// done. Each daemon gets its own cancel handle (so one provider can be
/// stopped without disturbing the others), its own bounded input channel,
/// and a channel capability from the executor. When the caller closes the
/// input, the fan-out ends, the per-daemon inputs close, and each daemon
/// drains and drops its capability; the executor quiesces once the last
/// one is gone.
pub struct Agent {
    sources: Vec<Arc<Source>>,
}

impl Agent {
    pub fn new(sources: Vec<Source>) -> Self {
        Self {
            sources: sources.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn sources(&self) -> &[Arc<Source>] {
        &self.sources
    }

    /// Spawns the fan-out and one daemon per source. The returned tasks
    /// should be joined after the executor finishes.
    pub fn start(
        &self,
        config: &Config,
        executor: &Executor,
        mut input: mpsc::Receiver<String>,
    ) -> Vec<NamedTask<()>> {
        let mut tasks = Vec::with_capacity(self.sources.len() + 1);
        let mut domain_txs = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            let (domain_tx, domain_rx) =
                mpsc::channel(config.input_buffer_size.max(1));
            domain_txs.push(domain_tx);
            tasks.push(NamedTask::spawn(
                format!("daemon-{}", source.name),
                source.clone().daemon(
                    domain_rx,
                    executor.handle(),
                    CancelHandle::new(),
                    executor.subtask_group(),
                ),
            ));
        }

        tasks.push(NamedTask::spawn("input-fanout", async move {
            while let Some(domain) = input.recv().await {
                for domain_tx in &domain_txs {
                    // A cancelled daemon has dropped its receiver; skip it.
                    let _ = domain_tx.send(domain.clone()).await;
                }
            }
        }));

        tasks
    }
}
