//! # Worker Pool
//!
//! Supervises the long-lived delivery tasks: `worker_count` dispatch
//! workers plus the queue mover and the lease reclaimer. A task that exits
//! (or panics) while the pool is running is restarted; cancelling the
//! shutdown token stops every task and waits for in-flight deliveries.

use std::collections::HashMap;
use std::fmt;

use tokio::task::{Id, JoinSet};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::Engine;
use crate::scheduler::QueueMaintenance;
use crate::worker::DeliveryWorker;

/// Pause before a crashed task is started again.
const RESTART_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskKind {
    Worker(usize),
    Mover,
    Reclaimer,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Worker(index) => write!(f, "worker-{index}"),
            TaskKind::Mover => f.write_str("mover"),
            TaskKind::Reclaimer => f.write_str("reclaimer"),
        }
    }
}

pub struct WorkerPool {
    engine: Engine,
    instance: String,
}

impl WorkerPool {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            instance: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
        }
    }

    /// Prefix for consumer names, distinguishing processes sharing a queue.
    pub fn with_instance_name(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let worker_count = self.engine.config.worker_count;
        info!(instance = %self.instance, workers = worker_count, "Starting delivery worker pool");

        let mut tasks = JoinSet::new();
        let mut kinds: HashMap<Id, TaskKind> = HashMap::new();

        for index in 0..worker_count {
            self.spawn(&mut tasks, &mut kinds, TaskKind::Worker(index), &shutdown);
        }
        self.spawn(&mut tasks, &mut kinds, TaskKind::Mover, &shutdown);
        self.spawn(&mut tasks, &mut kinds, TaskKind::Reclaimer, &shutdown);

        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, panicked) = match joined {
                Ok((id, ())) => (id, false),
                Err(err) => (err.id(), err.is_panic()),
            };
            let Some(kind) = kinds.remove(&id) else {
                continue;
            };

            if shutdown.is_cancelled() {
                continue;
            }

            if panicked {
                error!(task = %kind, "Pool task panicked; restarting");
            } else {
                warn!(task = %kind, "Pool task exited unexpectedly; restarting");
            }
            self.engine.metrics.queue_error("task_restart");

            tokio::select! {
                _ = shutdown.cancelled() => continue,
                _ = sleep(RESTART_DELAY) => {}
            }
            self.spawn(&mut tasks, &mut kinds, kind, &shutdown);
        }

        info!(instance = %self.instance, "Delivery worker pool stopped");
    }

    fn spawn(
        &self,
        tasks: &mut JoinSet<()>,
        kinds: &mut HashMap<Id, TaskKind>,
        kind: TaskKind,
        shutdown: &CancellationToken,
    ) {
        let token = shutdown.clone();
        let handle = match &kind {
            TaskKind::Worker(index) => {
                let worker = DeliveryWorker::new(
                    self.engine.clone(),
                    format!("{}-worker-{index}", self.instance),
                );
                tasks.spawn(worker.run(token))
            }
            TaskKind::Mover => {
                tasks.spawn(QueueMaintenance::new(self.engine.clone()).run_mover(token))
            }
            TaskKind::Reclaimer => {
                tasks.spawn(QueueMaintenance::new(self.engine.clone()).run_reclaimer(token))
            }
        };
        kinds.insert(handle.id(), kind);
    }
}
