//! Worker pools that drain the stage queues.

use crate::models::Stage;
use crate::orchestrator::Pipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CONSUME_RETRY_DELAY: Duration = Duration::from_millis(250);

pub struct WorkerPool {
    pipeline: Arc<Pipeline>,
    workers_per_stage: usize,
}

impl WorkerPool {
    /// Uses the pipeline's configured concurrency per stage.
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let workers_per_stage = pipeline.options().workers_per_stage;
        Self {
            pipeline,
            workers_per_stage,
        }
    }

    pub fn with_workers_per_stage(mut self, workers: usize) -> Self {
        self.workers_per_stage = workers;
        self
    }

    /// Spawns the workers of every stage. They run until the returned handle
    /// is shut down.
    pub fn start(self) -> PipelineHandle {
        let token = CancellationToken::new();
        let workers_per_stage = self.workers_per_stage.max(1);
        let mut tasks = Vec::with_capacity(Stage::ALL.len() * workers_per_stage);

        for stage in Stage::ALL {
            for worker in 0..workers_per_stage {
                tasks.push(tokio::spawn(run_worker(
                    Arc::clone(&self.pipeline),
                    stage,
                    worker,
                    token.clone(),
                )));
            }
        }
        info!(workers_per_stage, "pipeline workers started");

        PipelineHandle {
            pipeline: self.pipeline,
            token,
            tasks,
        }
    }
}

/// Running workers. Dropping the handle leaves them running; call
/// [`PipelineHandle::shutdown`] to stop them.
pub struct PipelineHandle {
    pipeline: Arc<Pipeline>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn worker_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stops consuming new jobs, lets in-flight jobs finish and waits for
    /// every worker to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            if let Err(error) = task.await {
                error!(%error, "pipeline worker panicked");
            }
        }
        info!("pipeline workers stopped");
    }
}

async fn run_worker(pipeline: Arc<Pipeline>, stage: Stage, worker: usize, token: CancellationToken) {
    let queue = pipeline.queue();
    debug!(%stage, worker, "worker started");

    loop {
        let consumed = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            consumed = queue.consume(stage) => consumed,
        };

        let job = match consumed {
            Ok(job) => job,
            Err(error) => {
                warn!(%stage, worker, %error, "failed to consume job");
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(CONSUME_RETRY_DELAY) => continue,
                }
            }
        };

        let settled = match pipeline.handle(&job).await {
            Ok(_) => queue.ack(&job).await,
            Err(error) => {
                error!(
                    job_id = %job.id,
                    %stage,
                    document_id = %job.document_id,
                    %error,
                    "job failed; returning it to the queue"
                );
                queue.nack(&job, &error.to_string()).await
            }
        };
        if let Err(error) = settled {
            error!(job_id = %job.id, %stage, %error, "failed to settle job");
        }
    }

    debug!(%stage, worker, "worker stopped");
}
