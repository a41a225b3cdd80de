use crate::error::QueueError;
use crate::models::{Job, Stage};
use crate::traits::JobQueue;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_DELIVERIES: u32 = 3;

/// A job that was nacked on its last allowed delivery.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub job: Job,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StageQueue {
    ready: Mutex<VecDeque<Job>>,
    available: Notify,
}

/// At-least-once job queue in process memory, one FIFO per stage.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    extract: StageQueue,
    analyze: StageQueue,
    index: StageQueue,
    in_flight: Mutex<HashMap<Uuid, Job>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    max_deliveries: u32,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DELIVERIES)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, QueueError> {
    mutex
        .lock()
        .map_err(|_| QueueError::Unavailable("queue lock poisoned".to_string()))
}

impl InMemoryJobQueue {
    pub fn new(max_deliveries: u32) -> Self {
        Self {
            extract: StageQueue::default(),
            analyze: StageQueue::default(),
            index: StageQueue::default(),
            in_flight: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(Vec::new()),
            max_deliveries: max_deliveries.max(1),
        }
    }

    fn stage(&self, stage: Stage) -> &StageQueue {
        match stage {
            Stage::Extract => &self.extract,
            Stage::Analyze => &self.analyze,
            Stage::Index => &self.index,
        }
    }

    fn push(&self, job: Job) -> Result<(), QueueError> {
        let queue = self.stage(job.stage);
        lock(&queue.ready)?.push_back(job);
        queue.available.notify_one();
        Ok(())
    }

    pub fn pending(&self, stage: Stage) -> usize {
        lock(&self.stage(stage).ready).map(|ready| ready.len()).unwrap_or(0)
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.dead_letters)
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }

    fn take_in_flight(&self, job: &Job) -> Result<Job, QueueError> {
        lock(&self.in_flight)?
            .remove(&job.id)
            .ok_or(QueueError::UnknownJob(job.id))
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        debug!(job_id = %job.id, stage = %job.stage, document_id = %job.document_id, "job enqueued");
        self.push(job)
    }

    async fn consume(&self, stage: Stage) -> Result<Job, QueueError> {
        let queue = self.stage(stage);
        loop {
            let next = lock(&queue.ready)?.pop_front();
            if let Some(mut job) = next {
                job.deliveries += 1;
                lock(&self.in_flight)?.insert(job.id, job.clone());
                return Ok(job);
            }
            queue.available.notified().await;
        }
    }

    async fn ack(&self, job: &Job) -> Result<(), QueueError> {
        self.take_in_flight(job).map(|_| ())
    }

    async fn nack(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        let job = self.take_in_flight(job)?;
        if job.deliveries >= self.max_deliveries {
            warn!(
                job_id = %job.id,
                stage = %job.stage,
                document_id = %job.document_id,
                deliveries = job.deliveries,
                %error,
                "job dead-lettered"
            );
            lock(&self.dead_letters)?.push(DeadLetter {
                job,
                error: error.to_string(),
                failed_at: Utc::now(),
            });
            return Ok(());
        }

        debug!(job_id = %job.id, deliveries = job.deliveries, %error, "job returned to queue");
        self.push(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_are_delivered_in_order_per_stage() {
        let queue = InMemoryJobQueue::default();
        queue.enqueue(Job::analyze("a")).await.unwrap();
        queue.enqueue(Job::index("x")).await.unwrap();
        queue.enqueue(Job::analyze("b")).await.unwrap();

        let first = queue.consume(Stage::Analyze).await.unwrap();
        let second = queue.consume(Stage::Analyze).await.unwrap();
        assert_eq!(first.document_id, "a");
        assert_eq!(second.document_id, "b");
        assert_eq!(first.deliveries, 1);
        assert_eq!(queue.pending(Stage::Index), 1);
        assert_eq!(queue.in_flight(), 2);

        queue.ack(&first).await.unwrap();
        assert!(matches!(
            queue.ack(&first).await,
            Err(QueueError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn consumer_waits_for_new_jobs() {
        let queue = Arc::new(InMemoryJobQueue::default());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.consume(Stage::Index).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(Job::index("late")).await.unwrap();

        let job = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer woke up")
            .unwrap()
            .unwrap();
        assert_eq!(job.document_id, "late");
    }

    #[tokio::test]
    async fn nacked_jobs_are_redelivered_then_dead_lettered() {
        let queue = InMemoryJobQueue::new(2);
        queue.enqueue(Job::analyze("doc")).await.unwrap();

        let first = queue.consume(Stage::Analyze).await.unwrap();
        queue.nack(&first, "repository down").await.unwrap();
        let second = queue.consume(Stage::Analyze).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.deliveries, 2);

        queue.nack(&second, "repository still down").await.unwrap();
        assert_eq!(queue.pending(Stage::Analyze), 0);
        let letters = queue.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].error, "repository still down");
        assert_eq!(queue.in_flight(), 0);
    }
}
