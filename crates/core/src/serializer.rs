//! Process-wide sequential executor for calls to the rate-limited model
//! service.
//!
//! Calls run one at a time in submission order. Consecutive call starts are
//! at least `min_interval` apart, measured from the start of the previous
//! call. A failed call completes with its error and never blocks the queue.
//! Retrying is left to callers.

use crate::error::ModelError;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

pub const DEFAULT_MIN_CALL_INTERVAL: Duration = Duration::from_secs(6);

type QueuedCall = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

#[derive(Debug, Clone, Copy)]
pub struct SerializerConfig {
    pub min_interval: Duration,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            min_interval: DEFAULT_MIN_CALL_INTERVAL,
        }
    }
}

/// Handle to the call queue. Cloning shares the same queue.
#[derive(Clone)]
pub struct CallSerializer {
    sender: mpsc::UnboundedSender<QueuedCall>,
    min_interval: Duration,
}

impl CallSerializer {
    /// Starts the queue consumer. Must be called from within a Tokio runtime.
    pub fn new(config: SerializerConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(drain(receiver, config.min_interval));
        Self {
            sender,
            min_interval: config.min_interval,
        }
    }

    /// A serializer that keeps ordering but waits zero time between calls.
    pub fn unthrottled() -> Self {
        Self::new(SerializerConfig {
            min_interval: Duration::ZERO,
        })
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Queues `task`. The position in the queue is fixed when `submit` is
    /// called, not when the returned future is first polled.
    pub fn submit<T, F, Fut>(
        &self,
        task: F,
    ) -> impl Future<Output = Result<T, ModelError>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ModelError>> + Send + 'static,
    {
        self.enqueue(None, task)
    }

    /// Like [`CallSerializer::submit`], but the call fails with
    /// [`ModelError::Timeout`] once it has run for `limit`.
    pub fn submit_with_timeout<T, F, Fut>(
        &self,
        limit: Duration,
        task: F,
    ) -> impl Future<Output = Result<T, ModelError>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ModelError>> + Send + 'static,
    {
        self.enqueue(Some(limit), task)
    }

    fn enqueue<T, F, Fut>(
        &self,
        limit: Option<Duration>,
        task: F,
    ) -> impl Future<Output = Result<T, ModelError>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ModelError>> + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let call: QueuedCall = Box::new(move || {
            Box::pin(async move {
                let outcome = match limit {
                    Some(limit) => match tokio::time::timeout(limit, task()).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ModelError::Timeout(limit)),
                    },
                    None => task().await,
                };
                // The caller may have stopped waiting; the call still counted.
                let _ = reply.send(outcome);
            })
        });
        let accepted = self.sender.send(call).is_ok();

        async move {
            if !accepted {
                return Err(ModelError::QueueClosed);
            }
            response.await.unwrap_or(Err(ModelError::Aborted))
        }
    }
}

async fn drain(mut receiver: mpsc::UnboundedReceiver<QueuedCall>, min_interval: Duration) {
    let mut last_start: Option<Instant> = None;

    while let Some(call) = receiver.recv().await {
        if let Some(previous) = last_start {
            let ready_at = previous + min_interval;
            let now = Instant::now();
            if now < ready_at {
                debug!(
                    wait_ms = (ready_at - now).as_millis() as u64,
                    "rate limit: delaying next model call"
                );
                sleep_until(ready_at).await;
            }
        }
        last_start = Some(Instant::now());

        // Run on its own task so a panicking call cannot take the queue down.
        if let Err(error) = tokio::spawn(call()).await {
            warn!(%error, "queued model call panicked");
        }
    }

    debug!("model call queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> Arc<Mutex<Vec<(usize, Instant)>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn calls_start_in_order_and_respect_min_interval() {
        let serializer = CallSerializer::new(SerializerConfig {
            min_interval: Duration::from_secs(6),
        });
        let starts = recorder();

        let pending = (0..3)
            .map(|index| {
                let starts = Arc::clone(&starts);
                serializer.submit(move || async move {
                    starts.lock().unwrap().push((index, Instant::now()));
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(index)
                })
            })
            .collect::<Vec<_>>();

        let mut results = Vec::new();
        for call in pending {
            results.push(call.await.unwrap());
        }
        assert_eq!(results, vec![0, 1, 2]);

        let starts = starts.lock().unwrap().clone();
        assert_eq!(
            starts.iter().map(|(index, _)| *index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        for pair in starts.windows(2) {
            assert!(pair[1].1 >= pair[0].1);
            assert!(pair[1].1 - pair[0].1 >= Duration::from_secs(6));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failing_call_does_not_block_the_queue() {
        let serializer = CallSerializer::new(SerializerConfig {
            min_interval: Duration::from_secs(2),
        });
        let started = Instant::now();

        let failing = serializer.submit(|| async { Err::<u8, _>(ModelError::RateLimited) });
        let next = serializer.submit(|| async { Ok(7u8) });

        assert!(matches!(failing.await, Err(ModelError::RateLimited)));
        assert_eq!(next.await.unwrap(), 7);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_and_release_the_queue() {
        let serializer = CallSerializer::unthrottled();

        let slow = serializer.submit_with_timeout(Duration::from_secs(1), || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("late")
        });
        let quick = serializer.submit(|| async { Ok("quick") });

        assert!(matches!(slow.await, Err(ModelError::Timeout(_))));
        assert_eq!(quick.await.unwrap(), "quick");
    }

    #[tokio::test]
    async fn panicking_call_reports_aborted() {
        let serializer = CallSerializer::unthrottled();
        let broken = serializer.submit(|| async {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        let healthy = serializer.submit(|| async { Ok(1) });

        assert!(matches!(broken.await, Err(ModelError::Aborted)));
        assert_eq!(healthy.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unthrottled_serializer_still_orders_calls() {
        let serializer = CallSerializer::unthrottled();
        let order = Arc::new(Mutex::new(Vec::new()));

        let calls = (0..5)
            .map(|index| {
                let order = Arc::clone(&order);
                serializer.submit(move || async move {
                    order.lock().unwrap().push(index);
                    Ok(())
                })
            })
            .collect::<Vec<_>>();
        for call in calls.into_iter().rev() {
            call.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
