//! Task registry and worker loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::broker::{Delivery, FailureOutcome, TaskOutput, TaskQueue};
use closet_core::{Error, Result};

/// A task implementation.
///
/// `args` are the explicit arguments from the signature; `input` is the
/// result of the previous chain step, the collected chord results, or the
/// error message for an error link.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, args: Value, input: Option<Value>) -> Result<TaskOutput>;
}

/// Handlers by task name.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Pulls messages from a [`TaskQueue`] and runs them.
pub struct Worker {
    queue: Arc<TaskQueue>,
    registry: Arc<TaskRegistry>,
}

impl Worker {
    pub fn new(queue: Arc<TaskQueue>, registry: Arc<TaskRegistry>) -> Self {
        Self { queue, registry }
    }

    /// Run until `stop` becomes `true`, then wait for in-flight tasks.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let settings = self.queue.settings().clone();
        let concurrency = settings.worker_concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        let poll = Duration::from_millis(settings.poll_interval_ms.max(1));

        info!(
            "Worker started: concurrency={}, tasks=[{}]",
            concurrency,
            self.registry.names().join(", ")
        );

        loop {
            if *stop.borrow() {
                break;
            }

            if let Err(e) = self.queue.sweep_expired_chords() {
                warn!("Chord sweep failed: {}", e);
            }

            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match self.queue.claim() {
                Ok(Some(delivery)) => {
                    let queue = self.queue.clone();
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        process(&queue, &registry, delivery).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        changed = stop.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!("Claim failed: {}", e);
                    tokio::time::sleep(poll).await;
                }
            }
        }

        info!("Worker stopping, waiting for in-flight tasks");
        let _all = permits
            .acquire_many(concurrency as u32)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        info!("Worker stopped");
        Ok(())
    }

    /// Process messages one at a time until the queue is empty.
    ///
    /// Waits out retry delays. Returns the number of deliveries processed.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut processed = 0;
        loop {
            self.queue.sweep_expired_chords()?;
            if let Some(delivery) = self.queue.claim()? {
                process(&self.queue, &self.registry, delivery).await;
                processed += 1;
                continue;
            }
            match self.queue.next_ready_in()? {
                Some(wait) => tokio::time::sleep(wait.max(Duration::from_millis(1))).await,
                None => break,
            }
        }
        debug!("Queue idle after {} deliveries", processed);
        Ok(processed)
    }
}

async fn process(queue: &TaskQueue, registry: &TaskRegistry, delivery: Delivery) {
    let name = delivery.call.name.clone();
    let result = match registry.get(&name) {
        Some(handler) => {
            debug!("Running {} (message {}, attempt {})", name, delivery.id, delivery.attempts + 1);
            handler
                .run(delivery.call.args.clone(), delivery.input.clone())
                .await
        }
        None => Err(Error::UnknownTask(name.clone())),
    };

    match result {
        Ok(output) => {
            if let Err(e) = queue.complete(&delivery, output) {
                error!("Failed to acknowledge {} ({}): {}", name, delivery.id, e);
            }
        }
        Err(err) => match queue.fail(&delivery, &err) {
            Ok(FailureOutcome::Retrying { attempt, delay }) => {
                warn!(
                    "Task {} failed ({}), retry {} in {:?}",
                    name, err, attempt, delay
                );
            }
            Ok(FailureOutcome::Failed) => {
                error!("Task {} failed permanently: {}", name, err);
            }
            Err(e) => {
                error!("Failed to settle {} ({}): {}", name, delivery.id, e);
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{Signature, TaskCall};
    use closet_core::{QueueSettings, RetrySettings};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Records every call and returns `args["value"]`, or echoes the input.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(Value, Option<Value>)>>,
    }

    #[async_trait]
    impl TaskHandler for Recorder {
        async fn run(&self, args: Value, input: Option<Value>) -> Result<TaskOutput> {
            self.calls.lock().push((args.clone(), input.clone()));
            let out = args
                .get("value")
                .cloned()
                .or(input)
                .unwrap_or(Value::Null);
            Ok(TaskOutput::Value(out))
        }
    }

    /// Fails with a transient error `failures` times, then succeeds.
    struct Flaky {
        failures: u32,
        seen: AtomicU32,
    }

    #[async_trait]
    impl TaskHandler for Flaky {
        async fn run(&self, _args: Value, _input: Option<Value>) -> Result<TaskOutput> {
            let n = self.seen.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(Error::Service("503".into()));
            }
            Ok(TaskOutput::Value(json!("ok")))
        }
    }

    /// Expands into a chord over `args["items"]`.
    struct FanOut;

    #[async_trait]
    impl TaskHandler for FanOut {
        async fn run(&self, _args: Value, input: Option<Value>) -> Result<TaskOutput> {
            let items = input.and_then(|v| v.as_array().cloned()).unwrap_or_default();
            let header = items
                .into_iter()
                .map(|item| Signature::task("rec", json!({ "value": item })))
                .collect();
            Ok(TaskOutput::Replace(Signature::chord(
                header,
                Signature::task("sink", json!({})),
            )))
        }
    }

    fn setup(max_retries: u32) -> (Arc<TaskQueue>, TempDir) {
        let dir = TempDir::new().unwrap();
        let settings = QueueSettings {
            retry: RetrySettings {
                max_retries,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
            ..Default::default()
        };
        let queue = Arc::new(TaskQueue::open(dir.path(), settings).unwrap());
        (queue, dir)
    }

    #[tokio::test]
    async fn test_fan_out_collects_in_order() {
        let (queue, _dir) = setup(2);
        let rec = Arc::new(Recorder::default());
        let sink = Arc::new(Recorder::default());
        let mut registry = TaskRegistry::new();
        registry.register("rec", rec.clone());
        registry.register("sink", sink.clone());
        registry.register("fan_out", Arc::new(FanOut));

        let sig = Signature::task("rec", json!({"value": ["a", "b", "c"]}))
            .then(Signature::task("fan_out", json!({})));
        queue.submit(&sig, None).unwrap();

        let worker = Worker::new(queue.clone(), Arc::new(registry));
        worker.run_until_idle().await.unwrap();

        let sink_calls = sink.calls.lock();
        assert_eq!(sink_calls.len(), 1);
        assert_eq!(sink_calls[0].1, Some(json!(["a", "b", "c"])));
        assert_eq!(rec.calls.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (queue, _dir) = setup(3);
        let flaky = Arc::new(Flaky {
            failures: 2,
            seen: AtomicU32::new(0),
        });
        let errors = Arc::new(Recorder::default());
        let mut registry = TaskRegistry::new();
        registry.register("flaky", flaky.clone());
        registry.register("on_error", errors.clone());

        queue
            .submit(&Signature::task("flaky", json!({})), Some(TaskCall::new("on_error", json!({}))))
            .unwrap();
        Worker::new(queue, Arc::new(registry))
            .run_until_idle()
            .await
            .unwrap();

        assert_eq!(flaky.seen.load(Ordering::SeqCst), 3);
        assert!(errors.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_run_errback() {
        let (queue, _dir) = setup(1);
        let flaky = Arc::new(Flaky {
            failures: 10,
            seen: AtomicU32::new(0),
        });
        let errors = Arc::new(Recorder::default());
        let mut registry = TaskRegistry::new();
        registry.register("flaky", flaky.clone());
        registry.register("on_error", errors.clone());

        queue
            .submit(&Signature::task("flaky", json!({})), Some(TaskCall::new("on_error", json!({"job": "j1"}))))
            .unwrap();
        Worker::new(queue, Arc::new(registry))
            .run_until_idle()
            .await
            .unwrap();

        assert_eq!(flaky.seen.load(Ordering::SeqCst), 2);
        let calls = errors.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0["job"], "j1");
        assert!(calls[0].1.as_ref().unwrap().as_str().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_unknown_task_runs_errback() {
        let (queue, _dir) = setup(3);
        let errors = Arc::new(Recorder::default());
        let mut registry = TaskRegistry::new();
        registry.register("on_error", errors.clone());

        queue
            .submit(&Signature::task("missing", json!({})), Some(TaskCall::new("on_error", json!({}))))
            .unwrap();
        Worker::new(queue, Arc::new(registry))
            .run_until_idle()
            .await
            .unwrap();
        assert_eq!(errors.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let (queue, _dir) = setup(0);
        let rec = Arc::new(Recorder::default());
        let mut registry = TaskRegistry::new();
        registry.register("rec", rec.clone());
        queue.submit(&Signature::task("rec", json!({"value": 1})), None).unwrap();

        let worker = Worker::new(queue.clone(), Arc::new(registry));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        for _ in 0..200 {
            if queue.pending_count().unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(rec.calls.lock().len(), 1);
    }
}
