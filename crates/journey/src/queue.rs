//! Queue fabric: one in-process queue per step type plus the webhook
//! fan-out, delayed delivery, and the worker pool that drains them.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::config::QueueConfig;
use courier_core::contracts::JobQueue;
use courier_core::types::{QueueName, QueuePayload};
use courier_core::{CourierError, CourierResult};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Longest delay between two attempts of a failing job.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// A payload in flight, with the attempt it is on.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: QueuePayload,
    pub attempt: u32,
}

/// Processes payloads pulled from the fabric.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: QueuePayload) -> CourierResult<()>;

    /// Called once when a payload fails for good.
    async fn abandon(&self, payload: &QueuePayload, error: &CourierError);
}

#[derive(Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    delayed: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    stalled: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue: QueueName,
    pub enqueued: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub stalled: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum JobStatus {
    Completed,
    Failed { error: String },
}

/// Retained record of a finished payload.
#[derive(Debug, Clone, Serialize)]
pub struct FinishedJob {
    pub id: Uuid,
    pub queue: QueueName,
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: JobStatus,
}

pub struct QueueFabric {
    senders: HashMap<QueueName, mpsc::UnboundedSender<Delivery>>,
    receivers: Mutex<HashMap<QueueName, mpsc::UnboundedReceiver<Delivery>>>,
    counters: HashMap<QueueName, Arc<QueueCounters>>,
    finished: Mutex<VecDeque<FinishedJob>>,
    retention: usize,
}

impl QueueFabric {
    pub fn new(retention: usize) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        let mut counters = HashMap::new();
        for queue in QueueName::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(queue, tx);
            receivers.insert(queue, rx);
            counters.insert(queue, Arc::new(QueueCounters::default()));
        }
        Self {
            senders,
            receivers: Mutex::new(receivers),
            counters,
            finished: Mutex::new(VecDeque::with_capacity(retention.min(1024))),
            retention,
        }
    }

    /// Places a delivery on `queue`, after `delay` when given.
    pub fn push(
        &self,
        queue: QueueName,
        delivery: Delivery,
        delay: Option<Duration>,
    ) -> CourierResult<()> {
        let sender = self
            .senders
            .get(&queue)
            .ok_or_else(|| CourierError::Queue(format!("unknown queue {queue}")))?
            .clone();
        let counters = self.counters(queue);
        counters.enqueued.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("queue.enqueued", "queue" => queue.as_str()).increment(1);

        match delay.filter(|d| !d.is_zero()) {
            None => sender
                .send(delivery)
                .map_err(|_| CourierError::Queue(format!("queue {queue} is closed"))),
            Some(delay) => {
                counters.delayed.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    counters.delayed.fetch_sub(1, Ordering::Relaxed);
                    if sender.send(delivery).is_err() {
                        warn!(queue = %queue, "Delayed job fired after queue closed");
                    }
                });
                Ok(())
            }
        }
    }

    fn counters(&self, queue: QueueName) -> Arc<QueueCounters> {
        self.counters.get(&queue).cloned().unwrap_or_default()
    }

    fn take_receiver(&self, queue: QueueName) -> Option<mpsc::UnboundedReceiver<Delivery>> {
        self.receivers.lock().remove(&queue)
    }

    fn record_finished(&self, job: FinishedJob) {
        if self.retention == 0 {
            return;
        }
        let mut finished = self.finished.lock();
        while finished.len() >= self.retention {
            finished.pop_front();
        }
        finished.push_back(job);
    }

    pub fn stats(&self) -> Vec<QueueStats> {
        QueueName::ALL
            .iter()
            .map(|queue| {
                let c = self.counters(*queue);
                QueueStats {
                    queue: *queue,
                    enqueued: c.enqueued.load(Ordering::Relaxed),
                    delayed: c.delayed.load(Ordering::Relaxed),
                    active: c.active.load(Ordering::Relaxed),
                    completed: c.completed.load(Ordering::Relaxed),
                    failed: c.failed.load(Ordering::Relaxed),
                    retried: c.retried.load(Ordering::Relaxed),
                    stalled: c.stalled.load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    /// Most recent finished jobs, newest first.
    pub fn recent(&self, limit: usize) -> Vec<FinishedJob> {
        self.finished.lock().iter().rev().take(limit).cloned().collect()
    }
}

#[async_trait]
impl JobQueue for QueueFabric {
    async fn enqueue(&self, payload: QueuePayload, delay: Option<Duration>) -> CourierResult<()> {
        let queue = target_queue(&payload)?;
        self.push(queue, Delivery { payload, attempt: 1 }, delay)
    }
}

fn target_queue(payload: &QueuePayload) -> CourierResult<QueueName> {
    payload.queue().ok_or_else(|| match payload {
        QueuePayload::Step(job) => CourierError::NotImplemented(job.step.kind.label()),
        QueuePayload::Webhook(_) => CourierError::Queue("webhook payload without queue".into()),
    })
}

/// Drains every queue with its configured concurrency.
pub struct WorkerPool {
    fabric: Arc<QueueFabric>,
    handler: Arc<dyn JobHandler>,
    config: QueueConfig,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(fabric: Arc<QueueFabric>, handler: Arc<dyn JobHandler>, config: QueueConfig) -> Self {
        Self {
            fabric,
            handler,
            config,
            handles: Vec::new(),
        }
    }

    /// Spawn one consumer per queue. Queues already claimed are skipped.
    pub fn start(&mut self) {
        let runner = Arc::new(JobRunner {
            fabric: self.fabric.clone(),
            handler: self.handler.clone(),
            stalled_after: Duration::from_millis(self.config.stalled_interval_ms),
            max_attempts: self.config.max_attempts.max(1),
            backoff: Duration::from_millis(self.config.retry_backoff_ms),
        });

        for queue in QueueName::ALL {
            let Some(rx) = self.fabric.take_receiver(queue) else {
                warn!(queue = %queue, "Queue already has a consumer");
                continue;
            };
            let concurrency = self.config.concurrency_for(queue);
            self.handles
                .push(tokio::spawn(consume(queue, rx, runner.clone(), concurrency)));
            info!(queue = %queue, concurrency, "Queue consumer started");
        }
    }

    /// Wait for all consumers to complete (blocks until shutdown).
    pub async fn wait(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Queue consumer panicked");
                }
            }
        }
    }

    pub fn shutdown(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
        info!(consumers = self.handles.len(), "Worker pool stopped");
    }

    pub fn consumer_count(&self) -> usize {
        self.handles.len()
    }
}

async fn consume(
    queue: QueueName,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    runner: Arc<JobRunner>,
    concurrency: usize,
) {
    let slots = Arc::new(Semaphore::new(concurrency));
    while let Some(delivery) = rx.recv().await {
        let Ok(permit) = slots.clone().acquire_owned().await else {
            break;
        };
        let runner = runner.clone();
        tokio::spawn(async move {
            runner.run(queue, delivery).await;
            drop(permit);
        });
    }
    warn!(queue = %queue, "Queue consumer ended");
}

struct JobRunner {
    fabric: Arc<QueueFabric>,
    handler: Arc<dyn JobHandler>,
    stalled_after: Duration,
    max_attempts: u32,
    backoff: Duration,
}

impl JobRunner {
    async fn run(&self, queue: QueueName, delivery: Delivery) {
        let counters = self.fabric.counters(queue);
        let id = delivery.payload.id();

        counters.active.fetch_add(1, Ordering::Relaxed);
        let result = tokio::time::timeout(
            self.stalled_after,
            self.handler.handle(delivery.payload.clone()),
        )
        .await;
        counters.active.fetch_sub(1, Ordering::Relaxed);

        let error = match result {
            Ok(Ok(())) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("queue.completed", "queue" => queue.as_str()).increment(1);
                debug!(queue = %queue, job_id = %id, attempt = delivery.attempt, "Job completed");
                self.fabric.record_finished(FinishedJob {
                    id,
                    queue,
                    attempts: delivery.attempt,
                    finished_at: Utc::now(),
                    status: JobStatus::Completed,
                });
                return;
            }
            Ok(Err(e)) => e,
            Err(_) => {
                counters.stalled.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("queue.stalled", "queue" => queue.as_str()).increment(1);
                warn!(queue = %queue, job_id = %id, attempt = delivery.attempt, "Job stalled");
                CourierError::Queue(format!("job stalled after {:?}", self.stalled_after))
            }
        };

        if error.is_retryable() && delivery.attempt < self.max_attempts {
            let delay = self.backoff_for(delivery.attempt);
            counters.retried.fetch_add(1, Ordering::Relaxed);
            warn!(
                queue = %queue,
                job_id = %id,
                attempt = delivery.attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Job failed, retrying"
            );
            let retry = Delivery {
                payload: delivery.payload,
                attempt: delivery.attempt + 1,
            };
            if let Err(e) = self.fabric.push(queue, retry, Some(delay)) {
                error!(queue = %queue, job_id = %id, error = %e, "Failed to schedule retry");
            }
            return;
        }

        counters.failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("queue.failed", "queue" => queue.as_str()).increment(1);
        error!(queue = %queue, job_id = %id, attempt = delivery.attempt, error = %error, "Job failed");
        self.handler.abandon(&delivery.payload, &error).await;
        self.fabric.record_finished(FinishedJob {
            id,
            queue,
            attempts: delivery.attempt,
            finished_at: Utc::now(),
            status: JobStatus::Failed {
                error: error.to_string(),
            },
        });
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Entry captured by [`RecordingQueue`].
#[derive(Debug, Clone)]
pub struct QueuedPayload {
    pub queue: QueueName,
    pub payload: QueuePayload,
    pub delay: Option<Duration>,
}

/// Queue fake that records what was enqueued instead of running it.
#[derive(Default)]
pub struct RecordingQueue {
    entries: Mutex<VecDeque<QueuedPayload>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns the oldest entry.
    pub fn pop(&self) -> Option<QueuedPayload> {
        self.entries.lock().pop_front()
    }

    pub fn drain(&self) -> Vec<QueuedPayload> {
        self.entries.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn enqueue(&self, payload: QueuePayload, delay: Option<Duration>) -> CourierResult<()> {
        let queue = target_queue(&payload)?;
        self.entries.lock().push_back(QueuedPayload {
            queue,
            payload,
            delay,
        });
        Ok(())
    }
}
