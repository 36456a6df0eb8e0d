//! Bounded concurrent execution of uploads.
//!
//! The [`UploadScheduler`] accepts any number of tasks, but runs at most `workers` of them at the
//! same time. Tasks are queued in submission order and a single dispatcher hands them to the
//! [`Uploader`] as soon as a worker slot is free, so uploads start in submission order while they
//! finish in any order.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uploadbench_service::concurrency::{ConcurrencyLimiter, ConcurrencyPermit};
use uploadbench_service::{TransferEngine, UploadResult, UploadTask};

/// Reason recorded for tasks that were never started.
pub const NOT_STARTED: &str = "not started";

/// Performs a single upload.
///
/// Implementations must turn every error into a failed [`UploadResult`].
#[async_trait]
pub trait Uploader: fmt::Debug + Send + Sync + 'static {
    /// Uploads the object described by `task`, giving up when `cancel` is triggered.
    async fn upload(&self, task: &UploadTask, cancel: &CancellationToken) -> UploadResult;
}

#[async_trait]
impl Uploader for TransferEngine {
    async fn upload(&self, task: &UploadTask, cancel: &CancellationToken) -> UploadResult {
        TransferEngine::upload(self, task, cancel).await
    }
}

#[derive(Debug)]
struct Job {
    task: UploadTask,
    reply: oneshot::Sender<UploadResult>,
}

impl Job {
    fn reject(self) {
        let result = UploadResult::failure(&self.task, Duration::ZERO, NOT_STARTED);
        self.reply.send(result).ok();
    }
}

/// Runs uploads with a bounded number of worker slots.
#[derive(Debug)]
pub struct UploadScheduler {
    queue: mpsc::UnboundedSender<Job>,
    limiter: ConcurrencyLimiter,
    stop: CancellationToken,
    cancel: CancellationToken,
}

impl UploadScheduler {
    /// Creates a scheduler running up to `workers` uploads at once.
    ///
    /// This spawns the dispatcher, so it must be called within a tokio runtime.
    pub fn new(workers: usize, uploader: Arc<dyn Uploader>) -> Self {
        let (queue, jobs) = mpsc::unbounded_channel();
        let limiter = ConcurrencyLimiter::new(workers);
        let stop = CancellationToken::new();
        let cancel = CancellationToken::new();

        tokio::spawn(dispatch(
            jobs,
            limiter.clone(),
            uploader,
            stop.clone(),
            cancel.clone(),
        ));

        Self {
            queue,
            limiter,
            stop,
            cancel,
        }
    }

    /// Queues a task for upload.
    ///
    /// The returned handle resolves to the result of the task. Tasks submitted after
    /// [`close`](Self::close) are never started.
    pub fn submit(&self, task: UploadTask) -> UploadHandle {
        let (reply, receiver) = oneshot::channel();
        let handle = UploadHandle {
            task: task.clone(),
            receiver,
        };

        let job = Job { task, reply };
        if self.stop.is_cancelled() {
            job.reject();
        } else if let Err(mpsc::error::SendError(job)) = self.queue.send(job) {
            job.reject();
        }

        handle
    }

    /// Stops starting new uploads.
    ///
    /// Queued tasks resolve to a failure right away. Running uploads continue.
    pub fn close(&self) {
        self.stop.cancel();
    }

    /// Stops starting new uploads and cancels all running uploads.
    pub fn cancel(&self) {
        self.close();
        self.cancel.cancel();
    }

    /// Returns the worker slots of this scheduler.
    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }
}

async fn dispatch(
    mut jobs: mpsc::UnboundedReceiver<Job>,
    limiter: ConcurrencyLimiter,
    uploader: Arc<dyn Uploader>,
    stop: CancellationToken,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => return,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            permit = limiter.acquire() => permit,
        };
        let Some(permit) = permit else {
            job.reject();
            break;
        };

        tokio::spawn(run(job, permit, Arc::clone(&uploader), cancel.clone()));
    }

    jobs.close();
    let mut skipped = 0;
    while let Some(job) = jobs.recv().await {
        job.reject();
        skipped += 1;
    }
    tracing::debug!(skipped, "Scheduler closed");
}

async fn run(
    job: Job,
    permit: ConcurrencyPermit,
    uploader: Arc<dyn Uploader>,
    cancel: CancellationToken,
) {
    let Job { task, reply } = job;
    tracing::debug!(index = task.index(), key = task.key(), "Starting upload");

    let result = uploader.upload(&task, &cancel).await;
    drop(permit);

    if reply.send(result).is_err() {
        tracing::debug!(index = task.index(), "Upload result was not awaited");
    }
}

/// Resolves to the result of a submitted task.
///
/// Awaiting the handle always yields a result. If the upload could not report back, for example
/// because it panicked, the result is a failure.
#[derive(Debug)]
pub struct UploadHandle {
    task: UploadTask,
    receiver: oneshot::Receiver<UploadResult>,
}

impl Future for UploadHandle {
    type Output = UploadResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        Pin::new(&mut this.receiver).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                UploadResult::failure(&this.task, Duration::ZERO, "upload task terminated")
            })
        })
    }
}
