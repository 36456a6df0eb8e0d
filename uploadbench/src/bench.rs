//! Running a complete benchmark.
//!
//! The [`Orchestrator`] plans one task per object, submits all of them to the
//! [`UploadScheduler`], collects the results in completion order and finally writes the report
//! in index order.

use std::future::Future;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::time::Instant;
use uploadbench_service::backend::{InMemoryBackend, S3Backend, S3Config, SharedBackend};
use uploadbench_service::progress::{NoProgress, ProgressSink};
use uploadbench_service::{TransferEngine, UploadTask};

use crate::config::{Config, ConfigError, Objects, Storage};
use crate::metrics::{MetricsAggregator, Report};
use crate::plot::write_plot_data;
use crate::reporter::{ProgressDisplay, ProgressReporter};
use crate::scheduler::UploadScheduler;
use crate::sizes::SizeSequence;

/// Returns the key of object `index`.
pub fn object_key(prefix: &str, index: usize) -> String {
    format!("{prefix}stress-test/{index:02}")
}

/// Plans one task per object.
pub fn build_tasks(objects: &Objects) -> Result<Vec<UploadTask>, ConfigError> {
    let sizes = SizeSequence::new(
        objects.count,
        objects.initial_size.as_u64(),
        objects.ratio,
    )?;

    let tasks = sizes
        .iter()
        .enumerate()
        .map(|(index, size)| UploadTask::new(index, object_key(&objects.prefix, index), size))
        .collect();

    Ok(tasks)
}

/// Creates the storage backend described by the configuration.
pub fn make_backend(storage: &Storage) -> Result<SharedBackend> {
    let backend: SharedBackend = match storage {
        Storage::S3 {
            bucket,
            region,
            endpoint,
            profile,
        } => {
            let config = S3Config {
                bucket: bucket.clone(),
                region: region.clone(),
                endpoint: endpoint.clone(),
                profile: profile.clone(),
            };
            Arc::new(S3Backend::new(&config).context("failed to create S3 client")?)
        }
        Storage::Memory { latency } => Arc::new(InMemoryBackend::new().with_latency(*latency)),
    };

    Ok(backend)
}

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// All tasks ran to completion, successful or not.
    Completed,
    /// An upload failed and fail-fast mode stopped the run.
    FailedFast,
    /// The run was interrupted.
    Interrupted,
}

impl RunStatus {
    /// Returns the process exit code for this status.
    pub fn code(self) -> u8 {
        match self {
            RunStatus::Completed => 0,
            RunStatus::FailedFast => 1,
            RunStatus::Interrupted => 130,
        }
    }

    /// Returns the process exit code for this status.
    pub fn exit_code(self) -> ExitCode {
        ExitCode::from(self.code())
    }
}

/// The result of [`Orchestrator::run`].
#[derive(Debug)]
pub struct BenchOutcome {
    /// Results and totals of all tasks.
    pub report: Report,
    /// How the run ended.
    pub status: RunStatus,
}

/// Wires the benchmark together end to end.
#[derive(Debug)]
pub struct Orchestrator {
    config: Config,
    backend: SharedBackend,
    reporter: Option<ProgressReporter>,
}

impl Orchestrator {
    /// Creates a benchmark uploading to `backend`, without progress display.
    pub fn new(config: Config, backend: SharedBackend) -> Self {
        Self {
            config,
            backend,
            reporter: None,
        }
    }

    /// Renders per-object progress to `reporter` while uploading.
    pub fn with_reporter(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Uploads all objects and writes the report to `out`.
    ///
    /// When `shutdown` resolves, no further uploads are started. Running uploads get the
    /// configured grace period to finish before they are cancelled. The report always contains one
    /// result per planned object.
    pub async fn run(
        self,
        shutdown: impl Future<Output = ()>,
        out: &mut impl Write,
    ) -> Result<BenchOutcome> {
        let Self {
            config,
            backend,
            reporter,
        } = self;

        config.validate()?;
        let tasks = build_tasks(&config.objects)?;
        let count = tasks.len();

        let display = reporter.as_ref().map(|reporter| {
            reporter.clear_screen();
            ProgressDisplay::start(reporter.clone())
        });
        let sink: Arc<dyn ProgressSink> = match &display {
            Some(display) => display.sink(),
            None => Arc::new(NoProgress),
        };

        let transfer = config.transfer_config();
        tracing::info!(
            objects = count,
            workers = config.workers,
            part_concurrency = transfer.part_concurrency,
            max_requests = config.workers.saturating_mul(transfer.part_concurrency),
            backend = backend.name(),
            "Starting benchmark"
        );

        let engine = TransferEngine::new(Arc::clone(&backend), transfer, sink);
        let scheduler = UploadScheduler::new(config.workers, Arc::new(engine));

        let limiter = scheduler.limiter().clone();
        let emitter = tokio::spawn(async move {
            let max = limiter.max_permits();
            limiter
                .run_emitter(|used| async move {
                    tracing::debug!(used, max, "Uploads in flight");
                })
                .await
        });

        let mut metrics = MetricsAggregator::new(count);
        metrics.mark_submitted();
        let mut pending: FuturesUnordered<_> =
            tasks.into_iter().map(|task| scheduler.submit(task)).collect();

        let mut status = RunStatus::Completed;
        let grace = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(grace, shutdown);
        let mut grace_running = false;

        loop {
            tokio::select! {
                result = pending.next() => {
                    let Some(result) = result else {
                        break;
                    };

                    let failed = !result.is_success();
                    tracing::debug!(index = result.index, outcome = %result.outcome, "Upload finished");
                    metrics.record(result)?;

                    if failed && config.fail_fast && status == RunStatus::Completed {
                        tracing::warn!("Upload failed, cancelling remaining uploads");
                        status = RunStatus::FailedFast;
                        scheduler.cancel();
                    }
                }
                _ = &mut shutdown, if status == RunStatus::Completed => {
                    tracing::warn!(
                        grace = ?config.shutdown_grace,
                        running = scheduler.limiter().used_permits(),
                        "Interrupted, waiting for running uploads"
                    );
                    status = RunStatus::Interrupted;
                    scheduler.close();
                    grace.as_mut().reset(Instant::now() + config.shutdown_grace);
                    grace_running = true;
                }
                _ = &mut grace, if grace_running => {
                    tracing::warn!("Grace period elapsed, cancelling running uploads");
                    grace_running = false;
                    scheduler.cancel();
                }
            }
        }

        emitter.abort();
        if let Some(display) = display {
            display.finish().await;
        }
        if let Some(reporter) = &reporter {
            reporter.move_below(count);
        }

        let report = metrics.finish()?;
        report.write_to(out).context("failed to write report")?;
        out.flush().context("failed to write report")?;

        if config.plot.enabled {
            write_plot_data(&config.plot.path, &report)?;
        }

        tracing::info!(
            succeeded = report.aggregate.success_count,
            failed = report.aggregate.failure_count,
            ?status,
            "Benchmark finished"
        );

        Ok(BenchOutcome { report, status })
    }
}

#[cfg(test)]
mod tests {
    use bytesize::ByteSize;
    use uploadbench_service::MIB;

    use super::*;

    #[test]
    fn keys() {
        assert_eq!(object_key("", 3), "stress-test/03");
        assert_eq!(object_key("nightly/", 42), "nightly/stress-test/42");
        assert_eq!(object_key("", 123), "stress-test/123");
    }

    #[test]
    fn tasks_from_objects() {
        let objects = Objects {
            count: 3,
            initial_size: ByteSize::mib(1),
            ratio: 2.0,
            prefix: "a/".into(),
        };

        let tasks = build_tasks(&objects).unwrap();
        assert_eq!(
            tasks,
            vec![
                UploadTask::new(0, "a/stress-test/00", MIB),
                UploadTask::new(1, "a/stress-test/01", 2 * MIB),
                UploadTask::new(2, "a/stress-test/02", 4 * MIB),
            ]
        );
    }

    #[test]
    fn tasks_reject_negative_ratio() {
        let objects = Objects {
            ratio: -2.0,
            ..Default::default()
        };
        assert_eq!(build_tasks(&objects), Err(ConfigError::InvalidRatio(-2.0)));
    }

    #[test]
    fn exit_codes() {
        assert_eq!(RunStatus::Completed.code(), 0);
        assert_eq!(RunStatus::FailedFast.code(), 1);
        assert_eq!(RunStatus::Interrupted.code(), 130);
    }

    #[test]
    fn memory_backend() {
        let storage = Storage::Memory {
            latency: Duration::ZERO,
        };
        assert_eq!(make_backend(&storage).unwrap().name(), "in-memory");
    }
}
