//! Throughput statistics of a benchmark run.

use std::fmt;
use std::io::{self, Write};
use std::time::Duration;

use sketches_ddsketch::DDSketch;
use thiserror::Error;
use tokio::time::Instant;
use uploadbench_service::{MIB, Outcome, UploadResult};
use yansi::Paint;

/// A transfer rate as reported by the benchmark.
///
/// The rate is `size * 8 / (seconds * 1024 * 1024)`. Transfers that took no measurable time have
/// an unbounded rate instead of a division by zero.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Rate {
    /// A finite rate.
    MiBps(f64),
    /// The transfer took no measurable time.
    Unbounded,
}

impl Rate {
    /// Computes the rate of transferring `size_bytes` in `duration`.
    pub fn of(size_bytes: u64, duration: Duration) -> Self {
        Self::from_mib(size_bytes as f64 / MIB as f64, duration)
    }

    fn from_mib(mib: f64, duration: Duration) -> Self {
        if duration.is_zero() {
            return Rate::Unbounded;
        }
        Rate::MiBps(mib * 8.0 / duration.as_secs_f64())
    }

    /// Returns the finite rate, if any.
    pub fn as_mibps(&self) -> Option<f64> {
        match self {
            Rate::MiBps(rate) => Some(*rate),
            Rate::Unbounded => None,
        }
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rate::MiBps(rate) => write!(f, "{rate:.2} MiB/s"),
            Rate::Unbounded => f.write_str("∞ MiB/s"),
        }
    }
}

/// Results that do not match the planned tasks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricsError {
    /// A result for a task that was never planned.
    #[error("result for task {index} out of range, expected fewer than {count} tasks")]
    OutOfRange {
        /// Index of the result.
        index: usize,
        /// Number of planned tasks.
        count: usize,
    },
    /// A second result for the same task.
    #[error("duplicate result for task {0}")]
    Duplicate(usize),
    /// Not every task has a result.
    #[error("{missing} tasks have no result")]
    Incomplete {
        /// Number of tasks without a result.
        missing: usize,
    },
}

/// Collects exactly one result per task, in any order.
#[derive(Debug)]
pub struct MetricsAggregator {
    results: Vec<Option<UploadResult>>,
    first_submission: Option<Instant>,
    last_completion: Option<Instant>,
}

impl MetricsAggregator {
    /// Creates an aggregator expecting `count` results.
    pub fn new(count: usize) -> Self {
        Self {
            results: vec![None; count],
            first_submission: None,
            last_completion: None,
        }
    }

    /// Starts the wall clock, unless it is already running.
    pub fn mark_submitted(&mut self) {
        self.first_submission.get_or_insert_with(Instant::now);
    }

    /// Records a result that completed just now.
    pub fn record(&mut self, result: UploadResult) -> Result<(), MetricsError> {
        self.record_at(result, Instant::now())
    }

    /// Records a result that completed at the given instant.
    pub fn record_at(&mut self, result: UploadResult, at: Instant) -> Result<(), MetricsError> {
        let count = self.results.len();
        let index = result.index;
        let slot = self
            .results
            .get_mut(index)
            .ok_or(MetricsError::OutOfRange { index, count })?;
        if slot.is_some() {
            return Err(MetricsError::Duplicate(index));
        }

        *slot = Some(result);
        self.last_completion = Some(self.last_completion.map_or(at, |last| last.max(at)));
        Ok(())
    }

    /// Returns the number of recorded results.
    pub fn recorded(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }

    /// Computes the report, measuring the wall time from the first submission to the last
    /// completion.
    pub fn finish(self) -> Result<Report, MetricsError> {
        let wall = match (self.first_submission, self.last_completion) {
            (Some(first), Some(last)) => last.saturating_duration_since(first),
            _ => Duration::ZERO,
        };
        self.finish_with_wall(wall)
    }

    /// Computes the report with an externally measured wall time.
    pub fn finish_with_wall(self, wall: Duration) -> Result<Report, MetricsError> {
        let missing = self.results.iter().filter(|r| r.is_none()).count();
        if missing > 0 {
            return Err(MetricsError::Incomplete { missing });
        }

        let results: Vec<_> = self.results.into_iter().flatten().collect();
        let aggregate = AggregateStats::compute(&results, wall);
        Ok(Report { results, aggregate })
    }
}

/// Totals over all results of a run.
#[derive(Clone, Debug)]
pub struct AggregateStats {
    /// Bytes of all successfully uploaded objects.
    pub total_bytes: u64,
    /// Time from the first submission to the last completion.
    pub total_wall: Duration,
    /// Transfer rate of every task, in index order.
    pub rates: Vec<Rate>,
    /// Number of committed objects.
    pub success_count: usize,
    /// Number of failed or skipped objects.
    pub failure_count: usize,
    /// Mean of the finite rates of successful uploads.
    pub average_rate: Option<f64>,
    /// Durations of successful uploads in seconds.
    durations: Vec<f64>,
}

impl AggregateStats {
    fn compute(results: &[UploadResult], total_wall: Duration) -> Self {
        let mut durations = Vec::new();
        let mut total_bytes = 0u64;
        let mut success_count = 0;
        let mut finite_rates = Vec::new();

        let rates: Vec<_> = results.iter().map(|r| Rate::of(r.size, r.duration)).collect();
        for (result, rate) in results.iter().zip(&rates) {
            if !result.is_success() {
                continue;
            }
            total_bytes = total_bytes.saturating_add(result.size);
            success_count += 1;
            durations.push(result.duration.as_secs_f64());
            finite_rates.extend(rate.as_mibps());
        }

        let average_rate = (!finite_rates.is_empty())
            .then(|| finite_rates.iter().sum::<f64>() / finite_rates.len() as f64);

        Self {
            total_bytes,
            total_wall,
            rates,
            success_count,
            failure_count: results.len() - success_count,
            average_rate,
            durations,
        }
    }

    /// Size of all uploaded objects in MiB.
    pub fn total_mib(&self) -> f64 {
        self.total_bytes as f64 / MIB as f64
    }

    /// The aggregate rate over the wall time of the run.
    pub fn rate(&self) -> Rate {
        Rate::from_mib(self.total_mib(), self.total_wall)
    }

    fn write_percentiles(&self, out: &mut impl Write) -> io::Result<()> {
        let mut sketch = DDSketch::default();
        for &duration in &self.durations {
            sketch.add(duration);
        }

        let (Some(sum), Ok(Some(p50)), Ok(Some(p90)), Ok(Some(p99))) = (
            sketch.sum(),
            sketch.quantile(0.5),
            sketch.quantile(0.9),
            sketch.quantile(0.99),
        ) else {
            return Ok(());
        };

        let avg = Duration::from_secs_f64(sum / sketch.count() as f64);
        let [p50, p90, p99] = [p50, p90, p99].map(|q| Duration::from_secs_f64(q.max(0.0)));
        writeln!(
            out,
            "  duration avg: {:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}",
            avg.bold()
        )
    }
}

/// The outcome of a complete run.
#[derive(Clone, Debug)]
pub struct Report {
    /// One result per task, in index order.
    pub results: Vec<UploadResult>,
    /// Totals over all results.
    pub aggregate: AggregateStats,
}

impl Report {
    /// Writes one line per task in index order, followed by the totals.
    pub fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        for (result, rate) in self.results.iter().zip(&self.aggregate.rates) {
            let size = result.size as f64 / MIB as f64;
            let seconds = result.duration.as_secs_f64();
            match &result.outcome {
                Outcome::Success => writeln!(
                    out,
                    "uploaded object {} of size {size:.2} MiB in {seconds:.2} seconds at {rate}",
                    result.key
                )?,
                Outcome::Failure(reason) => writeln!(
                    out,
                    "{} {} of size {size:.2} MiB after {seconds:.2} seconds: {reason}",
                    "failed to upload object".red(),
                    result.key
                )?,
            }
        }

        let aggregate = &self.aggregate;
        writeln!(out)?;
        writeln!(
            out,
            "uploaded a total of {:.2} MiB of successful objects in {:.2} seconds at {}",
            aggregate.total_mib(),
            aggregate.total_wall.as_secs_f64(),
            aggregate.rate().bold()
        )?;
        aggregate.write_percentiles(out)?;

        let succeeded = format!("{} succeeded", aggregate.success_count);
        let failed = format!("{} failed", aggregate.failure_count);
        if aggregate.failure_count > 0 {
            writeln!(out, "{}, {}", succeeded.bold().green(), failed.bold().red())
        } else {
            writeln!(out, "{}, {failed}", succeeded.bold().green())
        }
    }
}

#[cfg(test)]
mod tests {
    use uploadbench_service::UploadTask;

    use super::*;

    fn success(index: usize, size: u64, secs: f64) -> UploadResult {
        let task = UploadTask::new(index, format!("stress-test/{index:02}"), size);
        UploadResult::success(&task, Duration::from_secs_f64(secs))
    }

    fn failure(index: usize, size: u64) -> UploadResult {
        let task = UploadTask::new(index, format!("stress-test/{index:02}"), size);
        UploadResult::failure(&task, Duration::from_secs(1), "boom")
    }

    fn render(report: &Report) -> String {
        let mut out = Vec::new();
        report.write_to(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn rate_formula() {
        assert_eq!(Rate::of(MIB, Duration::from_secs(1)), Rate::MiBps(8.0));
        assert_eq!(Rate::of(10 * MIB, Duration::from_secs(4)), Rate::MiBps(20.0));
    }

    #[test]
    fn zero_duration_is_unbounded() {
        let rate = Rate::of(MIB, Duration::ZERO);
        assert_eq!(rate, Rate::Unbounded);
        assert_eq!(rate.to_string(), "∞ MiB/s");
        assert_eq!(Rate::MiBps(49.6).to_string(), "49.60 MiB/s");
    }

    #[test]
    fn aggregate_over_wall_time() {
        let mut metrics = MetricsAggregator::new(5);
        for (index, mib) in [1, 2, 4, 8, 16].into_iter().enumerate() {
            metrics.record(success(index, mib * MIB, 1.0)).unwrap();
        }

        let report = metrics.finish_with_wall(Duration::from_secs(5)).unwrap();
        let aggregate = &report.aggregate;
        assert_eq!(aggregate.total_bytes, 31 * MIB);
        assert_eq!(aggregate.total_mib(), 31.0);
        let rate = aggregate.rate().as_mibps().unwrap();
        assert!((rate - 49.6).abs() < 1e-9, "{rate}");
        assert_eq!(aggregate.success_count, 5);
        assert_eq!(aggregate.failure_count, 0);
    }

    #[test]
    fn reported_in_index_order() {
        let mut metrics = MetricsAggregator::new(4);
        for index in [3, 1, 0, 2] {
            metrics.record(success(index, MIB, 0.5)).unwrap();
        }

        let report = metrics.finish_with_wall(Duration::from_secs(1)).unwrap();
        let indexes: Vec<_> = report.results.iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);

        let output = render(&report);
        let first = output.find("stress-test/01").unwrap();
        let third = output.find("stress-test/03").unwrap();
        assert!(first < third);
    }

    #[test]
    fn failures_are_tallied() {
        let mut metrics = MetricsAggregator::new(5);
        for index in 0..5 {
            let result = if index == 3 {
                failure(index, MIB)
            } else {
                success(index, MIB, 1.0)
            };
            metrics.record(result).unwrap();
        }

        let report = metrics.finish_with_wall(Duration::from_secs(2)).unwrap();
        assert_eq!(report.aggregate.success_count, 4);
        assert_eq!(report.aggregate.failure_count, 1);
        assert_eq!(report.aggregate.total_bytes, 4 * MIB);

        let output = render(&report);
        assert!(output.contains("uploaded a total of 4.00 MiB of successful objects in 2.00 seconds"));
        assert!(output.contains("4 succeeded"));
        assert!(output.contains("1 failed"));
        assert!(output.contains("stress-test/03 of size 1.00 MiB after 1.00 seconds: boom"));
        assert!(output.contains("uploaded object stress-test/00 of size 1.00 MiB in 1.00 seconds"));
    }

    #[test]
    fn zero_wall_time() {
        let mut metrics = MetricsAggregator::new(1);
        metrics.record(success(0, 0, 0.0)).unwrap();

        let report = metrics.finish_with_wall(Duration::ZERO).unwrap();
        assert_eq!(report.aggregate.rate(), Rate::Unbounded);
        assert!(render(&report).contains("∞ MiB/s"));
    }

    #[test]
    fn rejects_unexpected_results() {
        let mut metrics = MetricsAggregator::new(2);
        assert_eq!(
            metrics.record(success(2, 1, 1.0)),
            Err(MetricsError::OutOfRange { index: 2, count: 2 })
        );

        metrics.record(success(0, 1, 1.0)).unwrap();
        assert_eq!(
            metrics.record(success(0, 1, 1.0)),
            Err(MetricsError::Duplicate(0))
        );
        assert_eq!(metrics.recorded(), 1);
        assert!(matches!(
            metrics.finish(),
            Err(MetricsError::Incomplete { missing: 1 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn wall_time_from_first_submission_to_last_completion() {
        let mut metrics = MetricsAggregator::new(2);
        metrics.mark_submitted();
        let start = Instant::now();

        metrics
            .record_at(success(1, MIB, 1.0), start + Duration::from_secs(3))
            .unwrap();
        metrics
            .record_at(success(0, MIB, 1.0), start + Duration::from_secs(2))
            .unwrap();

        let report = metrics.finish().unwrap();
        assert_eq!(report.aggregate.total_wall, Duration::from_secs(3));
    }

    #[test]
    fn average_of_finite_rates() {
        let mut metrics = MetricsAggregator::new(3);
        metrics.record(success(0, MIB, 1.0)).unwrap();
        metrics.record(success(1, MIB, 0.5)).unwrap();
        metrics.record(success(2, MIB, 0.0)).unwrap();

        let report = metrics.finish_with_wall(Duration::from_secs(1)).unwrap();
        assert_eq!(report.aggregate.average_rate, Some(12.0));
    }
}
