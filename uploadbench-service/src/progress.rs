//! Per-task transfer progress.
//!
//! Every task owns one [`TaskProgress`] record. Backends report progress per request (a whole
//! object or a single part) through a [`ProgressFn`]; the record folds those reports into one
//! monotonically increasing byte count for the task and forwards every change to a shared
//! [`ProgressSink`].

use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::task::UploadTask;

/// Callback receiving the cumulative number of bytes sent for one request body.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// A snapshot of one task's transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferProgress {
    /// Index of the task being transferred.
    pub task_index: usize,
    /// Bytes sent so far, never more than `total_bytes`.
    pub bytes_sent: u64,
    /// Size of the object.
    pub total_bytes: u64,
}

impl TransferProgress {
    /// Percentage of the object sent so far.
    ///
    /// Empty objects are reported as complete.
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.bytes_sent as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Receives progress updates of all running transfers.
pub trait ProgressSink: Debug + Send + Sync + 'static {
    /// Called whenever the progress of a task changes.
    ///
    /// Implementations must not block and must not fail: progress display is best-effort.
    fn update(&self, label: &str, progress: TransferProgress);
}

/// A [`ProgressSink`] that discards all updates.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&self, _label: &str, _progress: TransferProgress) {}
}

/// The progress record of a single task.
///
/// Updates and their publication happen under one lock, so the sink observes a non-decreasing
/// sequence even when parts report from different threads.
#[derive(Debug)]
pub struct TaskProgress {
    index: usize,
    label: String,
    total: u64,
    sent: Mutex<u64>,
    sink: Arc<dyn ProgressSink>,
}

impl TaskProgress {
    /// Creates an empty progress record for `task`.
    pub fn new(task: &UploadTask, sink: Arc<dyn ProgressSink>) -> Arc<Self> {
        Arc::new(Self {
            index: task.index(),
            label: task.key().to_owned(),
            total: task.size(),
            sent: Mutex::new(0),
            sink,
        })
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> TransferProgress {
        self.progress(*self.lock())
    }

    /// Publishes the current snapshot to the sink.
    pub fn publish(&self) {
        let sent = self.lock();
        self.sink.update(&self.label, self.progress(*sent));
    }

    /// Returns a callback for one request body.
    ///
    /// The callback expects cumulative byte counts of that body and adds the increments to this
    /// record. Counts lower than a previously reported one are ignored.
    pub fn tracker(self: &Arc<Self>) -> ProgressFn {
        let this = Arc::clone(self);
        let reported = AtomicU64::new(0);
        Arc::new(move |cumulative| {
            let previous = reported.fetch_max(cumulative, Ordering::AcqRel);
            if cumulative > previous {
                this.advance(cumulative - previous);
            }
        })
    }

    /// Marks the whole object as sent.
    pub fn complete(&self) {
        let mut sent = self.lock();
        if *sent < self.total {
            *sent = self.total;
            self.sink.update(&self.label, self.progress(*sent));
        }
    }

    fn advance(&self, delta: u64) {
        let mut sent = self.lock();
        if *sent >= self.total {
            return;
        }
        *sent = sent.saturating_add(delta).min(self.total);
        self.sink.update(&self.label, self.progress(*sent));
    }

    fn progress(&self, sent: u64) -> TransferProgress {
        TransferProgress {
            task_index: self.index,
            bytes_sent: sent,
            total_bytes: self.total,
        }
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[derive(Debug, Default)]
    struct Recorder(Mutex<Vec<TransferProgress>>);

    impl ProgressSink for Recorder {
        fn update(&self, _label: &str, progress: TransferProgress) {
            self.0.lock().unwrap().push(progress);
        }
    }

    fn record(size: u64) -> (Arc<Recorder>, Arc<TaskProgress>) {
        let recorder = Arc::new(Recorder::default());
        let task = UploadTask::new(3, "bench/03", size);
        let progress = TaskProgress::new(&task, recorder.clone());
        (recorder, progress)
    }

    #[test]
    fn percentage_of_empty_object_is_complete() {
        let progress = TransferProgress {
            task_index: 0,
            bytes_sent: 0,
            total_bytes: 0,
        };
        assert_eq!(progress.percentage(), 100.0);
    }

    #[test]
    fn percentage() {
        let progress = TransferProgress {
            task_index: 0,
            bytes_sent: 256,
            total_bytes: 1024,
        };
        assert_eq!(progress.percentage(), 25.0);
    }

    #[test]
    fn parts_are_merged() {
        let (recorder, progress) = record(100);

        let part1 = progress.tracker();
        let part2 = progress.tracker();
        part1(10);
        part2(30);
        part1(50);
        part2(50);

        assert_eq!(progress.snapshot().bytes_sent, 100);
        let sent: Vec<_> = recorder
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.bytes_sent)
            .collect();
        assert_eq!(sent, vec![10, 40, 80, 100]);
    }

    #[test]
    fn never_exceeds_total() {
        let (_recorder, progress) = record(100);

        let tracker = progress.tracker();
        tracker(80);
        tracker(250);

        assert_eq!(progress.snapshot().bytes_sent, 100);
    }

    #[test]
    fn regressions_are_ignored() {
        let (recorder, progress) = record(100);

        let tracker = progress.tracker();
        tracker(60);
        tracker(20);

        assert_eq!(progress.snapshot().bytes_sent, 60);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn complete_fills_up() {
        let (recorder, progress) = record(100);

        progress.tracker()(40);
        progress.complete();
        progress.complete();

        assert_eq!(progress.snapshot().bytes_sent, 100);
        assert_eq!(recorder.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn concurrent_parts_publish_in_order() {
        for _ in 0..50 {
            let (recorder, progress) = record(80_000);

            thread::scope(|scope| {
                for _ in 0..8 {
                    let tracker = progress.tracker();
                    scope.spawn(move || {
                        for sent in 1..=10_000 {
                            tracker(sent);
                        }
                    });
                }
            });

            let sent: Vec<_> = recorder
                .0
                .lock()
                .unwrap()
                .iter()
                .map(|p| p.bytes_sent)
                .collect();
            assert!(sent.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(sent.last(), Some(&80_000));
        }
    }
}
