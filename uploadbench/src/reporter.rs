//! Live per-object progress on the terminal.
//!
//! Every task owns one row of the terminal, addressed by its index. Updates from all running
//! transfers are sent through a channel to a single [`ProgressDisplay`] consumer, which coalesces
//! bursts and renders them through the mutex-guarded [`ProgressReporter`]. Display is best-effort:
//! write errors are logged and otherwise ignored.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uploadbench_service::progress::{ProgressSink, TransferProgress};

/// Maximum number of updates rendered in one batch.
const BATCH_SIZE: usize = 256;

/// Clears the terminal and moves the cursor to the top left.
const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// Formats the progress row of one task.
///
/// The row is addressed by `task_index + 1` and the rest of the line is cleared, so shorter
/// updates fully replace longer ones.
pub fn render_line(label: &str, progress: &TransferProgress) -> String {
    format!(
        "\x1b[{row};0H{label}  {sent} / {total}  ({percentage:.2}%)\x1b[K",
        row = progress.task_index + 1,
        sent = progress.bytes_sent,
        total = progress.total_bytes,
        percentage = progress.percentage(),
    )
}

/// Serializes writes of progress rows to one output.
#[derive(Clone)]
pub struct ProgressReporter {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter").finish_non_exhaustive()
    }
}

impl ProgressReporter {
    /// Creates a reporter writing to `out`.
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(out))),
        }
    }

    /// Creates a reporter writing to stdout.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Clears the screen before the first progress row is drawn.
    pub fn clear_screen(&self) {
        self.write(CLEAR_SCREEN);
    }

    /// Renders the row of one task.
    pub fn render(&self, label: &str, progress: &TransferProgress) {
        self.write(&render_line(label, progress));
    }

    /// Moves the cursor below the rows of `count` tasks.
    pub fn move_below(&self, count: usize) {
        self.write(&format!("\x1b[{};0H", count + 1));
    }

    fn write(&self, text: &str) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let result = out.write_all(text.as_bytes()).and_then(|()| out.flush());
        if let Err(error) = result {
            tracing::debug!(error = &error as &dyn std::error::Error, "Failed to render progress");
        }
    }
}

#[derive(Debug)]
struct Update {
    label: String,
    progress: TransferProgress,
}

/// A [`ProgressSink`] feeding a [`ProgressDisplay`].
#[derive(Clone, Debug)]
struct ChannelSink {
    updates: mpsc::UnboundedSender<Update>,
}

impl ProgressSink for ChannelSink {
    fn update(&self, label: &str, progress: TransferProgress) {
        let update = Update {
            label: label.to_owned(),
            progress,
        };
        // The display may have finished already.
        self.updates.send(update).ok();
    }
}

/// The single consumer rendering progress updates.
#[derive(Debug)]
pub struct ProgressDisplay {
    sink: Arc<ChannelSink>,
    done: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProgressDisplay {
    /// Spawns the consumer rendering to `reporter`.
    pub fn start(reporter: ProgressReporter) -> Self {
        let (updates, receiver) = mpsc::unbounded_channel();
        let done = CancellationToken::new();
        let handle = tokio::spawn(consume(receiver, reporter, done.clone()));

        Self {
            sink: Arc::new(ChannelSink { updates }),
            done,
            handle,
        }
    }

    /// Returns the sink transfers report their progress to.
    pub fn sink(&self) -> Arc<dyn ProgressSink> {
        self.sink.clone()
    }

    /// Renders all pending updates and stops the consumer.
    pub async fn finish(self) {
        self.done.cancel();
        if let Err(error) = self.handle.await {
            tracing::warn!(error = &error as &dyn std::error::Error, "Progress display failed");
        }
    }
}

async fn consume(
    mut receiver: mpsc::UnboundedReceiver<Update>,
    reporter: ProgressReporter,
    done: CancellationToken,
) {
    let mut shown = HashMap::new();
    let mut batch = Vec::with_capacity(BATCH_SIZE);

    loop {
        let finished = tokio::select! {
            biased;
            count = receiver.recv_many(&mut batch, BATCH_SIZE) => count == 0,
            _ = done.cancelled() => {
                while let Ok(update) = receiver.try_recv() {
                    batch.push(update);
                }
                true
            }
        };

        render_batch(&reporter, &mut shown, batch.drain(..));
        if finished {
            break;
        }
    }
}

/// Renders the latest update of every task in the batch, skipping updates older than what is
/// already on screen.
fn render_batch(
    reporter: &ProgressReporter,
    shown: &mut HashMap<usize, u64>,
    batch: impl Iterator<Item = Update>,
) {
    let mut latest = BTreeMap::new();
    for update in batch {
        let index = update.progress.task_index;
        let newer = latest
            .get(&index)
            .is_none_or(|current: &Update| current.progress.bytes_sent <= update.progress.bytes_sent);
        if newer {
            latest.insert(index, update);
        }
    }

    for (index, update) in latest {
        let sent = update.progress.bytes_sent;
        if shown.get(&index).is_some_and(|&previous| previous > sent) {
            continue;
        }
        shown.insert(index, sent);
        reporter.render(&update.label, &update.progress);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[derive(Clone, Debug, Default)]
    struct Screen(Arc<Mutex<Vec<u8>>>);

    impl Screen {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for Screen {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::ErrorKind::BrokenPipe.into())
        }
    }

    fn progress(task_index: usize, bytes_sent: u64, total_bytes: u64) -> TransferProgress {
        TransferProgress {
            task_index,
            bytes_sent,
            total_bytes,
        }
    }

    #[test]
    fn line_format() {
        assert_eq!(
            render_line("stress-test/02", &progress(2, 50, 200)),
            "\x1b[3;0Hstress-test/02  50 / 200  (25.00%)\x1b[K"
        );
    }

    #[test]
    fn empty_object_is_complete() {
        assert!(render_line("stress-test/00", &progress(0, 0, 0)).contains("(100.00%)"));
    }

    #[test]
    fn write_errors_are_swallowed() {
        let reporter = ProgressReporter::new(Broken);
        reporter.clear_screen();
        reporter.render("stress-test/00", &progress(0, 1, 2));
    }

    #[tokio::test]
    async fn renders_all_tasks() {
        uploadbench_test::tracing::init();
        let screen = Screen::default();
        let display = ProgressDisplay::start(ProgressReporter::new(screen.clone()));
        let sink = display.sink();

        sink.update("stress-test/00", progress(0, 10, 10));
        sink.update("stress-test/01", progress(1, 5, 10));
        display.finish().await;

        let contents = screen.contents();
        assert!(contents.contains("\x1b[1;0Hstress-test/00  10 / 10  (100.00%)"));
        assert!(contents.contains("\x1b[2;0Hstress-test/01  5 / 10  (50.00%)"));
    }

    #[tokio::test]
    async fn never_regresses() {
        let screen = Screen::default();
        let display = ProgressDisplay::start(ProgressReporter::new(screen.clone()));
        let sink = display.sink();

        sink.update("stress-test/00", progress(0, 60, 100));
        tokio::time::sleep(Duration::from_millis(10)).await;
        sink.update("stress-test/00", progress(0, 30, 100));
        sink.update("stress-test/00", progress(0, 20, 100));
        display.finish().await;

        let contents = screen.contents();
        assert!(contents.contains(" 60 / 100"));
        assert!(!contents.contains(" 30 / 100"));
        assert!(!contents.contains(" 20 / 100"));
    }

    #[test]
    fn batches_are_coalesced() {
        let screen = Screen::default();
        let reporter = ProgressReporter::new(screen.clone());
        let mut shown = HashMap::new();

        let updates = [10, 40, 70].map(|sent| Update {
            label: "stress-test/04".into(),
            progress: progress(4, sent, 100),
        });
        render_batch(&reporter, &mut shown, updates.into_iter());

        let contents = screen.contents();
        assert_eq!(contents.matches("\x1b[5;0H").count(), 1);
        assert!(contents.contains(" 70 / 100"));
        assert_eq!(shown[&4], 70);
    }

    #[test]
    fn move_below_rows() {
        let screen = Screen::default();
        ProgressReporter::new(screen.clone()).move_below(5);
        assert_eq!(screen.contents(), "\x1b[6;0H");
    }
}
