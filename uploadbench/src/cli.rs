use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use bytesize::ByteSize;
use uploadbench_service::MIB;

use crate::bench::{self, Orchestrator};
use crate::config::{Config, Storage};
use crate::observability;
use crate::reporter::ProgressReporter;

/// Uploads objects of growing size to an object store and reports the transfer rates.
///
/// Flags take precedence over the environment and the configuration file.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// number of objects to upload (default: 50)
    #[argh(option, short = 'n')]
    num_objects: Option<usize>,

    /// name of the bucket (default: testnmg)
    #[argh(option, short = 'b')]
    bucket_name: Option<String>,

    /// factor between the sizes of consecutive objects (default: 1)
    #[argh(option, short = 'r')]
    ratio: Option<f64>,

    /// size of the first object in MiB, or with a unit such as 512KiB (default: 2)
    #[argh(option, short = 's', from_str_fn(parse_size))]
    size: Option<ByteSize>,

    /// write the transfer rates of all objects for plotting
    #[argh(switch, short = 'p')]
    plot: bool,

    /// prefix of all object keys
    #[argh(option, short = 'z')]
    prefix: Option<String>,

    /// maximum number of concurrent uploads (default: 100)
    #[argh(option, short = 'w')]
    workers: Option<usize>,

    /// objects larger than this are uploaded in parts (default: 16)
    #[argh(option, from_str_fn(parse_size))]
    multipart_threshold: Option<ByteSize>,

    /// number of parts of one object uploaded concurrently (default: 5)
    #[argh(option)]
    part_concurrency: Option<usize>,

    /// stop at the first failed upload and exit with status 1
    #[argh(switch)]
    fail_fast: bool,

    /// do not show per-object progress
    #[argh(switch)]
    no_progress: bool,

    /// upload into memory instead of object storage
    #[argh(switch)]
    dry_run: bool,
}

/// Parses a size in MiB, or a size with an explicit unit.
fn parse_size(value: &str) -> Result<ByteSize, String> {
    if let Ok(mib) = value.parse::<f64>() {
        if !mib.is_finite() || mib < 0.0 {
            return Err(format!("invalid size: {value}"));
        }
        return Ok(ByteSize::b((mib * MIB as f64) as u64));
    }
    value.parse()
}

impl Args {
    /// Overrides configuration values with the flags that were given.
    ///
    /// Returns the bucket name if it was given but the selected storage has no buckets.
    fn apply(self, config: &mut Config) -> Option<String> {
        if let Some(count) = self.num_objects {
            config.objects.count = count;
        }
        if let Some(ratio) = self.ratio {
            config.objects.ratio = ratio;
        }
        if let Some(size) = self.size {
            config.objects.initial_size = size;
        }
        if let Some(prefix) = self.prefix {
            config.objects.prefix = prefix;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(threshold) = self.multipart_threshold {
            config.transfer.multipart_threshold = threshold;
        }
        if let Some(part_concurrency) = self.part_concurrency {
            config.transfer.part_concurrency = part_concurrency;
        }

        config.plot.enabled |= self.plot;
        config.fail_fast |= self.fail_fast;
        config.progress &= !self.no_progress;

        if self.dry_run && !matches!(config.storage, Storage::Memory { .. }) {
            config.storage = Storage::Memory {
                latency: Duration::ZERO,
            };
        }

        let name = self.bucket_name?;
        match &mut config.storage {
            Storage::S3 { bucket, .. } => {
                *bucket = name;
                None
            }
            Storage::Memory { .. } => Some(name),
        }
    }
}

/// Bootstrap the runtime and run the benchmark.
pub fn execute() -> Result<ExitCode> {
    let args: Args = argh::from_env();

    let mut config = Config::load(args.config.as_deref())?;
    let ignored_bucket = args.apply(&mut config);

    observability::init_tracing(&config.logging);
    if let Some(bucket) = ignored_bucket {
        tracing::warn!(%bucket, "Ignoring bucket name for in-memory storage");
    }
    tracing::debug!(?config);
    config.validate()?;

    let interactive = io::stdout().is_terminal();
    if !interactive {
        yansi::disable();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("uploadbench")
        .enable_all()
        .build()?;

    let status = runtime.block_on(async move {
        let backend = bench::make_backend(&config.storage)?;
        let progress = config.progress && interactive;

        let mut orchestrator = Orchestrator::new(config, backend);
        if progress {
            orchestrator = orchestrator.with_reporter(ProgressReporter::stdout());
        }

        let shutdown = async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "Failed to listen for interrupts"
                );
                std::future::pending::<()>().await;
            }
        };

        let outcome = orchestrator.run(shutdown, &mut io::stdout()).await?;
        anyhow::Ok(outcome.status)
    })?;

    Ok(status.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::from_args(&["uploadbench"], args).unwrap()
    }

    #[test]
    fn plain_sizes_are_mib() {
        assert_eq!(parse_size("2"), Ok(ByteSize::mib(2)));
        assert_eq!(parse_size("0.5"), Ok(ByteSize::kib(512)));
        assert_eq!(parse_size("512KiB"), Ok(ByteSize::kib(512)));
        assert!(parse_size("-1").is_err());
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn flags_override_config() {
        let mut config = Config::default();
        parse(&[
            "-n", "5", "-b", "bench", "-r", "2", "-s", "1", "-z", "tmp/", "-w", "3", "-p",
            "--part-concurrency", "2", "--fail-fast", "--no-progress",
        ])
        .apply(&mut config);

        assert_eq!(config.objects.count, 5);
        assert_eq!(config.objects.ratio, 2.0);
        assert_eq!(config.objects.initial_size, ByteSize::mib(1));
        assert_eq!(config.objects.prefix, "tmp/");
        assert_eq!(config.workers, 3);
        assert_eq!(config.transfer.part_concurrency, 2);
        assert!(config.plot.enabled);
        assert!(config.fail_fast);
        assert!(!config.progress);
        let Storage::S3 { bucket, .. } = &config.storage else {
            panic!("expected s3 storage");
        };
        assert_eq!(bucket, "bench");
    }

    #[test]
    fn missing_flags_keep_config() {
        let mut config = Config::default();
        config.workers = 7;
        config.fail_fast = true;
        parse(&[]).apply(&mut config);

        assert_eq!(config.workers, 7);
        assert!(config.fail_fast);
        assert!(config.progress);
    }

    #[test]
    fn dry_run_uses_memory() {
        let mut config = Config::default();
        let ignored = parse(&["--dry-run", "-b", "ignored"]).apply(&mut config);

        assert_eq!(ignored.as_deref(), Some("ignored"));
        assert_eq!(
            config.storage,
            Storage::Memory {
                latency: Duration::ZERO
            }
        );
    }

    #[test]
    fn dry_run_keeps_memory_latency() {
        let mut config = Config::default();
        config.storage = Storage::Memory {
            latency: Duration::from_millis(20),
        };
        let ignored = parse(&["--dry-run"]).apply(&mut config);

        assert_eq!(ignored, None);
        assert_eq!(
            config.storage,
            Storage::Memory {
                latency: Duration::from_millis(20)
            }
        );
    }
}
