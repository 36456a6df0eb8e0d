//! Configuration for the upload benchmark.
//!
//! Configuration can be loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Command line flags (see [`cli`](crate::cli))
//! 2. Environment variables (prefixed with `UB__`)
//! 3. YAML configuration file (specified via `-c` or `--config` flag)
//! 4. Defaults
//!
//! See [`Config`] for a description of all configuration fields and their defaults.
//!
//! # Environment Variables
//!
//! Environment variables use `UB__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `UB__WORKERS=20` sets the number of concurrent uploads
//! - `UB__OBJECTS__INITIAL_SIZE=64MiB` sets the size of the first object
//! - `UB__STORAGE__TYPE=memory` uploads into memory instead of a bucket
//!
//! # YAML Configuration File
//!
//! ```yaml
//! workers: 20
//!
//! objects:
//!   count: 10
//!   initial_size: 1 MiB
//!   ratio: 2
//!
//! storage:
//!   type: s3
//!   bucket: my-bucket
//!   region: eu-central-1
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use bytesize::ByteSize;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use uploadbench_service::TransferConfig;
use uploadbench_service::transfer::{
    DEFAULT_MULTIPART_THRESHOLD, DEFAULT_PART_CONCURRENCY, DEFAULT_PART_SIZE,
};

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "UB__";

/// A configuration that cannot be run.
///
/// These are reported before any object is uploaded.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// The size ratio is negative, infinite or not a number.
    #[error("invalid size ratio {0}: must be a finite number of at least 0")]
    InvalidRatio(f64),
    /// No uploads could ever run.
    #[error("the number of workers must be at least 1")]
    NoWorkers,
    /// Multipart uploads could never make progress.
    #[error("the part concurrency must be at least 1")]
    NoPartConcurrency,
    /// Multipart uploads would need infinitely many parts.
    #[error("the part size must be at least 1 byte")]
    EmptyParts,
    /// No bucket to upload into.
    #[error("the bucket name must not be empty")]
    EmptyBucket,
}

/// The objects to upload.
///
/// Used in: [`Config::objects`]
#[derive(Debug, Deserialize, Serialize)]
pub struct Objects {
    /// Number of objects to upload.
    ///
    /// # Default
    ///
    /// `50`
    ///
    /// # Environment Variable
    ///
    /// `UB__OBJECTS__COUNT`
    pub count: usize,

    /// Size of the first object.
    ///
    /// # Default
    ///
    /// `2 MiB`
    ///
    /// # Environment Variable
    ///
    /// `UB__OBJECTS__INITIAL_SIZE`
    pub initial_size: ByteSize,

    /// Factor between the sizes of consecutive objects.
    ///
    /// Object `i` has a size of `initial_size * ratio^i`. A ratio of `0` makes all but the first
    /// object empty.
    ///
    /// # Default
    ///
    /// `1.0`
    ///
    /// # Environment Variable
    ///
    /// `UB__OBJECTS__RATIO`
    pub ratio: f64,

    /// Prepended to all object keys.
    ///
    /// Keys have the form `<prefix>stress-test/<index>`, where the index has at least two digits.
    ///
    /// # Default
    ///
    /// `""`
    ///
    /// # Environment Variable
    ///
    /// `UB__OBJECTS__PREFIX`
    pub prefix: String,
}

impl Default for Objects {
    fn default() -> Self {
        Self {
            count: 50,
            initial_size: ByteSize::mib(2),
            ratio: 1.0,
            prefix: String::new(),
        }
    }
}

/// Tuning of single object transfers.
///
/// Used in: [`Config::transfer`]
#[derive(Debug, Deserialize, Serialize)]
pub struct Transfer {
    /// Objects larger than this are uploaded in parts.
    ///
    /// # Default
    ///
    /// `16 MiB`
    ///
    /// # Environment Variable
    ///
    /// `UB__TRANSFER__MULTIPART_THRESHOLD`
    pub multipart_threshold: ByteSize,

    /// Size of each part of a multipart upload.
    ///
    /// S3 requires at least 5 MiB for all but the last part.
    ///
    /// # Default
    ///
    /// `8 MiB`
    ///
    /// # Environment Variable
    ///
    /// `UB__TRANSFER__PART_SIZE`
    pub part_size: ByteSize,

    /// Number of parts of one object uploaded concurrently.
    ///
    /// Together with [`Config::workers`], this bounds the number of concurrent requests to
    /// `workers * part_concurrency`.
    ///
    /// # Default
    ///
    /// `5`
    ///
    /// # Environment Variable
    ///
    /// `UB__TRANSFER__PART_CONCURRENCY`
    pub part_concurrency: usize,
}

impl Default for Transfer {
    fn default() -> Self {
        Self {
            multipart_threshold: ByteSize::b(DEFAULT_MULTIPART_THRESHOLD),
            part_size: ByteSize::b(DEFAULT_PART_SIZE),
            part_concurrency: DEFAULT_PART_CONCURRENCY,
        }
    }
}

/// Storage backend configuration.
///
/// The `type` field in YAML or `__TYPE` in environment variables determines which variant is used.
///
/// Used in: [`Config::storage`]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Storage {
    /// Amazon S3 or an S3-compatible service (type `"s3"`).
    ///
    /// Credentials are resolved from the environment, the AWS profile files, or the instance
    /// metadata service.
    ///
    /// # Example
    ///
    /// ```yaml
    /// storage:
    ///   type: s3
    ///   bucket: testnmg
    ///   region: us-east-1
    /// ```
    S3 {
        /// Name of the bucket. It must exist before the benchmark runs.
        ///
        /// # Environment Variable
        ///
        /// `UB__STORAGE__BUCKET`
        bucket: String,

        /// AWS region of the bucket.
        ///
        /// # Environment Variable
        ///
        /// `UB__STORAGE__REGION`
        region: String,

        /// Custom endpoint URL, for example `http://localhost:9000` for MinIO.
        ///
        /// # Environment Variable
        ///
        /// `UB__STORAGE__ENDPOINT`
        #[serde(default)]
        endpoint: Option<String>,

        /// Named profile from the AWS credentials file.
        ///
        /// # Environment Variable
        ///
        /// `UB__STORAGE__PROFILE`
        #[serde(default)]
        profile: Option<String>,
    },

    /// Discards all uploads after counting their bytes (type `"memory"`).
    ///
    /// Useful to measure the overhead of the benchmark itself.
    Memory {
        /// Artificial latency added to every request.
        ///
        /// # Environment Variable
        ///
        /// `UB__STORAGE__LATENCY`
        #[serde(default, with = "humantime_serde")]
        latency: Duration,
    },
}

impl Default for Storage {
    fn default() -> Self {
        Storage::S3 {
            bucket: "testnmg".into(),
            region: "us-east-1".into(),
            endpoint: None,
            profile: None,
        }
    }
}

/// Output of per-object transfer rates for external plotting.
///
/// Used in: [`Config::plot`]
#[derive(Debug, Deserialize, Serialize)]
pub struct Plot {
    /// Write plot data after the run.
    ///
    /// # Default
    ///
    /// `false`
    ///
    /// # Environment Variable
    ///
    /// `UB__PLOT__ENABLED`
    pub enabled: bool,

    /// Path of the JSON document.
    ///
    /// # Default
    ///
    /// `transfer_rates.json`
    ///
    /// # Environment Variable
    ///
    /// `UB__PLOT__PATH`
    pub path: PathBuf,
}

impl Default for Plot {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("transfer_rates.json"),
        }
    }
}

/// Log output format.
///
/// Controls how log messages are formatted. The format can be explicitly specified or
/// auto-detected based on whether output is to a TTY.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    Pretty,

    /// Simplified plain text output.
    Simplified,

    /// Dump out JSON lines.
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format: expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl std::str::FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
}

impl std::error::Error for FormatParseError {}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Logs are always written to stderr, so they do not interfere with the progress display and the
/// report on stdout.
///
/// Used in: [`Config::logging`]
#[derive(Debug, Deserialize, Serialize)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// The `RUST_LOG` environment variable takes precedence and allows per-module control.
    ///
    /// # Default
    ///
    /// `WARN`
    ///
    /// # Environment Variable
    ///
    /// `UB__LOGGING__LEVEL`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format.
    ///
    /// # Default
    ///
    /// `Auto` (pretty for TTY, simplified otherwise)
    ///
    /// # Environment Variable
    ///
    /// `UB__LOGGING__FORMAT`
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::WARN,
            format: LogFormat::Auto,
        }
    }
}

/// Main configuration struct for the upload benchmark.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// The objects to upload.
    pub objects: Objects,

    /// Maximum number of objects uploaded concurrently.
    ///
    /// # Default
    ///
    /// `100`
    ///
    /// # Environment Variable
    ///
    /// `UB__WORKERS`
    pub workers: usize,

    /// Tuning of single object transfers.
    pub transfer: Transfer,

    /// Where objects are uploaded to.
    pub storage: Storage,

    /// Stop at the first failed upload and exit with a nonzero status.
    ///
    /// Uploads still running are cancelled, objects not yet started are skipped.
    ///
    /// # Default
    ///
    /// `false`
    ///
    /// # Environment Variable
    ///
    /// `UB__FAIL_FAST`
    pub fail_fast: bool,

    /// Time running uploads get to finish after an interrupt before they are cancelled.
    ///
    /// # Default
    ///
    /// `30s`
    ///
    /// # Environment Variable
    ///
    /// `UB__SHUTDOWN_GRACE`
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Show per-object progress while uploading.
    ///
    /// Progress is never shown if stdout is not a terminal.
    ///
    /// # Default
    ///
    /// `true`
    ///
    /// # Environment Variable
    ///
    /// `UB__PROGRESS`
    pub progress: bool,

    /// Output of transfer rates for plotting.
    pub plot: Plot,

    /// Logging configuration.
    pub logging: Logging,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            objects: Objects::default(),
            workers: 100,
            transfer: Transfer::default(),
            storage: Storage::default(),
            fail_fast: false,
            shutdown_grace: Duration::from_secs(30),
            progress: true,
            plot: Plot::default(),
            logging: Logging::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the provided arguments.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if provided)
    /// 3. Environment variables (prefixed with `UB__`)
    ///
    /// Command line flags are applied by the caller on top of the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML configuration file cannot be read or parsed, or if environment
    /// variables contain invalid values. The result is not validated, see [`Config::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Checks that the benchmark can run with this configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratio = self.objects.ratio;
        if !ratio.is_finite() || ratio < 0.0 {
            return Err(ConfigError::InvalidRatio(ratio));
        }
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.transfer.part_concurrency == 0 {
            return Err(ConfigError::NoPartConcurrency);
        }
        if self.transfer.part_size.as_u64() == 0 {
            return Err(ConfigError::EmptyParts);
        }
        if let Storage::S3 { bucket, .. } = &self.storage {
            if bucket.is_empty() {
                return Err(ConfigError::EmptyBucket);
            }
        }

        Ok(())
    }

    /// Returns the settings for single object transfers.
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            multipart_threshold: self.transfer.multipart_threshold.as_u64(),
            part_size: self.transfer.part_size.as_u64(),
            part_concurrency: self.transfer.part_concurrency,
        }
    }
}
