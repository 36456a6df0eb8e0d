//! Machine-readable transfer rates for external plotting.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::metrics::Report;

/// The transfer of one object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlotRecord {
    /// Index of the task.
    pub index: usize,
    /// Key of the object.
    pub key: String,
    /// Planned size of the object.
    pub size_bytes: u64,
    /// Duration of the transfer.
    pub duration_seconds: f64,
    /// Transfer rate, `None` if the transfer took no measurable time.
    pub rate_mibps: Option<f64>,
    /// Whether the object was committed.
    pub success: bool,
}

/// All records of a run, together with the average rate drawn as a reference line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlotData {
    /// One record per task in index order.
    pub records: Vec<PlotRecord>,
    /// Mean of the finite transfer rates of successful uploads.
    pub average_rate_mibps: Option<f64>,
}

impl From<&Report> for PlotData {
    fn from(report: &Report) -> Self {
        let records = report
            .results
            .iter()
            .zip(&report.aggregate.rates)
            .map(|(result, rate)| PlotRecord {
                index: result.index,
                key: result.key.clone(),
                size_bytes: result.size,
                duration_seconds: result.duration.as_secs_f64(),
                rate_mibps: rate.as_mibps(),
                success: result.is_success(),
            })
            .collect();

        Self {
            records,
            average_rate_mibps: report.aggregate.average_rate,
        }
    }
}

/// Writes the plot data of `report` as JSON to `path`.
pub fn write_plot_data(path: &Path, report: &Report) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create plot data file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &PlotData::from(report))
        .context("failed to serialize plot data")?;
    writer.flush().context("failed to write plot data")?;

    tracing::info!(path = %path.display(), "Wrote plot data");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uploadbench_service::{MIB, UploadResult, UploadTask};

    use super::*;
    use crate::metrics::MetricsAggregator;

    fn report() -> Report {
        let mut metrics = MetricsAggregator::new(3);
        let tasks: Vec<_> = (0..3)
            .map(|i| UploadTask::new(i, format!("stress-test/{i:02}"), MIB))
            .collect();
        metrics
            .record(UploadResult::success(&tasks[0], Duration::from_secs(1)))
            .unwrap();
        metrics
            .record(UploadResult::failure(&tasks[1], Duration::from_secs(2), "boom"))
            .unwrap();
        metrics
            .record(UploadResult::success(&tasks[2], Duration::ZERO))
            .unwrap();
        metrics.finish_with_wall(Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn records_per_task() {
        let data = PlotData::from(&report());

        assert_eq!(data.records.len(), 3);
        assert_eq!(
            data.records[0],
            PlotRecord {
                index: 0,
                key: "stress-test/00".into(),
                size_bytes: MIB,
                duration_seconds: 1.0,
                rate_mibps: Some(8.0),
                success: true,
            }
        );
        assert!(!data.records[1].success);
        assert_eq!(data.records[2].rate_mibps, None);
        assert_eq!(data.average_rate_mibps, Some(8.0));
    }

    #[test]
    fn written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfer_rates.json");

        write_plot_data(&path, &report()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let data: PlotData = serde_json::from_str(&contents).unwrap();
        assert_eq!(data, PlotData::from(&report()));
    }
}
