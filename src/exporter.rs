use crate::sample::{MachineTime, Sample, GAUGE_COUNT};
use crate::storage;
use anyhow::Result;
use chrono::{Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

const GAUGE_CHANNELS: [&str; 3] = ["ionization", "convection_1", "convection_2"];

/// Metadata about an exported run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub export_id: String,
    pub run_number: u32,
    pub source: PathBuf,
    pub output: PathBuf,
    pub exported_at: chrono::DateTime<Local>,
    pub num_records: u64,
    pub remote_clock: Option<MachineTime>,
    pub local_clock: MachineTime,
}

pub fn default_output_path(run_file: &Path) -> PathBuf {
    run_file.with_extension("csv")
}

/// Export a run file to CSV, one row per sample, with a manifest beside it.
pub async fn export_run(run_file: &Path, output: &Path) -> Result<ExportManifest> {
    tracing::info!("exporting {} to {}", run_file.display(), output.display());

    let (header, samples) = storage::replay(run_file).await?;

    let mut csv = csv_header();
    for sample in &samples {
        csv.push_str(&csv_row(sample));
    }
    tokio::fs::write(output, csv).await?;

    let manifest = ExportManifest {
        export_id: format!("run-{:04}-csv", header.run_number),
        run_number: header.run_number,
        source: run_file.to_path_buf(),
        output: output.to_path_buf(),
        exported_at: Local::now(),
        num_records: samples.len() as u64,
        remote_clock: header.remote_clock,
        local_clock: header.local_clock,
    };

    let manifest_path = output.with_extension("manifest.json");
    let manifest_json = serde_json::to_string_pretty(&manifest)?;
    tokio::fs::write(&manifest_path, manifest_json).await?;

    tracing::info!("csv export complete: {} rows", manifest.num_records);
    Ok(manifest)
}

fn csv_header() -> String {
    let mut line = String::from("timestamp,baratron_pressure");
    for gauge in 1..=GAUGE_COUNT {
        for channel in GAUGE_CHANNELS {
            let _ = write!(line, ",gauge{}_{}", gauge, channel);
        }
    }
    line.push('\n');
    line
}

fn csv_row(sample: &Sample) -> String {
    let mut line = format!(
        "{},{}",
        sample.timestamp.to_rfc3339_opts(SecondsFormat::Secs, false),
        sample.baratron_pressure
    );
    for row in sample.hippo_matrix() {
        for value in row {
            let _ = write!(line, ",{}", value);
        }
    }
    line.push('\n');
    line
}
