//! Health sample sink: one JSON object per line, appended to a file.

use crate::domain::commands::TelemetryRecorder;
use crate::domain::models::TelemetrySample;
use anyhow::Context;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::info;

pub struct JsonlTelemetryRecorder {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlTelemetryRecorder {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every sample recorded at `path`.
    pub fn read_all(path: &Path) -> anyhow::Result<Vec<TelemetrySample>> {
        let contents = fs::read_to_string(path)?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }
}

impl TelemetryRecorder for JsonlTelemetryRecorder {
    fn record(&self, sample: TelemetrySample) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&sample)?;
        line.push('\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())?;
        info!(
            "{:?}: {} {}",
            sample.metric,
            sample.value,
            sample.metric.unit()
        );
        Ok(())
    }
}
