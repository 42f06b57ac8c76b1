//! Download benchmarks and the CSV experiments they are collected into.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::debug;

use crate::messages::sanitize_alphanumeric;

const CSV_HEADER: [&str; 3] = ["chunk_size", "num_chunks", "latency"];

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("experiment name {0:?} has no letters or digits")]
    InvalidName(String),

    #[error("could not write experiment: {0}")]
    Csv(#[from] csv::Error),

    #[error("could not write experiment: {0}")]
    Io(#[from] std::io::Error),
}

/// One timed download.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Benchmark {
    pub chunk_size: u32,
    pub num_chunks: u64,
    pub measured_time: Duration,
}

impl Benchmark {
    pub fn new(chunk_size: u32, num_chunks: u64, measured_time: Duration) -> Self {
        Self {
            chunk_size,
            num_chunks,
            measured_time,
        }
    }
}

impl fmt::Display for Benchmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Benchmark -> Chunk Size: {}, Number of Chunks: {}, Time: {}.",
            self.chunk_size,
            self.num_chunks,
            self.measured_time.as_secs_f64()
        )
    }
}

#[derive(Debug, Clone)]
pub struct Experiment {
    name: String,
    entries: Vec<Benchmark>,
}

impl Experiment {
    /// Names are reduced to letters and digits since they become file names.
    pub fn new(name: &str) -> Result<Self, ExperimentError> {
        let sanitized = sanitize_alphanumeric(name);
        if sanitized.is_empty() {
            return Err(ExperimentError::InvalidName(name.to_string()));
        }
        Ok(Self {
            name: sanitized,
            entries: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entries(&self) -> &[Benchmark] {
        &self.entries
    }

    pub fn add_entry(&mut self, entry: Benchmark) {
        self.entries.push(entry);
    }

    /// Writes `{dir}/{name}.csv` and returns its path.
    pub fn save_to_csv(&self, dir: &Path) -> Result<PathBuf, ExperimentError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.csv", self.name));
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(CSV_HEADER)?;
        for entry in &self.entries {
            writer.write_record([
                entry.chunk_size.to_string(),
                entry.num_chunks.to_string(),
                entry.measured_time.as_secs_f64().to_string(),
            ])?;
        }
        writer.flush()?;
        debug!(path = %path.display(), rows = self.entries.len(), "experiment saved");
        Ok(path)
    }
}
