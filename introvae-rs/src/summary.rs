//! JSON-lines event log for scalar losses and parameter histograms.
//!
//! Each line of `<dir>/events.jsonl` is one event:
//!
//! ```text
//! {"kind":"scalar","step":100,"tag":"l_ae","value":0.031}
//! {"kind":"histogram","step":10,"tag":"encoder.stem.conv.weight","count":2400,"min":-0.2,...}
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// File name of the event log inside the summary directory.
pub const EVENTS_FILE: &str = "events.jsonl";

const HISTOGRAM_BUCKETS: usize = 30;

/// Distribution summary of a tensor's values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// Number of values.
    pub count: usize,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
    /// Arithmetic mean.
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    /// `(upper_edge, count)` for equal-width buckets spanning `[min, max]`.
    pub buckets: Vec<(f64, usize)>,
}

impl Histogram {
    /// Summarize a slice of values. Returns `None` for an empty slice.
    pub fn from_values(values: &[f32]) -> Option<Self> {
        let count = values.len();
        if count == 0 {
            return None;
        }
        let (mut min, mut max, mut sum) = (f64::INFINITY, f64::NEG_INFINITY, 0.0);
        for &v in values {
            let v = f64::from(v);
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        let mean = sum / count as f64;
        let var = values
            .iter()
            .map(|&v| (f64::from(v) - mean).powi(2))
            .sum::<f64>()
            / count as f64;

        let width = (max - min) / HISTOGRAM_BUCKETS as f64;
        let buckets = if width > 0.0 {
            let mut counts = vec![0usize; HISTOGRAM_BUCKETS];
            for &v in values {
                let idx = ((f64::from(v) - min) / width) as usize;
                counts[idx.min(HISTOGRAM_BUCKETS - 1)] += 1;
            }
            counts
                .into_iter()
                .enumerate()
                .map(|(i, c)| (min + width * (i + 1) as f64, c))
                .collect()
        } else {
            vec![(max, count)]
        };

        Some(Self {
            count,
            min,
            max,
            mean,
            std: var.sqrt(),
            buckets,
        })
    }

    /// Summarize every value of `tensor`.
    pub fn from_tensor(tensor: &Tensor) -> Result<Option<Self>> {
        let values = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        Ok(Self::from_values(&values))
    }
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// A named scalar.
    Scalar {
        /// Iteration.
        step: usize,
        /// Name.
        tag: String,
        /// Value.
        value: f64,
    },
    /// Distribution of a parameter tensor.
    Histogram {
        /// Iteration.
        step: usize,
        /// Parameter name.
        tag: String,
        /// Summary statistics.
        #[serde(flatten)]
        histogram: Histogram,
    },
}

/// Appends events to `<dir>/events.jsonl`.
pub struct SummaryWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl SummaryWriter {
    /// Open (or continue) the event log in `dir`, creating the directory if needed.
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(EVENTS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Path of the event log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_event(&mut self, event: &Event) -> Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    /// Record a named scalar.
    pub fn scalar(&mut self, step: usize, tag: &str, value: f64) -> Result<()> {
        self.write_event(&Event::Scalar {
            step,
            tag: tag.to_string(),
            value,
        })
    }

    /// Record a histogram of every variable in `vars`, in name order.
    pub fn histograms(&mut self, step: usize, vars: &VarMap) -> Result<()> {
        let mut named: Vec<(String, Tensor)> = {
            let data = vars.data().lock().unwrap_or_else(|e| e.into_inner());
            data.iter()
                .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
                .collect()
        };
        named.sort_by(|a, b| a.0.cmp(&b.0));

        for (tag, tensor) in named {
            if let Some(histogram) = Histogram::from_tensor(&tensor)? {
                self.write_event(&Event::Histogram {
                    step,
                    tag,
                    histogram,
                })?;
            }
        }
        Ok(())
    }

    /// Flush buffered events to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for SummaryWriter {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Read back every event of a log written by [`SummaryWriter`].
pub fn read_events<P: AsRef<Path>>(path: P) -> Result<Vec<Event>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Ok(serde_json::from_str(line)?))
        .collect()
}
