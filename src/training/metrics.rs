use log::{debug, info};
use ndarray::ArrayD;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::model::ModelState;
use crate::utils::io::{self, IoError};

/// Flat map of named scalars reported at each logging interval
pub type TrainResults = BTreeMap<String, f64>;

/// Steps and wall time since the previous logging interval
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    pub steps: usize,
    pub elapsed_secs: f64,
}

/// Running metrics over a fixed window of the most recent steps
#[derive(Debug, Clone)]
pub struct Metrics {
    window: usize,
    values: BTreeMap<String, VecDeque<f64>>,
    steps: usize,
    interval_start: Instant,
}

impl Metrics {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            values: BTreeMap::new(),
            steps: 0,
            interval_start: Instant::now(),
        }
    }

    pub fn save_value(&mut self, name: &str, value: f64) {
        let window = self.window;
        let values = self.values.entry(name.to_string()).or_default();
        values.push_back(value);
        while values.len() > window {
            values.pop_front();
        }
    }

    /// Latest value of `name`, 0 if never recorded
    pub fn get_value(&self, name: &str) -> f64 {
        self.values
            .get(name)
            .and_then(|v| v.back().copied())
            .unwrap_or(0.0)
    }

    pub fn running_mean(&self, name: &str) -> f64 {
        match self.values.get(name) {
            Some(values) if !values.is_empty() => values.iter().sum::<f64>() / values.len() as f64,
            _ => 0.0,
        }
    }

    pub fn record_step(&mut self) {
        self.steps += 1;
    }

    /// Returns the current interval and starts a new one
    pub fn take_interval(&mut self) -> Interval {
        let interval = Interval {
            steps: self.steps,
            elapsed_secs: self.interval_start.elapsed().as_secs_f64(),
        };
        self.steps = 0;
        self.interval_start = Instant::now();
        interval
    }
}

/// Fixed-width histogram of one parameter tensor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Histogram {
    pub name: String,
    pub min: f32,
    pub max: f32,
    pub counts: Vec<usize>,
}

impl Histogram {
    pub fn from_values(name: &str, values: &ArrayD<f32>, bins: usize) -> Self {
        let bins = bins.max(1);
        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut counts = vec![0; bins];
        if values.is_empty() {
            return Self {
                name: name.to_string(),
                min: 0.0,
                max: 0.0,
                counts,
            };
        }
        let width = (max - min) / bins as f32;
        for &v in values.iter() {
            let bin = if width > 0.0 {
                (((v - min) / width) as usize).min(bins - 1)
            } else {
                0
            };
            counts[bin] += 1;
        }
        Self {
            name: name.to_string(),
            min,
            max,
            counts,
        }
    }
}

pub const HISTOGRAM_BINS: usize = 64;

pub fn model_histograms(state: &ModelState) -> Vec<Histogram> {
    state
        .iter()
        .map(|(name, values)| Histogram::from_values(name, values, HISTOGRAM_BINS))
        .collect()
}

/// Destination of reported training results
pub trait MetricsSink {
    fn log_train_results(&mut self, results: &TrainResults) -> Result<(), IoError>;

    fn log_validation_results(&mut self, results: &TrainResults) -> Result<(), IoError>;

    fn log_histogram(&mut self, _state: &ModelState) -> Result<(), IoError> {
        Ok(())
    }
}

fn format_results(results: &TrainResults) -> String {
    results
        .iter()
        .map(|(k, v)| format!("{}: {:.4}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Writes results through the `log` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn log_train_results(&mut self, results: &TrainResults) -> Result<(), IoError> {
        info!("{}", format_results(results));
        Ok(())
    }

    fn log_validation_results(&mut self, results: &TrainResults) -> Result<(), IoError> {
        info!("Validation {}", format_results(results));
        Ok(())
    }

    fn log_histogram(&mut self, state: &ModelState) -> Result<(), IoError> {
        for histogram in model_histograms(state) {
            debug!(
                "{}: [{:.4}, {:.4}] {:?}",
                histogram.name, histogram.min, histogram.max, histogram.counts
            );
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct Record<'a, T: Serialize> {
    kind: &'a str,
    #[serde(flatten)]
    values: T,
}

/// Appends one JSON object per report to a file
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write<T: Serialize>(&self, kind: &str, values: T) -> Result<(), IoError> {
        let line = serde_json::to_string(&Record { kind, values })?;
        io::append_line(&self.path, &line)
    }
}

impl MetricsSink for JsonLinesSink {
    fn log_train_results(&mut self, results: &TrainResults) -> Result<(), IoError> {
        self.write("train", results)
    }

    fn log_validation_results(&mut self, results: &TrainResults) -> Result<(), IoError> {
        self.write("validation", results)
    }

    fn log_histogram(&mut self, state: &ModelState) -> Result<(), IoError> {
        for histogram in model_histograms(state) {
            self.write("histogram", &histogram)?;
        }
        Ok(())
    }
}
