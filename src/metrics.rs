//! Timing samples and the reported result line.

use std::time::Duration;

use serde::Serialize;

use crate::{bench::Strategy, params::Params};

/// Wall-clock duration of each repetition, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timings {
    samples: Vec<Duration>,
}

impl Timings {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            samples: Vec::with_capacity(n),
        }
    }

    pub fn record(&mut self, sample: Duration) {
        self.samples.push(sample);
    }

    pub fn samples(&self) -> &[Duration] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn total(&self) -> Duration {
        self.samples.iter().sum()
    }

    pub fn mean_us(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.total().as_secs_f64() * 1e6 / self.samples.len() as f64
    }
}

/// Bytes per buffer element.
pub const ELEMENT_SIZE: usize = std::mem::size_of::<f64>();

/// Result of one benchmark run.
#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub epochs: usize,
    pub streams: usize,
    pub kernels_per_stream: usize,
    pub array_size: usize,
    pub block_dim: u32,
    pub multithreaded: bool,
    /// Bytes per microsecond (MB/s).
    pub throughput: f64,
    pub strategy: Strategy,
    pub backend: String,
    pub repetitions: usize,
    pub mean_us: f64,
    pub total_us: f64,
    pub samples_us: Vec<f64>,
}

impl BenchReport {
    pub fn new(
        params: &Params,
        strategy: Strategy,
        multithreaded: bool,
        backend: &str,
        timings: &Timings,
    ) -> Self {
        let mean_us = timings.mean_us();
        Self {
            epochs: params.epochs(),
            streams: params.slots(),
            kernels_per_stream: params.kernels_per_slot(),
            array_size: params.total_elements(),
            block_dim: params.launch_width(),
            multithreaded,
            throughput: throughput(params.epochs(), params.total_elements(), mean_us),
            strategy,
            backend: backend.to_string(),
            repetitions: timings.len(),
            mean_us,
            total_us: timings.total().as_secs_f64() * 1e6,
            samples_us: timings
                .samples()
                .iter()
                .map(|d| d.as_secs_f64() * 1e6)
                .collect(),
        }
    }

    /// `epochs, streams, kernels_per_stream, array_size, block_dim,
    /// multithreaded, throughput`
    pub fn csv_line(&self) -> String {
        format!(
            "{}, {}, {}, {}, {}, {}, {:.3}",
            self.epochs,
            self.streams,
            self.kernels_per_stream,
            self.array_size,
            self.block_dim,
            u8::from(self.multithreaded),
            self.throughput
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Bytes moved per microsecond by `epochs` passes over `array_size` elements.
pub fn throughput(epochs: usize, array_size: usize, elapsed_us: f64) -> f64 {
    if elapsed_us <= 0.0 {
        return 0.0;
    }
    (epochs * array_size * ELEMENT_SIZE) as f64 / elapsed_us
}
