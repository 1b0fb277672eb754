//! Progress telemetry.
//!
//! The engine reports progress as a fraction within a slice plus slice and
//! batch counters, as often as it likes. [`ProgressAggregator`] turns each raw
//! [`ProgressSample`] into a [`ProgressReport`] with overall progress,
//! throughput and an ETA. Throughput and ETA are only recomputed once per
//! [`RECOMPUTE_INTERVAL`]; in between, reports carry the previous values.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Minimum wall-clock time between two throughput/ETA recomputations.
pub const RECOMPUTE_INTERVAL: Duration = Duration::from_secs(1);

/// Phase of engine work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Operation {
    #[default]
    Idle = 0,
    Sampling = 1,
    Rendering = 2,
    StoringBuffer = 3,
}

impl Operation {
    /// Decode an engine operation code. Unknown codes read as `Idle`.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Operation::Sampling,
            2 => Operation::Rendering,
            3 => Operation::StoringBuffer,
            0 => Operation::Idle,
            other => {
                log::warn!("Unknown engine operation code {}", other);
                Operation::Idle
            }
        }
    }

    /// Short human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            Operation::Idle => "Idle",
            Operation::Sampling => "Creating image",
            Operation::Rendering => "Rendering",
            Operation::StoringBuffer => "Storing buckets",
        }
    }
}

/// One raw progress callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub slice_fraction: f64,
    pub slice_index: i32,
    pub slice_count: i32,
    pub batch_index: i32,
    pub batch_count: i32,
}

impl ProgressSample {
    pub fn new(
        slice_fraction: f64,
        slice_index: i32,
        slice_count: i32,
        batch_index: i32,
        batch_count: i32,
    ) -> Self {
        Self {
            slice_fraction,
            slice_index,
            slice_count,
            batch_index,
            batch_count,
        }
    }

    /// `(slice_index + slice_fraction) / slice_count`, clamped to `[0, 1]`.
    ///
    /// A non-positive slice count is read as one slice.
    pub fn total_progress(&self) -> f64 {
        let slices = self.slice_count.max(1) as f64;
        let total = (self.slice_index as f64 + self.slice_fraction) / slices;
        if total.is_nan() {
            0.0
        } else {
            total.clamp(0.0, 1.0)
        }
    }
}

/// Derived, observer-facing progress.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub total_progress: f64,
    pub slice_progress: f64,
    pub slice_index: i32,
    pub slice_count: i32,
    pub batch_index: i32,
    pub batch_count: i32,
    pub operation: Operation,
    /// Zero when no estimate is available.
    pub estimated_time_remaining: Duration,
    pub samples_per_second: f64,
}

impl ProgressReport {
    pub fn can_estimate_time_remaining(&self) -> bool {
        self.estimated_time_remaining > Duration::ZERO
    }
}

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Time since an arbitrary, fixed origin.
    fn now(&self) -> Duration;
}

/// [`Clock`] backed by [`Instant`].
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// [`Clock`] that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Image size and sample density a render was started with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputBasis {
    pub width: i32,
    pub height: i32,
    pub samples_per_pixel: f64,
}

impl ThroughputBasis {
    fn total_samples(&self) -> f64 {
        self.width as f64 * self.height as f64 * self.samples_per_pixel
    }
}

/// Turns raw samples into rate-limited reports.
///
/// The aggregator is shared between the dispatcher thread (which feeds it
/// samples) and the render thread (which starts and finishes it), so the
/// session keeps it behind a mutex; that same mutex guards the elapsed-time
/// baseline.
pub struct ProgressAggregator {
    clock: std::sync::Arc<dyn Clock>,
    basis: ThroughputBasis,
    operation: Operation,
    /// Start of the current recomputation window.
    window_start: Duration,
    previous_progress: f64,
    previous_eta: Duration,
    previous_throughput: f64,
    last_reported: f64,
    /// Batch the monotonic floor applies to.
    last_batch_index: i32,
    last_slice_count: i32,
    last_batch_count: i32,
}

impl std::fmt::Debug for ProgressAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressAggregator")
            .field("operation", &self.operation)
            .field("previous_progress", &self.previous_progress)
            .field("previous_throughput", &self.previous_throughput)
            .finish_non_exhaustive()
    }
}

impl ProgressAggregator {
    pub fn new(clock: std::sync::Arc<dyn Clock>) -> Self {
        let window_start = clock.now();
        Self {
            clock,
            basis: ThroughputBasis {
                width: 0,
                height: 0,
                samples_per_pixel: 0.0,
            },
            operation: Operation::Idle,
            window_start,
            previous_progress: 0.0,
            previous_eta: Duration::ZERO,
            previous_throughput: 0.0,
            last_reported: 0.0,
            last_batch_index: 0,
            last_slice_count: 1,
            last_batch_count: 1,
        }
    }

    /// Prepare for a new render.
    pub fn begin(&mut self, basis: ThroughputBasis) {
        self.basis = basis;
        self.window_start = self.clock.now();
        self.previous_progress = 0.0;
        self.previous_eta = Duration::ZERO;
        self.last_reported = 0.0;
        self.last_batch_index = 0;
        self.last_slice_count = 1;
        self.last_batch_count = 1;
    }

    /// Time since the current recomputation window opened.
    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_sub(self.window_start)
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Record an operation change. A new phase restarts its own progress, so
    /// this also resets the progress baseline.
    pub fn set_operation(&mut self, operation: Operation) {
        self.operation = operation;
        self.reset_baseline();
    }

    fn reset_baseline(&mut self) {
        self.previous_progress = 0.0;
        self.last_reported = 0.0;
    }

    /// Produce the report for one raw sample.
    pub fn ingest(&mut self, sample: ProgressSample) -> ProgressReport {
        self.last_slice_count = sample.slice_count.max(1);
        self.last_batch_count = sample.batch_count.max(1);

        let mut total = sample.total_progress();
        if total.abs() < f64::EPSILON || sample.batch_index != self.last_batch_index {
            self.reset_baseline();
        }
        self.last_batch_index = sample.batch_index;
        // Within one batch, out-of-order samples never move the reported
        // progress backwards.
        total = total.max(self.last_reported);
        self.last_reported = total;

        let elapsed = self.elapsed();
        if elapsed >= RECOMPUTE_INTERVAL {
            let seconds = elapsed.as_secs_f64();
            let delta = (total - self.previous_progress).max(0.0);

            let throughput = self.basis.total_samples() * delta / seconds;
            let eta = if seconds * delta > 0.0 {
                Duration::try_from_secs_f64(seconds * (1.0 - total) / (seconds * delta))
                    .unwrap_or(Duration::MAX)
            } else {
                Duration::ZERO
            };

            self.previous_progress = total;
            self.previous_eta = eta;
            self.previous_throughput = throughput;
            self.window_start = self.clock.now();
        }

        self.report(sample, total, self.previous_eta)
    }

    /// The report emitted once the render call returns.
    pub fn finish(&mut self) -> ProgressReport {
        let slices = self.last_slice_count;
        let batches = self.last_batch_count;
        self.last_reported = 1.0;
        self.report(
            ProgressSample::new(1.0, slices, slices, batches, batches),
            1.0,
            Duration::ZERO,
        )
    }

    fn report(&self, sample: ProgressSample, total: f64, eta: Duration) -> ProgressReport {
        ProgressReport {
            total_progress: total,
            slice_progress: sample.slice_fraction,
            slice_index: sample.slice_index,
            slice_count: sample.slice_count,
            batch_index: sample.batch_index,
            batch_count: sample.batch_count,
            operation: self.operation,
            estimated_time_remaining: eta,
            samples_per_second: self.previous_throughput,
        }
    }
}
