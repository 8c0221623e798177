//! Planner-fed estimation
//!
//! When the firmware's motion planner is full, print instructions take
//! noticeably longer to be confirmed. The estimator tracks a high percentile
//! of recent confirmation latencies with two ordered sets over a sliding
//! window and reports "fed" whenever the latest latency lands above it.
//!
//! Until the window fills, a fallback threshold is used. It can be persisted
//! between runs as a single floating-point number of seconds.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Planner-fed estimator settings
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerConfig {
    /// Number of latencies in the sliding window
    pub window_size: usize,
    /// Share of the window kept below the threshold
    pub heap_ratio: f64,
    /// Latencies above this are ignored
    pub ignore_above: Duration,
    /// Threshold used until the window is full
    pub default_threshold: Duration,
    /// Whether the threshold adapts and is persisted
    pub dynamic_threshold: bool,
    /// File holding the persisted threshold
    pub threshold_path: Option<PathBuf>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            window_size: 10_000,
            heap_ratio: 0.95,
            ignore_above: Duration::from_secs(1),
            default_threshold: Duration::from_millis(130),
            dynamic_threshold: true,
            threshold_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Sample {
    value: Duration,
    sequence: u64,
}

/// Streaming percentile gate over confirmation latencies
#[derive(Debug)]
pub struct PlannerFedEstimator {
    config: PlannerConfig,
    default_threshold: Duration,
    window: VecDeque<Sample>,
    short_times: BTreeSet<Sample>,
    long_times: BTreeSet<Sample>,
    next_sequence: u64,
    is_fed: bool,
}

impl PlannerFedEstimator {
    /// Create an estimator with an empty window
    pub fn new(config: PlannerConfig) -> Self {
        let default_threshold = config.default_threshold;
        Self {
            config,
            default_threshold,
            window: VecDeque::new(),
            short_times: BTreeSet::new(),
            long_times: BTreeSet::new(),
            next_sequence: 0,
            is_fed: false,
        }
    }

    /// Whether the most recent latency exceeded the threshold
    pub fn is_fed(&self) -> bool {
        self.is_fed
    }

    /// Forget the fed verdict until the next observation
    pub fn invalidate(&mut self) {
        self.is_fed = false;
    }

    /// Number of latencies in the window
    pub fn item_count(&self) -> usize {
        self.window.len()
    }

    fn is_window_full(&self) -> bool {
        self.window.len() >= self.config.window_size
    }

    /// The fallback threshold in use
    pub fn default_threshold(&self) -> Duration {
        self.default_threshold
    }

    /// Current threshold
    pub fn threshold(&self) -> Duration {
        if !self.config.dynamic_threshold || !self.is_window_full() {
            return self.default_threshold;
        }
        self.dynamic_threshold()
    }

    fn short_root(&self) -> Option<Duration> {
        self.short_times.last().map(|sample| sample.value)
    }

    fn long_root(&self) -> Option<Duration> {
        self.long_times.first().map(|sample| sample.value)
    }

    fn dynamic_threshold(&self) -> Duration {
        match (self.short_root(), self.long_root()) {
            (Some(short), Some(long)) => (short + long) / 2,
            (Some(root), None) | (None, Some(root)) => root,
            (None, None) => Duration::MAX,
        }
    }

    /// Record a confirmation latency
    pub fn observe(&mut self, value: Duration) {
        if value > self.config.ignore_above {
            return;
        }

        if self.config.window_size > 0 && self.is_window_full() {
            self.evict_oldest();
        }
        self.add(value);

        self.is_fed = value > self.threshold();
        if self.is_fed {
            tracing::trace!(
                "Planner fed, threshold {:?}, value {:?}",
                self.threshold(),
                value
            );
        }
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self.window.pop_front() {
            if !self.short_times.remove(&oldest) {
                self.long_times.remove(&oldest);
            }
            self.balance();
        }
    }

    fn add(&mut self, value: Duration) {
        let sample = Sample {
            value,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;

        match (self.short_root(), self.long_root()) {
            (None, None) => {
                self.short_times.insert(sample);
            }
            (None, Some(long)) => {
                if value > long {
                    if let Some(smaller) = self.long_times.pop_first() {
                        self.short_times.insert(smaller);
                    }
                    self.long_times.insert(sample);
                } else {
                    self.short_times.insert(sample);
                }
            }
            (Some(short), None) => {
                if short > value {
                    if let Some(larger) = self.short_times.pop_last() {
                        self.long_times.insert(larger);
                    }
                    self.short_times.insert(sample);
                } else {
                    self.long_times.insert(sample);
                }
            }
            (Some(_), Some(_)) => {
                if value < self.dynamic_threshold() {
                    self.short_times.insert(sample);
                } else {
                    self.long_times.insert(sample);
                }
                self.balance();
            }
        }
        self.window.push_back(sample);
    }

    fn balance(&mut self) {
        let total = self.short_times.len() + self.long_times.len();
        let ideal_short = (total as f64 * self.config.heap_ratio).round() as usize;
        let short = self.short_times.len();

        if short + 1 < ideal_short {
            if let Some(moved) = self.long_times.pop_first() {
                self.short_times.insert(moved);
            }
        } else if short > ideal_short + 1 {
            if let Some(moved) = self.short_times.pop_last() {
                self.long_times.insert(moved);
            }
        }
    }

    /// Replace the fallback threshold with the one persisted at `path`
    ///
    /// A missing or unreadable file keeps the configured default.
    pub fn load_default_threshold(&mut self, path: &Path) {
        if !self.config.dynamic_threshold {
            return;
        }
        match fs::read_to_string(path) {
            Ok(content) => match content.trim().parse::<f64>() {
                Ok(seconds) if seconds.is_finite() && seconds > 0.0 => {
                    self.default_threshold = Duration::from_secs_f64(seconds);
                    tracing::debug!(
                        "Loaded planner threshold {:?} from {}",
                        self.default_threshold,
                        path.display()
                    );
                }
                _ => tracing::warn!("Ignoring malformed threshold file {}", path.display()),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to read threshold file {}: {}", path.display(), e),
        }
    }

    /// Persist the dynamic threshold to `path`
    ///
    /// Writes nothing until the window is full. Returns whether a value was
    /// written.
    pub fn save(&self, path: &Path) -> io::Result<bool> {
        if !self.config.dynamic_threshold || !self.is_window_full() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.dynamic_threshold().as_secs_f64().to_string())?;
        Ok(true)
    }

    /// Check the ordering and size invariants of the two sets
    pub fn is_balanced(&self) -> bool {
        let total = self.short_times.len() + self.long_times.len();
        let ideal_short = (total as f64 * self.config.heap_ratio).round() as i64;
        let short = self.short_times.len() as i64;
        let ordered = match (self.short_root(), self.long_root()) {
            (Some(short_root), Some(long_root)) => short_root <= long_root,
            _ => true,
        };
        ordered && (short - ideal_short).abs() <= 1 && total == self.window.len()
    }
}

impl Default for PlannerFedEstimator {
    fn default() -> Self {
        Self::new(PlannerConfig::default())
    }
}
