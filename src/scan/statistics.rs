//! Per-object call timing collected during a scan run.
//!
//! Every lifecycle call is timed and recorded under `<object>.<operation>`
//! (for example `timer.start`, `diode.trigger`, `timer.trigger_slaves`).

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Timing summary of one `<object>.<operation>` key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CallStats {
    /// Number of calls
    pub count: usize,
    /// Fastest call
    pub min: Duration,
    /// Mean duration
    pub mean: Duration,
    /// Slowest call
    pub max: Duration,
    /// Population standard deviation
    pub std: Duration,
    /// Sum of all calls
    pub total: Duration,
}

impl CallStats {
    fn from_samples(samples: &[Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let secs: Vec<f64> = samples.iter().map(Duration::as_secs_f64).collect();
        let n = secs.len() as f64;
        let total: f64 = secs.iter().sum();
        let mean = total / n;
        let variance = secs.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            count: samples.len(),
            min: samples.iter().copied().min().unwrap_or_default(),
            mean: Duration::from_secs_f64(mean),
            max: samples.iter().copied().max().unwrap_or_default(),
            std: Duration::from_secs_f64(variance.sqrt()),
            total: samples.iter().sum(),
        })
    }
}

/// Timing summaries of a finished (or running) scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanStatistics {
    calls: BTreeMap<String, CallStats>,
}

impl ScanStatistics {
    /// Summary for one object and operation
    pub fn get(&self, object: &str, operation: &str) -> Option<&CallStats> {
        self.calls.get(&format!("{}.{}", object, operation))
    }

    /// All summaries keyed by `<object>.<operation>`
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CallStats)> {
        self.calls.iter().map(|(key, stats)| (key.as_str(), stats))
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// True when nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

impl fmt::Display for ScanStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<32} {:>6} {:>12} {:>12} {:>12} {:>12}",
            "call", "count", "min", "mean", "max", "std"
        )?;
        for (key, s) in &self.calls {
            writeln!(
                f,
                "{:<32} {:>6} {:>12} {:>12} {:>12} {:>12}",
                key,
                s.count,
                format!("{:?}", s.min),
                format!("{:?}", s.mean),
                format!("{:?}", s.max),
                format!("{:?}", s.std)
            )?;
        }
        Ok(())
    }
}

/// Collects raw call durations while a scan runs.
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    samples: Mutex<BTreeMap<String, Vec<Duration>>>,
}

impl StatsRecorder {
    pub(crate) fn record(&self, object: &str, operation: &str, elapsed: Duration) {
        self.samples
            .lock()
            .entry(format!("{}.{}", object, operation))
            .or_default()
            .push(elapsed);
    }

    pub(crate) fn snapshot(&self) -> ScanStatistics {
        let calls = self
            .samples
            .lock()
            .iter()
            .filter_map(|(key, samples)| {
                CallStats::from_samples(samples).map(|stats| (key.clone(), stats))
            })
            .collect();
        ScanStatistics { calls }
    }
}
