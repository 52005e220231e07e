//! Run statistics and the per-channel statistics cache.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{McaError, Result};

/// Number of doubles in the wire form of [`RunStatistics`].
pub const STATISTICS_LEN: usize = 8;

/// Statistics of the current or last run.
///
/// `real_time` and `live_time` are seconds once they leave the controller.
/// Backends that count in ticks hand them over as raw tick counts.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RunStatistics {
    /// Elapsed real time
    pub real_time: f64,
    /// Elapsed live time
    pub live_time: f64,
    /// Input count rate in counts/s
    pub input_count_rate: f64,
    /// Output count rate in counts/s
    pub output_count_rate: f64,
    /// Events seen by the fast filter
    pub num_fast_peaks: f64,
    /// Events binned into the spectrum
    pub num_events: f64,
    /// Events below the first bin
    pub num_underflows: f64,
    /// Events above the last bin
    pub num_overflows: f64,
}

impl RunStatistics {
    /// Wire order: real, live, icr, ocr, fast peaks, events, underflows, overflows.
    pub fn to_array(&self) -> [f64; STATISTICS_LEN] {
        [
            self.real_time,
            self.live_time,
            self.input_count_rate,
            self.output_count_rate,
            self.num_fast_peaks,
            self.num_events,
            self.num_underflows,
            self.num_overflows,
        ]
    }

    /// Parse the wire form; exactly eight values are required.
    pub fn from_slice(values: &[f64]) -> Result<Self> {
        if values.len() != STATISTICS_LEN {
            return Err(McaError::Transport {
                message: format!(
                    "statistics carries {} values, expected {}",
                    values.len(),
                    STATISTICS_LEN
                ),
            });
        }
        Ok(Self {
            real_time: values[0],
            live_time: values[1],
            input_count_rate: values[2],
            output_count_rate: values[3],
            num_fast_peaks: values[4],
            num_events: values[5],
            num_underflows: values[6],
            num_overflows: values[7],
        })
    }

    /// Dead-time fraction `1 - live/real`, or 0 when real time is zero.
    pub fn dead_time_fraction(&self) -> f64 {
        if self.real_time > 0.0 {
            (1.0 - self.live_time / self.real_time).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Last statistics read for a channel plus its staleness.
///
/// The cache is dirty from the moment a run starts until the first
/// successful read that happens after that start.
#[derive(Debug, Clone)]
pub struct StatisticsCache {
    value: Option<RunStatistics>,
    dirty: bool,
    run_started_at: Option<Instant>,
    last_read_at: Option<Instant>,
    hardware_reads: u64,
}

impl Default for StatisticsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticsCache {
    /// Empty, dirty cache.
    pub fn new() -> Self {
        Self {
            value: None,
            dirty: true,
            run_started_at: None,
            last_read_at: None,
            hardware_reads: 0,
        }
    }

    /// A new run started; the previous run's value is discarded.
    pub fn mark_run_started(&mut self) {
        self.run_started_at = Some(Instant::now());
        self.value = None;
        self.dirty = true;
    }

    /// Invalidate without a run start (e.g. after a clear).
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// True when the cached value can be returned without a hardware read.
    pub fn is_fresh(&self) -> bool {
        if self.dirty || self.value.is_none() {
            return false;
        }
        match (self.run_started_at, self.last_read_at) {
            (Some(started), Some(read)) => read >= started,
            (None, Some(_)) => true,
            _ => false,
        }
    }

    /// Cached value regardless of staleness.
    pub fn cached(&self) -> Option<&RunStatistics> {
        self.value.as_ref()
    }

    /// Store a fresh read and clear the dirty flag.
    pub fn store(&mut self, stats: RunStatistics) {
        self.hardware_reads += 1;
        self.value = Some(stats);
        self.last_read_at = Some(Instant::now());
        self.dirty = false;
    }

    /// Store a read taken mid-run; the cache stays dirty.
    pub fn store_provisional(&mut self, stats: RunStatistics) {
        self.hardware_reads += 1;
        self.value = Some(stats);
        self.last_read_at = Some(Instant::now());
    }

    /// Drop the cached value.
    pub fn clear(&mut self) {
        self.value = None;
        self.dirty = true;
    }

    /// Number of backend reads that went through this cache.
    pub fn hardware_reads(&self) -> u64 {
        self.hardware_reads
    }
}
