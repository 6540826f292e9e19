//! Batch cycle tracking
//!
//! Turns the edges of a boolean "machine active" signal into cycle records:
//! - batch duration (start to end of one active period)
//! - interval (end of the previous batch to end of this one)
//! - predicted rate = reference flow rate × duration / interval
//!
//! Rolling window means over the most recent valid predictions are kept in
//! bounded memory. The tracker is synchronous and does no I/O; logging,
//! metrics and sinking happen in `TrackerHandler` after a record is final.

mod cycle;
mod handler;
mod window;


pub use cycle::{transition, CycleState, Phase};
pub use handler::TrackerHandler;
pub use window::RollingWindows;

use crate::error::{ComputationAnomaly, ConfigError};
use crate::models::{CycleRecord, EdgeEvent, WindowMean};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Tracker state shared between the delivery path and read-side snapshots
pub type SharedTracker = Arc<Mutex<CycleTracker>>;

/// Whether tracker state survives a reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuityPolicy {
    /// Start over with an empty record sequence on every session
    #[default]
    Reset,
    /// Keep records and the previous batch end across sessions
    CarryOver,
}

/// Treatment of the first record, whose interval runs from tracker start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstCyclePolicy {
    #[default]
    Measure,
    /// Store the first record but flag it invalid
    Discard,
}

/// Configuration for the cycle tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Flow rate of the machine running continuously
    pub reference_flow_rate: f64,
    /// Rolling window sizes, in records
    pub window_sizes: Vec<usize>,
    pub first_cycle: FirstCyclePolicy,
    /// Maximum number of records retained
    pub history_limit: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            reference_flow_rate: 33.0,
            window_sizes: vec![2, 4, 8, 16, 32],
            first_cycle: FirstCyclePolicy::Measure,
            history_limit: 64,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.reference_flow_rate.is_finite() || self.reference_flow_rate <= 0.0 {
            return Err(ConfigError::InvalidFlowRate(self.reference_flow_rate));
        }
        if self.window_sizes.is_empty() {
            return Err(ConfigError::NoWindows);
        }
        if self.window_sizes.contains(&0) {
            return Err(ConfigError::ZeroWindow);
        }
        Ok(())
    }
}

/// Completed record together with the window means after it was added
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSummary {
    pub record: CycleRecord,
    pub windows: Vec<WindowMean>,
}

/// Outcome of one edge event
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Duplicate or idle `false`; nothing changed
    Ignored,
    /// A batch started at the given time
    Started(DateTime<Utc>),
    Completed(CycleSummary),
}

/// Read-side view of the tracker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerSnapshot {
    /// Session attempt the tracker is currently fed by
    pub generation: u64,
    pub started_at: DateTime<Utc>,
    /// Total records produced, including those evicted from history
    pub completed: u64,
    pub active: bool,
    pub last_record: Option<CycleRecord>,
    pub windows: Vec<WindowMean>,
    /// Retained history, oldest first
    pub recent: Vec<CycleRecord>,
}

impl TrackerSnapshot {
    /// Snapshot of a tracker that has not been fed yet
    pub fn empty(started_at: DateTime<Utc>) -> Self {
        Self {
            generation: 0,
            started_at,
            completed: 0,
            active: false,
            last_record: None,
            windows: Vec::new(),
            recent: Vec::new(),
        }
    }
}

/// Streaming batch statistics for one tracked signal
#[derive(Debug, Clone)]
pub struct CycleTracker {
    config: TrackerConfig,
    state: CycleState,
    started_at: DateTime<Utc>,
    generation: u64,
    records: VecDeque<CycleRecord>,
    windows: RollingWindows,
}

impl CycleTracker {
    /// Create a tracker whose first interval runs from `started_at`
    pub fn new(config: TrackerConfig, started_at: DateTime<Utc>) -> Self {
        let windows = RollingWindows::new(&config.window_sizes);
        Self {
            state: CycleState::new(started_at),
            started_at,
            generation: 0,
            records: VecDeque::with_capacity(config.history_limit.max(1)),
            windows,
            config,
        }
    }

    pub fn shared(self) -> SharedTracker {
        Arc::new(Mutex::new(self))
    }

    /// Feed one edge event
    pub fn observe(&mut self, event: &EdgeEvent) -> Observation {
        let (next, record) = transition(&self.state, event, self.config.reference_flow_rate);
        let started = !self.state.is_active() && next.is_active();
        self.state = next;

        let Some(mut record) = record else {
            return if started {
                Observation::Started(event.timestamp)
            } else {
                Observation::Ignored
            };
        };

        if record.sequence == 1
            && self.config.first_cycle == FirstCyclePolicy::Discard
            && record.is_valid()
        {
            record.predicted_rate = None;
            record.anomaly = Some(ComputationAnomaly::FirstCycle);
        }

        if let Some(rate) = record.predicted_rate {
            self.windows.push(rate);
        }

        if self.records.len() >= self.config.history_limit.max(1) {
            self.records.pop_front();
        }
        self.records.push_back(record.clone());

        Observation::Completed(CycleSummary {
            record,
            windows: self.windows.means(),
        })
    }

    /// Prepare for a new session
    ///
    /// `Reset` starts over from `at`. `CarryOver` keeps records and the
    /// previous batch end; a batch that was active when the old session died
    /// is abandoned because its end was never observed.
    pub fn begin_session(&mut self, generation: u64, at: DateTime<Utc>, policy: ContinuityPolicy) {
        self.generation = generation;
        match policy {
            ContinuityPolicy::Reset => {
                self.state = CycleState::new(at);
                self.started_at = at;
                self.records.clear();
                self.windows.clear();
            }
            ContinuityPolicy::CarryOver => {
                self.state.phase = Phase::Idle;
            }
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Total records produced since the last reset
    pub fn completed(&self) -> u64 {
        self.state.completed
    }

    /// Retained records, oldest first
    pub fn records(&self) -> impl Iterator<Item = &CycleRecord> {
        self.records.iter()
    }

    pub fn last_record(&self) -> Option<&CycleRecord> {
        self.records.back()
    }

    pub fn window_means(&self) -> Vec<WindowMean> {
        self.windows.means()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            generation: self.generation,
            started_at: self.started_at,
            completed: self.state.completed,
            active: self.state.is_active(),
            last_record: self.records.back().cloned(),
            windows: self.windows.means(),
            recent: self.records.iter().cloned().collect(),
        }
    }
}
