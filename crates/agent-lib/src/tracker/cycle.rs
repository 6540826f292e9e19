//! Cycle state machine
//!
//! `transition` is a pure function of the current state, one edge event and
//! the reference flow rate. It performs no I/O and allocates nothing beyond
//! the returned record.

use crate::error::ComputationAnomaly;
use crate::models::{CycleRecord, EdgeEvent};
use chrono::{DateTime, Utc};

/// Phase of the tracked signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Active { start: DateTime<Utc> },
}

/// Everything the transition needs to carry between events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleState {
    pub phase: Phase,
    /// End of the previous batch, or tracker start before the first one
    pub previous_end: DateTime<Utc>,
    /// Number of records produced so far
    pub completed: u64,
}

impl CycleState {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            phase: Phase::Idle,
            previous_end: started_at,
            completed: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, Phase::Active { .. })
    }
}

/// Apply one edge event
///
/// A value equal to the current phase (true while active, false while idle)
/// leaves the state untouched, so duplicates and the initial `false`
/// notification are no-ops.
pub fn transition(
    state: &CycleState,
    event: &EdgeEvent,
    reference_rate: f64,
) -> (CycleState, Option<CycleRecord>) {
    match (state.phase, event.value) {
        (Phase::Idle, true) => (
            CycleState {
                phase: Phase::Active {
                    start: event.timestamp,
                },
                ..*state
            },
            None,
        ),
        (Phase::Active { start }, false) => {
            let end = event.timestamp;
            let duration = seconds_between(start, end);
            let interval = seconds_between(state.previous_end, end);

            let (predicted_rate, anomaly) = if duration < 0.0 {
                (None, Some(ComputationAnomaly::NegativeDuration))
            } else if interval <= 0.0 {
                (None, Some(ComputationAnomaly::NonPositiveInterval))
            } else {
                (Some(reference_rate * duration / interval), None)
            };

            let record = CycleRecord {
                sequence: state.completed + 1,
                start_time: start,
                end_time: end,
                duration_secs: duration,
                interval_secs: interval,
                predicted_rate,
                anomaly,
            };

            let next = CycleState {
                phase: Phase::Idle,
                previous_end: end,
                completed: state.completed + 1,
            };
            (next, Some(record))
        }
        _ => (*state, None),
    }
}

/// Signed seconds from `from` to `to`
fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_idle_true_starts_cycle() {
        let state = CycleState::new(t(0));
        let (next, record) = transition(&state, &EdgeEvent::new(t(3), true), 33.0);
        assert_eq!(next.phase, Phase::Active { start: t(3) });
        assert_eq!(next.previous_end, t(0));
        assert!(record.is_none());
    }

    #[test]
    fn test_no_ops() {
        let idle = CycleState::new(t(0));
        assert_eq!(transition(&idle, &EdgeEvent::new(t(1), false), 33.0), (idle, None));

        let (active, _) = transition(&idle, &EdgeEvent::new(t(2), true), 33.0);
        assert_eq!(
            transition(&active, &EdgeEvent::new(t(3), true), 33.0),
            (active, None)
        );
    }

    #[test]
    fn test_active_false_completes_cycle() {
        let state = CycleState {
            phase: Phase::Active { start: t(10) },
            previous_end: t(0),
            completed: 4,
        };
        let (next, record) = transition(&state, &EdgeEvent::new(t(15), false), 33.0);
        let record = record.unwrap();

        assert_eq!(record.sequence, 5);
        assert_eq!(record.duration_secs, 5.0);
        assert_eq!(record.interval_secs, 15.0);
        assert!((record.predicted_rate.unwrap() - 11.0).abs() < 1e-9);
        assert_eq!(next.phase, Phase::Idle);
        assert_eq!(next.previous_end, t(15));
        assert_eq!(next.completed, 5);
    }

    #[test]
    fn test_non_positive_interval_is_invalid() {
        let state = CycleState {
            phase: Phase::Active { start: t(5) },
            previous_end: t(5),
            completed: 0,
        };
        let (_, record) = transition(&state, &EdgeEvent::new(t(5), false), 33.0);
        let record = record.unwrap();
        assert_eq!(record.predicted_rate, None);
        assert_eq!(record.anomaly, Some(ComputationAnomaly::NonPositiveInterval));
        assert_eq!(record.interval_secs, 0.0);
    }

    #[test]
    fn test_clock_moving_backwards_is_invalid() {
        let state = CycleState {
            phase: Phase::Active { start: t(20) },
            previous_end: t(0),
            completed: 0,
        };
        let (next, record) = transition(&state, &EdgeEvent::new(t(18), false), 33.0);
        let record = record.unwrap();
        assert_eq!(record.duration_secs, -2.0);
        assert_eq!(record.anomaly, Some(ComputationAnomaly::NegativeDuration));
        assert_eq!(next.previous_end, t(18));
    }

    #[test]
    fn test_sub_second_precision() {
        let state = CycleState {
            phase: Phase::Active {
                start: t(0) + Duration::milliseconds(250),
            },
            previous_end: t(0),
            completed: 0,
        };
        let (_, record) = transition(&state, &EdgeEvent::new(t(1), false), 10.0);
        let record = record.unwrap();
        assert!((record.duration_secs - 0.75).abs() < 1e-9);
        assert!((record.predicted_rate.unwrap() - 7.5).abs() < 1e-9);
    }
}
