//! Subscription handler feeding the cycle tracker

use super::{Observation, SharedTracker, TrackerSnapshot};
use crate::models::{CycleRecord, DataChange, EdgeEvent, SignalAddress};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::session::{lock, DataChangeHandler};
use crate::sink::RecordSink;
use std::sync::Arc;
use tokio::sync::watch;

/// Converts changes of the watched signal into edge events
///
/// The tracker lock is released before anything is logged, counted or
/// queued for the record sink.
pub struct TrackerHandler {
    watched: SignalAddress,
    tracker: SharedTracker,
    snapshots: Arc<watch::Sender<TrackerSnapshot>>,
    logger: StructuredLogger,
    metrics: AgentMetrics,
    sink: Option<RecordSink<CycleRecord>>,
}

impl TrackerHandler {
    pub fn new(
        watched: SignalAddress,
        tracker: SharedTracker,
        snapshots: Arc<watch::Sender<TrackerSnapshot>>,
        logger: StructuredLogger,
        metrics: AgentMetrics,
    ) -> Self {
        Self {
            watched,
            tracker,
            snapshots,
            logger,
            metrics,
            sink: None,
        }
    }

    /// Also append every completed record to `sink`
    pub fn with_sink(mut self, sink: RecordSink<CycleRecord>) -> Self {
        self.sink = Some(sink);
        self
    }
}

impl DataChangeHandler for TrackerHandler {
    fn on_data_change(&self, change: &DataChange) {
        if change.address != self.watched {
            return;
        }

        let event = EdgeEvent::from(change);
        let (observation, snapshot) = {
            let mut tracker = lock(&self.tracker);
            let observation = tracker.observe(&event);
            let snapshot = match observation {
                Observation::Ignored => None,
                _ => Some(tracker.snapshot()),
            };
            (observation, snapshot)
        };

        match observation {
            Observation::Ignored => return,
            Observation::Started(at) => self.logger.log_machine_state(true, at),
            Observation::Completed(summary) => {
                self.logger.log_machine_state(false, summary.record.end_time);
                self.logger.log_cycle(&summary.record, &summary.windows);
                self.metrics.record_cycle(&summary.record);
                self.metrics.set_window_means(&summary.windows);
                if let Some(sink) = &self.sink {
                    sink.submit(summary.record);
                }
            }
        }

        if let Some(snapshot) = snapshot {
            self.snapshots.send_replace(snapshot);
        }
    }

    fn name(&self) -> &str {
        "tracker"
    }
}
