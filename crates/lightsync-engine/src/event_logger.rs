//! Structured logging of engine events.
//!
//! [`SyncEventLogger`] turns every [`SyncEvent`] into a tracing event and
//! keeps a bounded, timestamped history for export.

use crate::events::SyncEvent;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Events kept by default
pub const DEFAULT_HISTORY: usize = 1000;

/// A recorded event
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedEvent {
    /// RFC 3339 receive time
    pub timestamp: String,
    /// The event
    pub event: SyncEvent,
}

/// Sync event logger
pub struct SyncEventLogger {
    history: Mutex<VecDeque<LoggedEvent>>,
    capacity: usize,
}

impl SyncEventLogger {
    /// Logger keeping [`DEFAULT_HISTORY`] events
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY)
    }

    /// Logger keeping the latest `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY))),
            capacity: capacity.max(1),
        }
    }

    /// Log `event` and add it to the history
    pub fn record(&self, event: &SyncEvent) {
        let timestamp = chrono::Utc::now().to_rfc3339();

        match event {
            SyncEvent::PhaseStarted { phase, range } => info!(
                event = "sync_phase_started",
                phase = %phase,
                lower = range.lower,
                upper = range.upper,
                timestamp = %timestamp,
                "Sync phase started"
            ),
            SyncEvent::PhaseProgress {
                phase,
                height,
                fraction,
                ..
            } => debug!(
                event = "sync_phase_progress",
                phase = %phase,
                height,
                percent = fraction * 100.0,
                "Sync phase progress"
            ),
            SyncEvent::Idle {
                latest_height,
                scanned_height,
            } => info!(
                event = "sync_idle",
                latest_height,
                scanned_height,
                timestamp = %timestamp,
                "Sync caught up"
            ),
            SyncEvent::Stopped => info!(
                event = "sync_stopped",
                timestamp = %timestamp,
                "Sync stopped"
            ),
            SyncEvent::ReorgHandled {
                reorg_height,
                rewind_height,
            } => warn!(
                event = "sync_reorg_handled",
                reorg_height,
                rewind_height,
                timestamp = %timestamp,
                "Reorg handled"
            ),
            SyncEvent::Failed(failure) => error!(
                event = "sync_failed",
                kind = ?failure.kind,
                error = %failure.message,
                timestamp = %timestamp,
                "Sync failed"
            ),
        }

        let mut history = self.history.lock();
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(LoggedEvent {
            timestamp,
            event: event.clone(),
        });
    }

    /// Record everything from `events` until the engine is dropped
    pub async fn follow(self: Arc<Self>, mut events: broadcast::Receiver<SyncEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.record(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Recorded events, oldest first
    pub fn get_events(&self) -> Vec<LoggedEvent> {
        self.history.lock().iter().cloned().collect()
    }

    /// History for export
    pub fn export_events(&self) -> HashMap<String, Vec<String>> {
        let events = self
            .history
            .lock()
            .iter()
            .map(|e| format!("{} {:?}", e.timestamp, e.event))
            .collect();

        let mut export = HashMap::new();
        export.insert("events".to_string(), events);
        export
    }

    /// Drop the history
    pub fn clear(&self) {
        self.history.lock().clear();
        debug!("Sync event log cleared");
    }
}

impl Default for SyncEventLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SyncPhase;
    use lightsync_storage::BlockRange;

    fn started() -> SyncEvent {
        SyncEvent::PhaseStarted {
            phase: SyncPhase::Download,
            range: BlockRange::new(1, 10),
        }
    }

    #[test]
    fn test_event_logger() {
        let logger = SyncEventLogger::new();
        logger.record(&started());
        logger.record(&SyncEvent::Idle {
            latest_height: 10,
            scanned_height: 10,
        });
        logger.record(&SyncEvent::Stopped);

        let events = logger.get_events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].event, SyncEvent::Stopped);
    }

    #[test]
    fn test_history_is_bounded() {
        let logger = SyncEventLogger::with_capacity(2);
        logger.record(&started());
        logger.record(&SyncEvent::Stopped);
        logger.record(&SyncEvent::Stopped);

        let events = logger.get_events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event == SyncEvent::Stopped));
    }

    #[test]
    fn test_logger_export_and_clear() {
        let logger = SyncEventLogger::new();
        logger.record(&started());

        let export = logger.export_events();
        assert_eq!(export.get("events").map(Vec::len), Some(1));

        logger.clear();
        assert!(logger.get_events().is_empty());
    }

    #[tokio::test]
    async fn test_follow_until_closed() {
        let (tx, rx) = broadcast::channel(8);
        let logger = Arc::new(SyncEventLogger::new());
        let task = tokio::spawn(logger.clone().follow(rx));

        tx.send(started()).unwrap();
        tx.send(SyncEvent::Stopped).unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(logger.get_events().len(), 2);
    }
}
