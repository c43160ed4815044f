use chrono::{DateTime, Utc};
use shuttle_core::ShuttleState;
use std::sync::Arc;
use tokio::sync::watch;

use crate::poller::PollError;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollStats {
    pub ticks: u64,
    pub requests: u64,
    pub applied: u64,
    pub empty: u64,
    pub skipped: u64,
    pub aborted: u64,
    pub stale_discarded: u64,
    pub failures: u64,
}

/// Immutable view of the shuttle state plus poll health.
#[derive(Clone, Debug, Default)]
pub struct ShuttleSnapshot {
    pub state: ShuttleState,
    pub error: Option<PollError>,
    pub topic: Option<String>,
    pub record_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
    pub stats: PollStats,
    pub revision: u64,
}

pub fn shuttle_store() -> (ShuttleWriter, ShuttleReader) {
    let (tx, rx) = watch::channel(Arc::new(ShuttleSnapshot::default()));
    (ShuttleWriter { tx }, ShuttleReader { rx })
}

/// The only handle able to change the snapshot. Every change publishes a
/// complete new snapshot.
#[derive(Debug)]
pub struct ShuttleWriter {
    tx: watch::Sender<Arc<ShuttleSnapshot>>,
}

impl ShuttleWriter {
    pub fn current(&self) -> Arc<ShuttleSnapshot> {
        Arc::clone(&self.tx.borrow())
    }

    fn publish(&self, update: impl FnOnce(&mut ShuttleSnapshot)) {
        let mut next = ShuttleSnapshot::clone(&self.current());
        update(&mut next);
        next.revision = next.revision.wrapping_add(1);
        self.tx.send_replace(Arc::new(next));
    }

    pub fn apply_state(&self, state: ShuttleState, record_at: Option<DateTime<Utc>>) {
        self.publish(|snapshot| {
            snapshot.state = state;
            snapshot.error = None;
            snapshot.record_at = record_at.or(snapshot.record_at);
            snapshot.applied_at = Some(Utc::now());
            snapshot.stats.applied += 1;
        });
    }

    pub fn mark_empty(&self) {
        self.publish(|snapshot| {
            snapshot.error = None;
            snapshot.stats.empty += 1;
        });
    }

    /// Surface an error without touching the last known good state.
    pub fn report_error(&self, error: PollError) {
        self.publish(|snapshot| {
            if error.is_tick_skip() {
                snapshot.stats.skipped += 1;
            } else {
                snapshot.stats.failures += 1;
            }
            snapshot.error = Some(error);
        });
    }

    /// Back to initial defaults for a newly selected topic.
    pub fn reset_for_topic(&self, topic: Option<String>) {
        self.publish(|snapshot| {
            snapshot.state = ShuttleState::default();
            snapshot.error = None;
            snapshot.record_at = None;
            snapshot.applied_at = None;
            snapshot.topic = topic;
        });
    }

    pub fn record_tick(&self) {
        self.publish(|snapshot| snapshot.stats.ticks += 1);
    }

    pub fn record_request(&self) {
        self.publish(|snapshot| snapshot.stats.requests += 1);
    }

    pub fn record_abort(&self) {
        self.publish(|snapshot| snapshot.stats.aborted += 1);
    }

    pub fn record_stale(&self) {
        self.publish(|snapshot| snapshot.stats.stale_discarded += 1);
    }
}

#[derive(Clone, Debug)]
pub struct ShuttleReader {
    rx: watch::Receiver<Arc<ShuttleSnapshot>>,
}

impl ShuttleReader {
    pub fn snapshot(&self) -> Arc<ShuttleSnapshot> {
        Arc::clone(&self.rx.borrow())
    }

    /// Wait for the next published snapshot. Errors once the writer is gone.
    pub async fn changed(&mut self) -> Result<Arc<ShuttleSnapshot>, watch::error::RecvError> {
        self.rx.changed().await?;
        Ok(Arc::clone(&self.rx.borrow_and_update()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shuttle_core::{CellCoord, DisplayLabel, ShuttleAction};

    fn stored_state() -> ShuttleState {
        let mut state = ShuttleState::default();
        state.set_target(
            CellCoord {
                row: 1,
                rack: 3,
                slot: 2,
                depth: 0,
            },
            ShuttleAction::Stored,
            DisplayLabel::Stored,
        );
        state
    }

    #[test]
    fn errors_keep_last_known_state() {
        let (writer, reader) = shuttle_store();
        writer.apply_state(stored_state(), None);
        writer.report_error(PollError::Transport("HTTP 502".to_string()));

        let snapshot = reader.snapshot();
        assert_eq!(snapshot.state, stored_state());
        assert_eq!(
            snapshot.error,
            Some(PollError::Transport("HTTP 502".to_string()))
        );
        assert_eq!(snapshot.stats.failures, 1);

        writer.mark_empty();
        assert!(reader.snapshot().error.is_none());
    }

    #[test]
    fn snapshots_held_by_readers_are_immutable() {
        let (writer, reader) = shuttle_store();
        let before = reader.snapshot();
        writer.apply_state(stored_state(), None);
        assert_eq!(before.state, ShuttleState::default());
        assert_eq!(reader.snapshot().state, stored_state());
        assert!(reader.snapshot().revision > before.revision);
    }

    #[test]
    fn reset_for_topic_restores_defaults() {
        let (writer, reader) = shuttle_store();
        writer.apply_state(stored_state(), Some(Utc::now()));
        writer.reset_for_topic(Some("rm_r2".to_string()));
        let snapshot = reader.snapshot();
        assert_eq!(snapshot.state, ShuttleState::default());
        assert_eq!(snapshot.topic.as_deref(), Some("rm_r2"));
        assert!(snapshot.record_at.is_none());
        assert_eq!(snapshot.stats.applied, 1);
    }

    #[tokio::test]
    async fn readers_are_notified_of_replacements() {
        let (writer, mut reader) = shuttle_store();
        writer.apply_state(stored_state(), None);
        let snapshot = reader.changed().await.expect("writer alive");
        assert_eq!(snapshot.state.store_rack, Some(3));
        drop(writer);
        assert!(reader.changed().await.is_err());
    }
}
