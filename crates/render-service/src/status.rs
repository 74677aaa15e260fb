//! Recording status persistence seam.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kartlap_common::error::KartlapResult;
use kartlap_session_model::recording::StatusUpdate;

/// Where recording status updates are written.
///
/// The API layer reads these; this crate only writes them.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn update_status(&self, recording_id: &str, update: StatusUpdate) -> KartlapResult<()>;
}

/// In-memory store keeping every update, for tests and the CLI.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    updates: Mutex<HashMap<String, Vec<StatusUpdate>>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, recording_id: &str) -> Option<StatusUpdate> {
        self.history(recording_id).pop()
    }

    pub fn history(&self, recording_id: &str) -> Vec<StatusUpdate> {
        self.updates
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(recording_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn update_status(&self, recording_id: &str, update: StatusUpdate) -> KartlapResult<()> {
        tracing::debug!(
            recording_id,
            status = update.status.as_str(),
            progress = update.progress,
            "Status update"
        );
        self.updates
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(recording_id.to_string())
            .or_default()
            .push(update);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kartlap_session_model::recording::RecordingStatus;

    #[tokio::test]
    async fn test_memory_store_keeps_history() {
        let store = MemoryStatusStore::new();
        store
            .update_status("rec-1", StatusUpdate::processing(10))
            .await
            .unwrap();
        store
            .update_status("rec-1", StatusUpdate::ready(1024, Some(30.0)))
            .await
            .unwrap();

        assert_eq!(store.history("rec-1").len(), 2);
        let latest = store.latest("rec-1").unwrap();
        assert_eq!(latest.status, RecordingStatus::Ready);
        assert_eq!(latest.size_bytes, Some(1024));
        assert!(store.latest("rec-2").is_none());
    }
}
