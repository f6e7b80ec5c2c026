//! Cooperative cancellation observed at page boundaries.
//!
//! A run stops when either the persisted stop flag for its stream is set or
//! the process-local [`CancellationToken`] (Ctrl-C, server shutdown) is
//! cancelled. The flag is a fresh point read every time.

use riksdata_database::DbError;
use riksdata_database::store::ProgressLedger;
use riksdata_database_models::DataSourceKey;
use tokio_util::sync::CancellationToken;

/// Stop check for one (source, data type) stream.
pub struct StopSignal<'a, L: ProgressLedger + ?Sized> {
    ledger: &'a L,
    key: &'a DataSourceKey,
    local: CancellationToken,
}

impl<'a, L: ProgressLedger + ?Sized> StopSignal<'a, L> {
    /// Creates a signal backed by `ledger` and `local`.
    pub const fn new(ledger: &'a L, key: &'a DataSourceKey, local: CancellationToken) -> Self {
        Self { ledger, key, local }
    }

    /// Returns `true` if the run should stop before its next page.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the stop flag cannot be read.
    pub async fn is_stopped(&self) -> Result<bool, DbError> {
        if self.local.is_cancelled() {
            log::info!("[{}] Local cancellation requested", self.key);
            return Ok(true);
        }
        let stop = self
            .ledger
            .should_stop(self.key.source, &self.key.data_type)
            .await?;
        if stop {
            log::info!("[{}] Stop flag is set", self.key);
        }
        Ok(stop)
    }
}

#[cfg(test)]
mod tests {
    use riksdata_database::memory::MemoryStore;
    use riksdata_source_models::DataSource;

    use super::*;

    fn key() -> DataSourceKey {
        DataSourceKey::new(DataSource::Riksdagen, "dokument")
    }

    #[tokio::test]
    async fn reads_the_flag_fresh_each_time() {
        let store = MemoryStore::new();
        let key = key();
        let signal = StopSignal::new(&store, &key, CancellationToken::new());

        assert!(!signal.is_stopped().await.unwrap());
        store
            .set_stop_flag(DataSource::Riksdagen, "dokument", true)
            .await
            .unwrap();
        assert!(signal.is_stopped().await.unwrap());
        store
            .set_stop_flag(DataSource::Riksdagen, "dokument", false)
            .await
            .unwrap();
        assert!(!signal.is_stopped().await.unwrap());
    }

    #[tokio::test]
    async fn flags_are_scoped_to_their_stream() {
        let store = MemoryStore::new();
        store
            .set_stop_flag(DataSource::Riksdagen, "ledamoter", true)
            .await
            .unwrap();
        let key = key();
        let signal = StopSignal::new(&store, &key, CancellationToken::new());
        assert!(!signal.is_stopped().await.unwrap());
    }

    #[tokio::test]
    async fn local_cancellation_stops_without_the_flag() {
        let store = MemoryStore::new();
        let token = CancellationToken::new();
        let key = key();
        let signal = StopSignal::new(&store, &key, token.child_token());

        token.cancel();
        assert!(signal.is_stopped().await.unwrap());
    }
}
