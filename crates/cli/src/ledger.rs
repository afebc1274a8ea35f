//! JSON ledger files: a snapshot of sellers, orders, verifications and
//! settlements loaded into an in-memory store and written back after each
//! command that changes it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bazaar_engine::notify::LogSink;
use bazaar_engine::{MarketConfig, Marketplace, OutboxNotifier};
use bazaar_storage::{LedgerFixture, MemoryStorage, Period};
use tokio::task::JoinHandle;

use crate::PeriodArgs;

pub(crate) struct LedgerSession {
    path: PathBuf,
    market: Marketplace<MemoryStorage>,
    outbox: JoinHandle<()>,
}

impl LedgerSession {
    pub(crate) async fn open(path: &Path, config: MarketConfig) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("error reading ledger '{}': {}", path.display(), e))?;
        let fixture: LedgerFixture = serde_json::from_str(&text)
            .map_err(|e| format!("error parsing ledger '{}': {}", path.display(), e))?;
        let rows = fixture.orders.len() + fixture.verifications.len() + fixture.settlements.len();
        let storage = MemoryStorage::from_fixture(fixture)
            .await
            .map_err(|e| format!("error loading ledger '{}': {}", path.display(), e))?;
        tracing::debug!(ledger = %path.display(), rows, "ledger loaded");

        let (outbox, drain) = OutboxNotifier::spawn(LogSink, config.notification_queue);
        let market = Marketplace::new(Arc::new(storage), config).with_notifier(Arc::new(outbox));
        Ok(Self {
            path: path.to_path_buf(),
            market,
            outbox: drain,
        })
    }

    pub(crate) fn market(&self) -> &Marketplace<MemoryStorage> {
        &self.market
    }

    /// Write every row back through a sibling temp file, so a crash never
    /// leaves a half-written ledger.
    pub(crate) fn save(&self) -> Result<(), String> {
        let fixture = self
            .market
            .storage()
            .to_fixture()
            .map_err(|e| format!("error exporting ledger: {e}"))?;
        let text = serde_json::to_string_pretty(&fixture)
            .map_err(|e| format!("serialization error: {e}"))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text)
            .map_err(|e| format!("error writing ledger '{}': {}", tmp.display(), e))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| format!("error writing ledger '{}': {}", self.path.display(), e))?;
        tracing::debug!(ledger = %self.path.display(), "ledger saved");
        Ok(())
    }

    /// Drop the marketplace and wait for queued notifications to drain.
    pub(crate) async fn close(self) {
        let Self { market, outbox, .. } = self;
        drop(market);
        if let Err(e) = outbox.await {
            tracing::warn!(error = %e, "notification outbox ended abnormally");
        }
    }
}

pub(crate) fn period(args: &PeriodArgs) -> Period {
    Period::new(args.from, args.to)
}
