//! Active trigger catalog and hot reload.
//!
//! The active catalog is a single `Arc` swapped as a whole. Readers clone the
//! `Arc` and keep resolving against the catalog they started with, so a
//! reload never shows a half-updated rule set.

use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use nwnbridge_domain::TriggerCatalog;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::trigger_file::TriggerFile;

#[derive(Clone, Default)]
pub struct CatalogHandle {
    current: Arc<RwLock<Arc<TriggerCatalog>>>,
}

impl CatalogHandle {
    pub fn new(catalog: TriggerCatalog) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(catalog))),
        }
    }

    /// Snapshot of the active catalog.
    pub fn current(&self) -> Arc<TriggerCatalog> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Swap in a new catalog, returning the previous one.
    pub fn replace(&self, catalog: TriggerCatalog) -> Arc<TriggerCatalog> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(catalog))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Unchanged,
    Reloaded { triggers: usize },
    /// File changed but could not be loaded; the previous catalog stays.
    Rejected,
}

/// Polls the triggers file and swaps the catalog when it changes.
pub struct CatalogReloader {
    file: TriggerFile,
    handle: CatalogHandle,
    interval: Duration,
}

impl CatalogReloader {
    pub fn new(file: TriggerFile, handle: CatalogHandle, interval: Duration) -> Self {
        Self {
            file,
            handle,
            interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut last_seen = self.file.modified().await;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.reload_if_changed(&mut last_seen).await;
                }
            }
        }
    }

    /// Reload when the modification time differs from `last_seen`.
    pub async fn reload_if_changed(&self, last_seen: &mut Option<SystemTime>) -> ReloadOutcome {
        let modified = self.file.modified().await;
        if modified.is_some() && modified == *last_seen {
            return ReloadOutcome::Unchanged;
        }
        if modified.is_none() && last_seen.is_none() {
            return ReloadOutcome::Unchanged;
        }
        *last_seen = modified;

        match self.file.load().await {
            Ok(catalog) => {
                let triggers = catalog.len();
                self.handle.replace(catalog);
                tracing::info!(
                    path = %self.file.path().display(),
                    triggers,
                    "Reloaded trigger catalog"
                );
                ReloadOutcome::Reloaded { triggers }
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Triggers file rejected, keeping previous catalog"
                );
                ReloadOutcome::Rejected
            }
        }
    }
}
