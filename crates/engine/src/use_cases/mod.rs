//! Use cases - dispatch orchestration over the ports.

pub mod catalog;
pub mod dispatch;

pub use catalog::{CatalogHandle, CatalogReloader, ReloadOutcome};
pub use dispatch::{DispatchConfig, DispatchError, DispatchScheduler, RunSummary};
