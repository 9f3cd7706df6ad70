//! License synchronization: pull licenses from the vendor API into a local
//! mirror, reconcile the mirror into the internal license table and,
//! optionally, push local edits back.

pub mod api;
pub mod batch;
pub mod monitoring;
pub mod orchestrator;
pub mod reconcile;
pub mod result;
pub mod reverse_sync;
pub mod source;

#[cfg(test)]
mod test_support;

pub use orchestrator::{LicenseSyncService, SyncOptions};
pub use result::{SyncErrorEntry, SyncResult};
pub use source::{ApiStatus, FetchFailure, FetchFailureKind, FetchOptions, FetchOutcome, LicenseSource};
