//! Offline-first synchronisation core for election-day field devices.
//!
//! - [`DeltaEventQueue`] durably queues check-in deltas and flushes them as
//!   idempotent batches. [`SyncTrigger`] flushes it on connectivity and
//!   visibility transitions.
//! - [`DraftStore`] keeps tally drafts across reloads and commits them.
//! - [`RegionResolver`] drives the county / constituency / ward / polling
//!   station cascade, discarding stale fetches.
//!
//! All remote calls go through a [`SubmissionClient`] and all local state
//! through a [`storage::KeyValueStore`].

mod config;
pub mod client;
pub mod draft;
pub mod error;
pub mod queue;
pub mod region;
pub mod storage;
pub mod trigger;

#[cfg(test)]
mod testing;

pub use crate::client::SubmissionClient;
pub use crate::config::*;
pub use crate::draft::{
    CloseDecision, CloseOutcome, DraftStore, DraftTotals, OverflowWarning, SubmitOutcome,
};
pub use crate::error::{ClientError, ErrorKind, SyncError, SyncResult};
pub use crate::queue::{DeltaEventQueue, FlushOutcome};
pub use crate::region::{FetchOutcome, LevelStatus, RegionResolver};
pub use crate::trigger::{DeviceSignal, SyncTrigger};
