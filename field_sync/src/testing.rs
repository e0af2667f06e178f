// Test doubles: an idempotent in-memory server and a store that can be told to fail.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use snafu::prelude::*;
use tokio::sync::Notify;

use crate::client::SubmissionClient;
use crate::config::*;
use crate::error::*;
use crate::storage::{KeyValueStore, MemoryStore};

#[derive(Default)]
struct ServerState {
    // Ledger
    applied_keys: HashSet<IdempotencyKey>,
    checked_in: HashMap<String, i64>,
    batches_received: usize,
    batches_in_flight: usize,
    max_batches_in_flight: usize,
    fail_batches: usize,
    drop_batch_acks: usize,
    batch_gate: Option<Arc<Notify>>,

    // Regions
    options: HashMap<(RegionLevel, Option<String>), Vec<RegionOption>>,
    failing_parents: HashSet<Option<String>>,
    held_parents: HashMap<Option<String>, Arc<Notify>>,
    option_requests: usize,

    // Records
    record_versions: HashMap<String, u64>,
    commits: Vec<CommitRequest>,
    reject_commits: Option<String>,
    unavailable_commits: usize,
    commit_gate: Option<Arc<Notify>>,
}

pub(crate) struct FakeServer {
    state: Mutex<ServerState>,
    batch_started: Notify,
}

impl FakeServer {
    pub(crate) fn new() -> Arc<FakeServer> {
        Arc::new(FakeServer {
            state: Mutex::new(ServerState::default()),
            batch_started: Notify::new(),
        })
    }

    /// Counties A and B. A has C1 and C2, B has C3. C1 has wards W1 and W2,
    /// W1 has polling stations P1 and P2.
    pub(crate) fn with_regions() -> Arc<FakeServer> {
        let server = FakeServer::new();
        server.set_options(
            RegionLevel::County,
            None,
            &[("A", "County A"), ("B", "County B")],
        );
        server.set_options(
            RegionLevel::Constituency,
            Some("A"),
            &[("C1", "Constituency 1"), ("C2", "Constituency 2")],
        );
        server.set_options(
            RegionLevel::Constituency,
            Some("B"),
            &[("C3", "Constituency 3")],
        );
        server.set_options(
            RegionLevel::Ward,
            Some("C1"),
            &[("W1", "Ward 1"), ("W2", "Ward 2")],
        );
        server.set_options(
            RegionLevel::PollingStation,
            Some("W1"),
            &[("P1", "Station 1"), ("P2", "Station 2")],
        );
        server
    }

    pub(crate) fn set_options(
        &self,
        level: RegionLevel,
        parent: Option<&str>,
        options: &[(&str, &str)],
    ) {
        let options = options
            .iter()
            .map(|(code, name)| RegionOption::new(*code, *name))
            .collect();
        self.state
            .lock()
            .options
            .insert((level, parent.map(str::to_string)), options);
    }

    pub(crate) fn fail_options_for(&self, parent: Option<&str>, failing: bool) {
        let parent = parent.map(str::to_string);
        let mut s = self.state.lock();
        if failing {
            s.failing_parents.insert(parent);
        } else {
            s.failing_parents.remove(&parent);
        }
    }

    /// The next options request scoped by `parent` waits until the returned handle is notified.
    pub(crate) fn hold_options_for(&self, parent: Option<&str>) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state
            .lock()
            .held_parents
            .insert(parent.map(str::to_string), gate.clone());
        gate
    }

    pub(crate) fn option_requests(&self) -> usize {
        self.state.lock().option_requests
    }

    pub(crate) fn checked_in(&self, station_id: &str) -> i64 {
        self.state
            .lock()
            .checked_in
            .get(station_id)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn batches_received(&self) -> usize {
        self.state.lock().batches_received
    }

    pub(crate) fn max_batches_in_flight(&self) -> usize {
        self.state.lock().max_batches_in_flight
    }

    pub(crate) fn fail_next_batches(&self, n: usize) {
        self.state.lock().fail_batches = n;
    }

    /// The batch is applied but the client is told it failed.
    pub(crate) fn drop_next_batch_acks(&self, n: usize) {
        self.state.lock().drop_batch_acks = n;
    }

    pub(crate) fn hold_next_batch(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().batch_gate = Some(gate.clone());
        gate
    }

    pub(crate) async fn wait_for_batch_in_flight(&self) {
        self.batch_started.notified().await;
    }

    pub(crate) fn commits(&self) -> Vec<CommitRequest> {
        self.state.lock().commits.clone()
    }

    pub(crate) fn reject_commits(&self, message: Option<&str>) {
        self.state.lock().reject_commits = message.map(str::to_string);
    }

    pub(crate) fn fail_next_commits(&self, n: usize) {
        self.state.lock().unavailable_commits = n;
    }

    pub(crate) fn hold_next_commit(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().commit_gate = Some(gate.clone());
        gate
    }

    /// Simulates another device committing the record.
    pub(crate) fn set_record_version(&self, record_key: &str, version: u64) {
        self.state
            .lock()
            .record_versions
            .insert(record_key.to_string(), version);
    }
}

#[async_trait]
impl SubmissionClient for FakeServer {
    async fn fetch_options(
        &self,
        level: RegionLevel,
        parent_code: Option<&str>,
        _cycle: &str,
    ) -> Result<Vec<RegionOption>, ClientError> {
        let parent = parent_code.map(str::to_string);
        let gate = {
            let mut s = self.state.lock();
            s.option_requests += 1;
            s.held_parents.remove(&parent)
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let s = self.state.lock();
        if s.failing_parents.contains(&parent) {
            return ServerUnavailableSnafu { status: 503u16 }.fail();
        }
        Ok(s.options.get(&(level, parent)).cloned().unwrap_or_default())
    }

    async fn submit_delta_batch(&self, batch: &DeltaBatch) -> Result<BatchReceipt, ClientError> {
        let gate = {
            let mut s = self.state.lock();
            s.batches_in_flight += 1;
            s.max_batches_in_flight = s.max_batches_in_flight.max(s.batches_in_flight);
            s.batch_gate.take()
        };
        self.batch_started.notify_one();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut s = self.state.lock();
        s.batches_in_flight -= 1;
        if s.fail_batches > 0 {
            s.fail_batches -= 1;
            return ServerUnavailableSnafu { status: 503u16 }.fail();
        }
        s.batches_received += 1;
        let mut applied = 0;
        for event in batch.events.iter() {
            if s.applied_keys.insert(event.key().clone()) {
                *s.checked_in
                    .entry(event.station_id().to_string())
                    .or_default() += event.delta();
                applied += 1;
            }
        }
        if s.drop_batch_acks > 0 {
            s.drop_batch_acks -= 1;
            return UnreachableSnafu {
                message: "connection reset",
            }
            .fail();
        }
        Ok(BatchReceipt { applied })
    }

    async fn commit_record(&self, request: &CommitRequest) -> Result<CommitReceipt, ClientError> {
        let gate = self.state.lock().commit_gate.take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut s = self.state.lock();
        if s.unavailable_commits > 0 {
            s.unavailable_commits -= 1;
            return ServerUnavailableSnafu { status: 502u16 }.fail();
        }
        if let Some(message) = s.reject_commits.clone() {
            return RejectedSnafu {
                status: 422u16,
                message,
            }
            .fail();
        }
        let current = s.record_versions.get(&request.record_key).copied();
        if let (Some(server_version), Some(base)) = (current, request.base_version) {
            if server_version != base {
                return VersionConflictSnafu { server_version }.fail();
            }
        }
        let version = current.unwrap_or(0) + 1;
        s.record_versions
            .insert(request.record_key.clone(), version);
        s.commits.push(request.clone());
        Ok(CommitReceipt {
            record_id: format!("{}-v{}", request.record_key, version),
            version: Some(version),
        })
    }
}

/// A memory store whose writes can be switched off.
#[derive(Default)]
pub(crate) struct FailingStore {
    inner: MemoryStore,
    fail_sets: Mutex<bool>,
    fail_removes: Mutex<bool>,
}

impl FailingStore {
    pub(crate) fn shared() -> Arc<FailingStore> {
        Arc::new(FailingStore::default())
    }

    /// Both `set` and `remove`.
    pub(crate) fn fail_writes(&self, failing: bool) {
        *self.fail_sets.lock() = failing;
        *self.fail_removes.lock() = failing;
    }

    pub(crate) fn fail_removes(&self, failing: bool) {
        *self.fail_removes.lock() = failing;
    }

    fn check(&self, failing: &Mutex<bool>, key: &str) -> SyncResult<()> {
        if *failing.lock() {
            let e = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
            return Err(e).context(StorageIoSnafu { key });
        }
        Ok(())
    }
}

impl KeyValueStore for FailingStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        self.check(&self.fail_sets, key)?;
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        self.check(&self.fail_removes, key)?;
        self.inner.remove(key)
    }
}

pub(crate) fn option(code: &str) -> RegionOption {
    RegionOption::new(code, code)
}
