//! The durable queue of check-in deltas.
//!
//! Events move `queued -> in-flight -> {acknowledged (removed) | queued}`.
//! There is no failed state: a delta is a commutative increment, keyed for
//! idempotency, so it can be retried indefinitely.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use snafu::prelude::*;

use crate::client::{with_deadline, SubmissionClient};
use crate::config::*;
use crate::error::*;
use crate::storage::{read_json, write_json, KeyValueStore, QUEUE_KEY};

/// Generates a 128-bit idempotency key from the operating system's CSPRNG.
pub fn make_key() -> IdempotencyKey {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    let s: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    IdempotencyKey::from(s)
}

/// The result of a flush. Failures are reported here, never as errors.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum FlushOutcome {
    /// Nothing was queued.
    Idle,
    Flushed {
        sent: usize,
        applied: u64,
        /// Events enqueued while the batch was in flight.
        remaining: usize,
    },
    /// The batch was not acknowledged. Every event is still queued.
    Deferred { pending: usize, kind: ErrorKind },
}

pub struct DeltaEventQueue {
    store: Arc<dyn KeyValueStore>,
    client: Arc<dyn SubmissionClient>,
    settings: SyncSettings,
    events: Mutex<Vec<DeltaEvent>>,
    // Held for the whole read-submit-clear cycle.
    flush_lock: tokio::sync::Mutex<()>,
}

impl DeltaEventQueue {
    /// Restores the queue persisted by a previous session, if any.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        client: Arc<dyn SubmissionClient>,
        settings: SyncSettings,
    ) -> SyncResult<DeltaEventQueue> {
        let events: Vec<DeltaEvent> = read_json(store.as_ref(), QUEUE_KEY)?.unwrap_or_default();
        info!("DeltaEventQueue::open: {} pending events", events.len());
        Ok(DeltaEventQueue {
            store,
            client,
            settings,
            events: Mutex::new(events),
            flush_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Appends an event and persists the whole queue.
    ///
    /// If the durable write fails the append is rolled back and the error
    /// returned, so the in-memory queue never holds an event the disk does not.
    pub fn enqueue(&self, event: DeltaEvent) -> SyncResult<()> {
        let mut events = self.events.lock();
        self.append(&mut events, event)
    }

    fn append(&self, events: &mut Vec<DeltaEvent>, event: DeltaEvent) -> SyncResult<()> {
        events.push(event);
        if let Err(e) = write_json(self.store.as_ref(), QUEUE_KEY, &*events) {
            events.pop();
            return Err(e);
        }
        let len = events.len();
        debug!("enqueue: {} pending events", len);
        if len > self.settings.queue_warn_threshold {
            warn!(
                "enqueue: {} events waiting for the server (threshold {})",
                len, self.settings.queue_warn_threshold
            );
        }
        Ok(())
    }

    /// Queues a check-in delta for a station after checking it against the cap.
    ///
    /// The projection is the server's acknowledged total plus every pending
    /// delta for the station plus this one. It must stay within `0..=cap`.
    /// The check and the append happen under the same lock, so concurrent
    /// callers cannot both take the last place.
    pub fn record_check_in(
        &self,
        snapshot: &StationSnapshot,
        delta: i64,
    ) -> SyncResult<DeltaEvent> {
        let mut events = self.events.lock();
        let pending: i128 = events
            .iter()
            .filter(|e| e.station_id() == snapshot.id)
            .map(|e| i128::from(e.delta()))
            .sum();
        let projected = i128::from(snapshot.checked_in) + pending + i128::from(delta);
        ensure!(
            projected <= i128::from(snapshot.cap),
            CapacityExceededSnafu {
                station_id: snapshot.id.clone(),
                cap: snapshot.cap,
            }
        );
        ensure!(
            projected >= 0,
            InvalidFieldSnafu {
                field: "delta",
                message: format!("check-ins for {} cannot go below zero", snapshot.id),
            }
        );
        let event = DeltaEvent::new(snapshot.id.clone(), delta);
        self.append(&mut events, event.clone())?;
        Ok(event)
    }

    pub fn pending(&self) -> Vec<DeltaEvent> {
        self.events.lock().clone()
    }

    pub fn pending_len(&self) -> usize {
        self.events.lock().len()
    }

    /// Net unacknowledged delta for one station, saturating at the `i64` bounds.
    pub fn pending_delta(&self, station_id: &str) -> i64 {
        self.events
            .lock()
            .iter()
            .filter(|e| e.station_id() == station_id)
            .fold(0i64, |acc, e| acc.saturating_add(e.delta()))
    }

    /// Submits everything currently queued as one batch.
    ///
    /// Only one flush runs at a time: a concurrent caller waits for the
    /// running one and then flushes whatever is left. On success exactly the
    /// events that were sent are removed, anything enqueued meanwhile stays.
    pub async fn flush(&self) -> FlushOutcome {
        let _flushing = self.flush_lock.lock().await;

        let batch = DeltaBatch {
            events: self.pending(),
        };
        if batch.events.is_empty() {
            return FlushOutcome::Idle;
        }
        let sent = batch.events.len();
        debug!("flush: submitting {} events", sent);

        let res = with_deadline(
            self.settings.request_timeout,
            self.client.submit_delta_batch(&batch),
        )
        .await;

        match res {
            Ok(receipt) => {
                let acknowledged: HashSet<&IdempotencyKey> =
                    batch.events.iter().map(|e| e.key()).collect();
                let remaining = {
                    let mut events = self.events.lock();
                    events.retain(|e| !acknowledged.contains(e.key()));
                    if let Err(e) = write_json(self.store.as_ref(), QUEUE_KEY, &*events) {
                        // The acknowledged events may come back after a restart.
                        // Resending them is harmless, the server has their keys.
                        warn!("flush: could not persist the trimmed queue: {}", e);
                    }
                    events.len()
                };
                info!(
                    "flush: {} events acknowledged ({} newly applied), {} remaining",
                    sent, receipt.applied, remaining
                );
                FlushOutcome::Flushed {
                    sent,
                    applied: receipt.applied,
                    remaining,
                }
            }
            Err(e) => {
                warn!("flush: batch of {} deferred: {}", sent, e);
                FlushOutcome::Deferred {
                    pending: self.pending_len(),
                    kind: e.kind(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::testing::*;

    fn open_queue(store: Arc<MemoryStore>, server: Arc<FakeServer>) -> DeltaEventQueue {
        DeltaEventQueue::open(store, server, SyncSettings::DEFAULT_SETTINGS).unwrap()
    }

    fn keys(events: &[DeltaEvent]) -> Vec<IdempotencyKey> {
        events.iter().map(|e| e.key().clone()).collect()
    }

    #[test]
    fn keys_are_128_bit_hex_and_distinct() {
        let a = make_key();
        let b = make_key();
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn key_is_fixed_at_creation() {
        let e = DeltaEvent::new("ST-01", 1);
        let copy = e.clone();
        assert_eq!(e.key(), copy.key());
    }

    #[test]
    fn enqueue_persists_whole_queue() {
        let store = MemoryStore::shared();
        let server = FakeServer::new();
        let queue = open_queue(store.clone(), server.clone());
        queue.enqueue(DeltaEvent::new("ST-01", 1)).unwrap();
        queue.enqueue(DeltaEvent::new("ST-02", 1)).unwrap();

        let reopened = open_queue(store, server);
        assert_eq!(keys(&reopened.pending()), keys(&queue.pending()));
        assert_eq!(reopened.pending_len(), 2);
    }

    #[test]
    fn enqueue_rolls_back_on_storage_failure() {
        let store = FailingStore::shared();
        let server = FakeServer::new();
        let queue =
            DeltaEventQueue::open(store.clone(), server, SyncSettings::DEFAULT_SETTINGS).unwrap();
        queue.enqueue(DeltaEvent::new("ST-01", 1)).unwrap();
        store.fail_writes(true);
        let res = queue.enqueue(DeltaEvent::new("ST-01", 1));
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Storage);
        assert_eq!(queue.pending_len(), 1);
    }

    #[tokio::test]
    async fn flush_of_empty_queue_is_a_no_op() {
        let server = FakeServer::new();
        let queue = open_queue(MemoryStore::shared(), server.clone());
        assert_eq!(queue.flush().await, FlushOutcome::Idle);
        assert_eq!(server.batches_received(), 0);
    }

    #[tokio::test]
    async fn successful_flush_empties_the_queue() {
        let store = MemoryStore::shared();
        let server = FakeServer::new();
        let queue = open_queue(store.clone(), server.clone());
        queue.enqueue(DeltaEvent::new("ST-01", 1)).unwrap();
        queue.enqueue(DeltaEvent::new("ST-01", 1)).unwrap();

        let outcome = queue.flush().await;
        assert_eq!(
            outcome,
            FlushOutcome::Flushed {
                sent: 2,
                applied: 2,
                remaining: 0
            }
        );
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(server.checked_in("ST-01"), 2);
        // The persisted copy was trimmed too.
        assert_eq!(open_queue(store, server).pending_len(), 0);
    }

    #[tokio::test]
    async fn replayed_batch_is_not_double_counted() {
        let server = FakeServer::new();
        let queue = open_queue(MemoryStore::shared(), server.clone());
        let k1 = DeltaEvent::new("ST-07", 1);
        let k2 = DeltaEvent::new("ST-07", 1);
        queue.enqueue(k1.clone()).unwrap();
        queue.enqueue(k2.clone()).unwrap();

        assert!(matches!(
            queue.flush().await,
            FlushOutcome::Flushed { applied: 2, .. }
        ));
        assert!(queue.pending().is_empty());
        assert_eq!(server.checked_in("ST-07"), 2);

        // Same keys again, as a client that never saw the acknowledgement would.
        let replay = DeltaBatch {
            events: vec![k1, k2],
        };
        let receipt = server.submit_delta_batch(&replay).await.unwrap();
        assert_eq!(receipt.applied, 0);
        assert_eq!(server.checked_in("ST-07"), 2);
    }

    #[tokio::test]
    async fn lost_acknowledgement_is_retried_safely() {
        let server = FakeServer::new();
        let queue = open_queue(MemoryStore::shared(), server.clone());
        queue.enqueue(DeltaEvent::new("ST-03", 1)).unwrap();
        queue.enqueue(DeltaEvent::new("ST-03", 1)).unwrap();

        // The server applies the batch but the response never arrives.
        server.drop_next_batch_acks(1);
        let outcome = queue.flush().await;
        assert_eq!(
            outcome,
            FlushOutcome::Deferred {
                pending: 2,
                kind: ErrorKind::TransientNetwork
            }
        );
        assert_eq!(server.checked_in("ST-03"), 2);

        let outcome = queue.flush().await;
        assert_eq!(
            outcome,
            FlushOutcome::Flushed {
                sent: 2,
                applied: 0,
                remaining: 0
            }
        );
        assert_eq!(server.checked_in("ST-03"), 2);
    }

    #[tokio::test]
    async fn failed_flush_keeps_everything() {
        let server = FakeServer::new();
        let queue = open_queue(MemoryStore::shared(), server.clone());
        queue.enqueue(DeltaEvent::new("ST-01", 1)).unwrap();
        server.fail_next_batches(1);
        assert!(matches!(
            queue.flush().await,
            FlushOutcome::Deferred { pending: 1, .. }
        ));
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(server.checked_in("ST-01"), 0);
    }

    #[tokio::test]
    async fn event_enqueued_during_flush_survives() {
        let server = FakeServer::new();
        let queue = Arc::new(open_queue(MemoryStore::shared(), server.clone()));
        let e1 = DeltaEvent::new("ST-01", 1);
        queue.enqueue(e1).unwrap();

        let gate = server.hold_next_batch();
        let flushing = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.flush().await }
        });
        server.wait_for_batch_in_flight().await;

        let e2 = DeltaEvent::new("ST-01", 1);
        queue.enqueue(e2.clone()).unwrap();
        gate.notify_one();

        let outcome = flushing.await.unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Flushed {
                sent: 1,
                applied: 1,
                remaining: 1
            }
        );
        assert_eq!(keys(&queue.pending()), vec![e2.key().clone()]);
    }

    #[tokio::test]
    async fn concurrent_flushes_do_not_interleave() {
        let server = FakeServer::new();
        let queue = Arc::new(open_queue(MemoryStore::shared(), server.clone()));
        queue.enqueue(DeltaEvent::new("ST-01", 1)).unwrap();

        let gate = server.hold_next_batch();
        let first = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.flush().await }
        });
        server.wait_for_batch_in_flight().await;
        let second = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.flush().await }
        });
        tokio::task::yield_now().await;
        gate.notify_one();

        assert!(matches!(
            first.await.unwrap(),
            FlushOutcome::Flushed { sent: 1, .. }
        ));
        assert_eq!(second.await.unwrap(), FlushOutcome::Idle);
        assert_eq!(server.max_batches_in_flight(), 1);
        assert_eq!(server.batches_received(), 1);
    }

    #[test]
    fn check_in_is_guarded_by_cap_not_registered() {
        let queue = open_queue(MemoryStore::shared(), FakeServer::new());
        let snapshot = StationSnapshot {
            id: "ST-09".to_string(),
            registered: 700,
            cap: 3,
            checked_in: 1,
            version: None,
        };
        queue.record_check_in(&snapshot, 1).unwrap();
        queue.record_check_in(&snapshot, 1).unwrap();
        assert_eq!(queue.pending_delta("ST-09"), 2);
        assert_eq!(snapshot.remaining_capacity(queue.pending_delta("ST-09")), 0);

        let res = queue.record_check_in(&snapshot, 1);
        assert!(matches!(res, Err(SyncError::CapacityExceeded { cap: 3, .. })));
        assert_eq!(queue.pending_len(), 2);

        // Corrections are allowed as long as the total stays non-negative.
        queue.record_check_in(&snapshot, -3).unwrap();
        let res = queue.record_check_in(&snapshot, -1);
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn extreme_deltas_are_refused_without_overflow() {
        let queue = open_queue(MemoryStore::shared(), FakeServer::new());
        let snapshot = StationSnapshot {
            id: "ST-10".to_string(),
            registered: 1,
            cap: 1,
            checked_in: 1,
            version: None,
        };
        let res = queue.record_check_in(&snapshot, i64::MAX);
        assert!(matches!(res, Err(SyncError::CapacityExceeded { cap: 1, .. })));

        let huge = StationSnapshot {
            id: "ST-11".to_string(),
            registered: u64::MAX,
            cap: u64::MAX,
            checked_in: u64::MAX - 1,
            version: None,
        };
        queue.record_check_in(&huge, 1).unwrap();
        assert!(queue.record_check_in(&huge, 1).is_err());
        queue.record_check_in(&huge, i64::MIN).unwrap();
        assert_eq!(
            huge.remaining_capacity(queue.pending_delta("ST-11")),
            1i128 << 63
        );
        assert_eq!(queue.pending_len(), 2);
    }

    #[test]
    fn concurrent_check_ins_respect_the_cap() {
        let queue = open_queue(MemoryStore::shared(), FakeServer::new());
        let snapshot = StationSnapshot {
            id: "ST-12".to_string(),
            registered: 10,
            cap: 10,
            checked_in: 7,
            version: None,
        };
        let (queue, snapshot) = (&queue, &snapshot);
        let accepted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| scope.spawn(move || queue.record_check_in(snapshot, 1).is_ok()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum()
        });
        assert_eq!(accepted, 3);
        assert_eq!(queue.pending_delta("ST-12"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_server_defers_the_batch() {
        let server = FakeServer::new();
        let queue = open_queue(MemoryStore::shared(), server.clone());
        queue.enqueue(DeltaEvent::new("ST-01", 1)).unwrap();
        // Never released: the deadline fires first.
        let _gate = server.hold_next_batch();
        let outcome = queue.flush().await;
        assert_eq!(
            outcome,
            FlushOutcome::Deferred {
                pending: 1,
                kind: ErrorKind::TransientNetwork
            }
        );
    }
}
