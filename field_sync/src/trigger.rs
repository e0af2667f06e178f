//! Opportunistic flushing of the delta queue.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::queue::{DeltaEventQueue, FlushOutcome};

/// Device state transitions, as reported by the platform.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum DeviceSignal {
    Online,
    Offline,
    Visible,
    Hidden,
    /// A periodic retry opportunity.
    Tick,
}

/// Turns device signals into flushes. Only one flush is ever in progress,
/// the queue serialises concurrent callers.
pub struct SyncTrigger {
    queue: Arc<DeltaEventQueue>,
    online: bool,
    visible: bool,
}

impl SyncTrigger {
    pub fn new(queue: Arc<DeltaEventQueue>, online: bool, visible: bool) -> SyncTrigger {
        SyncTrigger {
            queue,
            online,
            visible,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Updates the tracked state and flushes when the signal is a flush
    /// opportunity: coming online, becoming visible while online, or a tick
    /// while online with work queued.
    pub async fn observe(&mut self, signal: DeviceSignal) -> Option<FlushOutcome> {
        let should_flush = match signal {
            DeviceSignal::Online => {
                let was_online = self.online;
                self.online = true;
                !was_online
            }
            DeviceSignal::Offline => {
                self.online = false;
                false
            }
            DeviceSignal::Visible => {
                let was_visible = self.visible;
                self.visible = true;
                !was_visible && self.online
            }
            DeviceSignal::Hidden => {
                self.visible = false;
                false
            }
            DeviceSignal::Tick => self.online && self.queue.pending_len() > 0,
        };
        if !should_flush {
            debug!("observe: {:?}, no flush", signal);
            return None;
        }
        let outcome = self.queue.flush().await;
        debug!("observe: {:?} -> {:?}", signal, outcome);
        Some(outcome)
    }

    /// Consumes signals until the sender side is dropped. With a retry
    /// interval, a `Tick` is also observed every `retry_interval`.
    pub async fn run(
        mut self,
        mut signals: mpsc::Receiver<DeviceSignal>,
        retry_interval: Option<Duration>,
    ) {
        let mut ticker = retry_interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        info!(
            "SyncTrigger::run: online: {}, retry every {:?}",
            self.online, retry_interval
        );
        loop {
            let signal = match ticker.as_mut() {
                Some(ticker) => tokio::select! {
                    s = signals.recv() => s,
                    _ = ticker.tick() => Some(DeviceSignal::Tick),
                },
                None => signals.recv().await,
            };
            match signal {
                Some(signal) => {
                    self.observe(signal).await;
                }
                None => break,
            }
        }
        info!(
            "SyncTrigger::run: signals closed, {} events pending",
            self.queue.pending_len()
        );
    }
}
