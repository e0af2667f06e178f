//! The County -> Constituency -> Ward -> Polling Station cascade.
//!
//! Every selection change is a synchronous transition: it rewrites the
//! selection, empties the option lists below the changed level and
//! invalidates their in-flight fetches before anything is awaited. The fetch
//! it triggers is returned as a future. When that future resolves it only
//! applies its response if the level's generation is still the one it was
//! issued under; otherwise the response is dropped.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::client::{with_deadline, SubmissionClient};
use crate::config::*;
use crate::error::*;
use crate::storage::{options_key, read_json, write_json, KeyValueStore};

/// Per-level loading state, as shown next to the option list.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct LevelStatus {
    pub loading: bool,
    pub error: Option<String>,
}

/// How an options fetch ended.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum FetchOutcome {
    Loaded { level: RegionLevel, count: usize },
    /// The level now carries the error and an empty option list.
    Failed { level: RegionLevel, kind: ErrorKind },
    /// A newer selection made this fetch irrelevant. Never reported to the user.
    Superseded { level: RegionLevel },
    /// A polling station was selected, there is nothing below it.
    Leaf,
}

#[derive(Default)]
struct LevelState {
    options: Vec<RegionOption>,
    status: LevelStatus,
    generation: u64,
    cancel: Option<CancellationToken>,
}

impl LevelState {
    /// Invalidates whatever was loaded or loading for this level.
    fn reset(&mut self) {
        self.generation += 1;
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.options.clear();
        self.status = LevelStatus::default();
    }
}

struct ResolverState {
    cycle: String,
    selection: RegionSelection,
    levels: [LevelState; 4],
}

// Everything a fetch needs once it leaves the lock.
struct FetchTicket {
    level: RegionLevel,
    parent_code: Option<String>,
    cycle: String,
    generation: u64,
    token: CancellationToken,
}

impl ResolverState {
    fn level_mut(&mut self, level: RegionLevel) -> &mut LevelState {
        &mut self.levels[level.index()]
    }

    fn start_fetch(&mut self, level: RegionLevel, parent_code: Option<String>) -> FetchTicket {
        let cycle = self.cycle.clone();
        let state = self.level_mut(level);
        state.reset();
        state.status.loading = true;
        let token = CancellationToken::new();
        state.cancel = Some(token.clone());
        FetchTicket {
            level,
            parent_code,
            cycle,
            generation: state.generation,
            token,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CachedOptions {
    #[serde(rename = "fetchedAt")]
    fetched_at: DateTime<Utc>,
    options: Vec<RegionOption>,
}

struct Inner {
    client: Arc<dyn SubmissionClient>,
    store: Arc<dyn KeyValueStore>,
    settings: SyncSettings,
    state: Mutex<ResolverState>,
}

/// Cheap to clone; clones share the same selection.
#[derive(Clone)]
pub struct RegionResolver {
    inner: Arc<Inner>,
}

impl RegionResolver {
    /// An empty selection for `cycle`. Call [`RegionResolver::load_counties`] to populate the top level.
    pub fn new(
        client: Arc<dyn SubmissionClient>,
        store: Arc<dyn KeyValueStore>,
        settings: SyncSettings,
        cycle: impl Into<String>,
    ) -> RegionResolver {
        RegionResolver {
            inner: Arc::new(Inner {
                client,
                store,
                settings,
                state: Mutex::new(ResolverState {
                    cycle: cycle.into(),
                    selection: RegionSelection::default(),
                    levels: Default::default(),
                }),
            }),
        }
    }

    pub fn cycle(&self) -> String {
        self.inner.state.lock().cycle.clone()
    }

    pub fn selection(&self) -> RegionSelection {
        self.inner.state.lock().selection.clone()
    }

    pub fn options(&self, level: RegionLevel) -> Vec<RegionOption> {
        self.inner.state.lock().levels[level.index()].options.clone()
    }

    pub fn status(&self, level: RegionLevel) -> LevelStatus {
        self.inner.state.lock().levels[level.index()].status.clone()
    }

    /// True iff every level from the county down to `level` is selected.
    /// Callers gate record editing on this.
    pub fn is_selected_up_to(&self, level: RegionLevel) -> bool {
        self.inner.state.lock().selection.is_selected_up_to(level)
    }

    pub fn load_counties(&self) -> impl Future<Output = FetchOutcome> + Send + 'static {
        let ticket = self
            .inner
            .state
            .lock()
            .start_fetch(RegionLevel::County, None);
        self.run(Some(ticket))
    }

    pub fn select_county(
        &self,
        county: RegionOption,
    ) -> SyncResult<impl Future<Output = FetchOutcome> + Send + 'static> {
        self.select(RegionLevel::County, county)
    }

    pub fn select_constituency(
        &self,
        constituency: RegionOption,
    ) -> SyncResult<impl Future<Output = FetchOutcome> + Send + 'static> {
        self.select(RegionLevel::Constituency, constituency)
    }

    pub fn select_ward(
        &self,
        ward: RegionOption,
    ) -> SyncResult<impl Future<Output = FetchOutcome> + Send + 'static> {
        self.select(RegionLevel::Ward, ward)
    }

    pub fn select_polling_station(
        &self,
        station: RegionOption,
    ) -> SyncResult<impl Future<Output = FetchOutcome> + Send + 'static> {
        self.select(RegionLevel::PollingStation, station)
    }

    /// Selects `option` at `level`, discarding any selection below it.
    ///
    /// The transition has already happened when this returns. The returned
    /// future loads the options of the level below.
    pub fn select(
        &self,
        level: RegionLevel,
        option: RegionOption,
    ) -> SyncResult<impl Future<Output = FetchOutcome> + Send + 'static> {
        let ticket = {
            let mut state = self.inner.state.lock();
            if let Some(parent) = level.parent() {
                ensure!(
                    state.selection.is_selected_up_to(parent),
                    MissingAncestorSnafu { level, parent }
                );
            }
            debug!("select: {} = {:?}", level, option.code);
            let code = option.code.clone();
            state.selection.select(level, option);
            for below in level.descendants() {
                state.level_mut(below).reset();
            }
            level.child().map(|child| state.start_fetch(child, Some(code)))
        };
        Ok(self.run(ticket))
    }

    /// Clears `level` and every level below it. Clearing the county resets the whole selection.
    pub fn clear(&self, level: RegionLevel) {
        let mut state = self.inner.state.lock();
        debug!("clear: {} and below", level);
        state.selection.clear_from(level);
        for below in level.descendants() {
            state.level_mut(below).reset();
        }
    }

    /// Re-issues the fetch for `level`, typically after it failed.
    pub fn reload(
        &self,
        level: RegionLevel,
    ) -> SyncResult<impl Future<Output = FetchOutcome> + Send + 'static> {
        let ticket = {
            let mut state = self.inner.state.lock();
            let parent_code = match level.parent() {
                Some(parent) => {
                    let code = state.selection.code(parent).map(str::to_string);
                    ensure!(code.is_some(), MissingAncestorSnafu { level, parent });
                    code
                }
                None => None,
            };
            state.start_fetch(level, parent_code)
        };
        Ok(self.run(Some(ticket)))
    }

    /// Moves to another election cycle: the selection is reset and the
    /// counties of the new cycle are fetched.
    pub fn set_cycle(
        &self,
        cycle: impl Into<String>,
    ) -> impl Future<Output = FetchOutcome> + Send + 'static {
        let ticket = {
            let mut state = self.inner.state.lock();
            state.cycle = cycle.into();
            info!("set_cycle: switching to {}", state.cycle);
            state.selection.clear_from(RegionLevel::County);
            for level in RegionLevel::ALL {
                state.level_mut(level).reset();
            }
            state.start_fetch(RegionLevel::County, None)
        };
        self.run(Some(ticket))
    }

    fn run(
        &self,
        ticket: Option<FetchTicket>,
    ) -> impl Future<Output = FetchOutcome> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        async move {
            match ticket {
                Some(ticket) => inner.fetch(ticket).await,
                None => FetchOutcome::Leaf,
            }
        }
    }
}

impl Inner {
    async fn fetch(&self, ticket: FetchTicket) -> FetchOutcome {
        let FetchTicket {
            level,
            parent_code,
            cycle,
            generation,
            token,
        } = ticket;
        let cache_key = options_key(&cycle, level, parent_code.as_deref());

        let res = match self.cached(&cache_key) {
            Some(options) => {
                debug!("fetch: {} served from cache", cache_key);
                Ok(options)
            }
            None => {
                let call = with_deadline(
                    self.settings.request_timeout,
                    self.client
                        .fetch_options(level, parent_code.as_deref(), &cycle),
                );
                let res = tokio::select! {
                    _ = token.cancelled() => {
                        debug!("fetch: {} cancelled", cache_key);
                        return FetchOutcome::Superseded { level };
                    }
                    res = call => res,
                };
                if let Ok(options) = &res {
                    self.remember(&cache_key, options);
                }
                res
            }
        };

        let mut state = self.state.lock();
        let current = state.level_mut(level);
        if current.generation != generation {
            debug!("fetch: dropping stale response for {}", cache_key);
            return FetchOutcome::Superseded { level };
        }
        current.cancel = None;
        current.status.loading = false;
        match res {
            Ok(options) => {
                let count = options.len();
                current.options = options;
                current.status.error = None;
                FetchOutcome::Loaded { level, count }
            }
            Err(e) => {
                warn!("fetch: loading {} options failed: {}", level, e);
                current.options.clear();
                current.status.error = Some(e.to_string());
                FetchOutcome::Failed {
                    level,
                    kind: e.kind(),
                }
            }
        }
    }

    // Expired or unreadable entries are dropped without complaint.
    fn cached(&self, key: &str) -> Option<Vec<RegionOption>> {
        let entry: Option<CachedOptions> = match read_json(self.store.as_ref(), key) {
            Ok(entry) => entry,
            Err(e) => {
                debug!("cached: discarding {}: {}", key, e);
                None
            }
        };
        let entry = entry?;
        let fresh = match (Utc::now() - entry.fetched_at).to_std() {
            Ok(age) => age < self.settings.options_cache_ttl,
            Err(_) => false,
        };
        if fresh {
            Some(entry.options)
        } else {
            if let Err(e) = self.store.remove(key) {
                debug!("cached: could not remove {}: {}", key, e);
            }
            None
        }
    }

    fn remember(&self, key: &str, options: &[RegionOption]) {
        let entry = CachedOptions {
            fetched_at: Utc::now(),
            options: options.to_vec(),
        };
        if let Err(e) = write_json(self.store.as_ref(), key, &entry) {
            debug!("remember: could not cache {}: {}", key, e);
        }
    }
}
