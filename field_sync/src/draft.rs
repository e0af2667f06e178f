//! Local drafts of tally forms and the commit workflow.
//!
//! A draft is persisted under its record key on every edit (debounced), so
//! it survives reloads, and is only cleared after the server confirmed the
//! commit.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use snafu::prelude::*;

use crate::client::{with_deadline, SubmissionClient};
use crate::config::*;
use crate::error::*;
use crate::storage::{draft_key, read_json, write_json, KeyValueStore};

/// Raised when more ballots were cast than there are registered voters.
/// Informational only: the record can still be submitted.
#[derive(Eq, PartialEq, Debug, Clone, Serialize)]
pub struct OverflowWarning {
    #[serde(rename = "totalCast")]
    pub total_cast: u64,
    #[serde(rename = "expectedRegisteredVoters")]
    pub expected_registered_voters: u64,
    pub excess: u64,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize)]
pub struct DraftTotals {
    #[serde(rename = "entriesSum")]
    pub entries_sum: u64,
    #[serde(rename = "rejectedVotes")]
    pub rejected_votes: u64,
    #[serde(rename = "totalCast")]
    pub total_cast: u64,
    #[serde(rename = "expectedRegisteredVoters")]
    pub expected_registered_voters: Option<u64>,
    pub overflow: Option<OverflowWarning>,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct SubmitOutcome {
    pub receipt: CommitReceipt,
    pub overflow: Option<OverflowWarning>,
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum CloseDecision {
    Keep,
    Discard,
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum CloseOutcome {
    Closed,
    /// The draft has unsaved edits: ask the user to keep or discard them.
    NeedsConfirmation,
}

struct DraftState {
    draft: FormDraft,
    layout: FormLayout,
    field_errors: BTreeMap<DraftField, String>,
    // Bumped on every edit.
    revision: u64,
    // Bumped whenever a scheduled write must not happen anymore.
    save_generation: u64,
}

impl DraftState {
    fn apply(&mut self, field: &DraftField, value: u64) {
        match field {
            DraftField::Candidate(id) => {
                self.draft.entries.insert(id.clone(), value);
            }
            DraftField::RejectedVotes => self.draft.rejected_votes = value,
        }
        self.field_errors.remove(field);
        self.draft.dirty = true;
        self.revision += 1;
    }

    // Edits after which the votes no longer add up in a u64 are refused.
    fn check_total(&self, changes: &[(&DraftField, u64)]) -> SyncResult<()> {
        let mut entries = self.draft.entries.clone();
        let mut rejected_votes = self.draft.rejected_votes;
        for (field, value) in changes.iter() {
            match field {
                DraftField::Candidate(id) => {
                    entries.insert(id.clone(), *value);
                }
                DraftField::RejectedVotes => rejected_votes = *value,
            }
        }
        let total = entries
            .values()
            .try_fold(rejected_votes, |acc, v| acc.checked_add(*v));
        ensure!(
            total.is_some(),
            InvalidFieldSnafu {
                field: changes
                    .first()
                    .map(|(f, _)| f.to_string())
                    .unwrap_or_else(|| "votes".to_string()),
                message: "the total number of votes is too large",
            }
        );
        Ok(())
    }

    fn totals(&self) -> DraftTotals {
        let entries_sum = self.draft.entries_sum();
        let rejected_votes = self.draft.rejected_votes;
        let total_cast = entries_sum.saturating_add(rejected_votes);
        let expected = self.layout.expected_registered_voters;
        let overflow = match expected {
            Some(expected) if total_cast > expected => Some(OverflowWarning {
                total_cast,
                expected_registered_voters: expected,
                excess: total_cast - expected,
            }),
            _ => None,
        };
        DraftTotals {
            entries_sum,
            rejected_votes,
            total_cast,
            expected_registered_voters: expected,
            overflow,
        }
    }

    fn reset(&mut self, base_version: Option<u64>) {
        let mut layout = self.layout.clone();
        layout.version = base_version;
        self.draft = FormDraft::zeroed(&self.draft.record_key, &layout);
        self.field_errors.clear();
        self.revision += 1;
        self.save_generation += 1;
    }
}

struct DraftInner {
    store: Arc<dyn KeyValueStore>,
    client: Arc<dyn SubmissionClient>,
    settings: SyncSettings,
    key: String,
    state: Mutex<DraftState>,
}

impl DraftInner {
    fn write(&self, draft: &FormDraft) -> SyncResult<()> {
        write_json(self.store.as_ref(), &self.key, draft)
    }

    // Runs after the server confirmed a commit, so it only logs. If the
    // draft cannot be removed a clean copy is written over it instead.
    fn discard_committed(&self, cleared: &FormDraft) {
        if let Err(e) = self.store.remove(&self.key) {
            warn!("discard_committed: cannot remove {}: {}", self.key, e);
            if let Err(e) = self.write(cleared) {
                warn!("discard_committed: {} is stale on disk: {}", self.key, e);
            }
        }
    }
}

/// The editable draft of one record. Clones share the same draft.
///
/// Edits schedule a debounced write on the Tokio runtime, so the mutating
/// methods must be called from within one.
#[derive(Clone)]
pub struct DraftStore {
    inner: Arc<DraftInner>,
}

impl DraftStore {
    /// Restores the persisted draft for `record_key`, or starts a zeroed one.
    pub fn load(
        store: Arc<dyn KeyValueStore>,
        client: Arc<dyn SubmissionClient>,
        settings: SyncSettings,
        record_key: &str,
        layout: FormLayout,
    ) -> SyncResult<DraftStore> {
        let key = draft_key(record_key);
        let draft = match read_json::<FormDraft>(store.as_ref(), &key)? {
            Some(mut draft) => {
                info!(
                    "DraftStore::load: restored draft for {} (dirty: {})",
                    record_key, draft.dirty
                );
                for c in layout.candidates.iter() {
                    draft.entries.entry(c.clone()).or_insert(0);
                }
                draft.entries.retain(|c, _| layout.candidates.contains(c));
                draft.layout = layout.clone();
                draft
            }
            None => {
                debug!("DraftStore::load: new draft for {}", record_key);
                FormDraft::zeroed(record_key, &layout)
            }
        };
        Ok(DraftStore {
            inner: Arc::new(DraftInner {
                store,
                client,
                settings,
                key,
                state: Mutex::new(DraftState {
                    draft,
                    layout,
                    field_errors: BTreeMap::new(),
                    revision: 0,
                    save_generation: 0,
                }),
            }),
        })
    }

    pub fn record_key(&self) -> String {
        self.inner.state.lock().draft.record_key.clone()
    }

    pub fn draft(&self) -> FormDraft {
        self.inner.state.lock().draft.clone()
    }

    pub fn get(&self, field: &DraftField) -> Option<u64> {
        self.inner.state.lock().draft.get(field)
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.state.lock().draft.dirty
    }

    /// The current field list: candidates in form order, then rejected votes.
    pub fn fields(&self) -> Vec<DraftField> {
        self.inner.state.lock().layout.fields()
    }

    pub fn field_errors(&self) -> BTreeMap<DraftField, String> {
        self.inner.state.lock().field_errors.clone()
    }

    pub fn totals(&self) -> DraftTotals {
        self.inner.state.lock().totals()
    }

    pub fn set(&self, field: DraftField, value: u64) -> SyncResult<()> {
        let mut state = self.inner.state.lock();
        ensure!(
            state.layout.contains(&field),
            InvalidFieldSnafu {
                field: field.to_string(),
                message: "not on this form",
            }
        );
        state.check_total(&[(&field, value)])?;
        state.apply(&field, value);
        self.schedule_save(&mut state);
        Ok(())
    }

    /// Sets a field from user input. Blank means zero.
    ///
    /// Malformed input is recorded against the field (see
    /// [`DraftStore::field_errors`]) and blocks submission until corrected.
    pub fn set_input(&self, field: DraftField, raw: &str) -> SyncResult<()> {
        let raw = raw.trim();
        let parsed = if raw.is_empty() {
            Ok(0)
        } else {
            raw.parse::<u64>()
        };
        match parsed {
            Ok(value) => self.set(field, value),
            Err(_) => {
                let message = format!("{:?} is not a whole number of votes", raw);
                self.inner
                    .state
                    .lock()
                    .field_errors
                    .insert(field.clone(), message.clone());
                InvalidFieldSnafu {
                    field: field.to_string(),
                    message,
                }
                .fail()
            }
        }
    }

    /// Sets every field to zero. Returns the number of fields written.
    pub fn zero_fill(&self) -> SyncResult<usize> {
        let fields = self.fields();
        let zeros = vec![0; fields.len()];
        self.apply_to_fields(&fields, &zeros)
    }

    /// Maps a delimited series of counts onto the fields, in order.
    ///
    /// Tokens are separated by commas, semicolons or whitespace. All of them
    /// are validated before anything is written. Values past the last field
    /// are ignored, malformed or not.
    pub fn paste_series(&self, series: &str) -> SyncResult<usize> {
        let fields = self.fields();
        let tokens = series
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|t| !t.is_empty());
        let mut values: Vec<u64> = Vec::with_capacity(fields.len());
        for (field, token) in fields.iter().zip(tokens) {
            let value = token.parse::<u64>().ok().context(InvalidFieldSnafu {
                field: field.to_string(),
                message: format!("{:?} is not a whole number of votes", token),
            })?;
            values.push(value);
        }
        self.apply_to_fields(&fields, &values)
    }

    // `fields` is a snapshot taken when the bulk operation started. Fields
    // that have left the form since then are skipped.
    fn apply_to_fields(&self, fields: &[DraftField], values: &[u64]) -> SyncResult<usize> {
        let mut state = self.inner.state.lock();
        let mut changes: Vec<(&DraftField, u64)> = Vec::with_capacity(values.len());
        for (field, value) in fields.iter().zip(values.iter()) {
            if state.layout.contains(field) {
                changes.push((field, *value));
            } else {
                debug!("apply_to_fields: {} was removed from the form", field);
            }
        }
        state.check_total(&changes)?;
        for (field, value) in changes.iter() {
            state.apply(field, *value);
        }
        if !changes.is_empty() {
            self.schedule_save(&mut state);
        }
        Ok(changes.len())
    }

    /// Replaces the form layout. Candidates no longer on the form are dropped
    /// from the draft, new ones start at zero.
    pub fn set_layout(&self, layout: FormLayout) {
        let mut state = self.inner.state.lock();
        for c in layout.candidates.iter() {
            state.draft.entries.entry(c.clone()).or_insert(0);
        }
        state
            .draft
            .entries
            .retain(|c, _| layout.candidates.contains(c));
        state.field_errors.retain(|f, _| layout.contains(f));
        state.draft.layout = layout.clone();
        state.layout = layout;
        if state.draft.dirty {
            self.schedule_save(&mut state);
        }
    }

    /// Attaches a scanned form. Kept in memory only, it is never persisted.
    pub fn attach(&self, attachment: Attachment) {
        let mut state = self.inner.state.lock();
        state.draft.attachment = Some(attachment);
        state.draft.dirty = true;
        state.revision += 1;
        self.schedule_save(&mut state);
    }

    /// Writes the draft now and cancels any pending debounced write.
    pub fn persist_now(&self) -> SyncResult<()> {
        let mut state = self.inner.state.lock();
        state.save_generation += 1;
        self.inner.write(&state.draft)
    }

    fn schedule_save(&self, state: &mut DraftState) {
        state.save_generation += 1;
        let generation = state.save_generation;
        let inner = Arc::clone(&self.inner);
        let delay = self.inner.settings.draft_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Written under the lock so writes land in the order they were issued.
            let state = inner.state.lock();
            if state.save_generation != generation {
                return;
            }
            match inner.write(&state.draft) {
                Ok(()) => debug!("autosave: {} written", inner.key),
                Err(e) => warn!("autosave: {} failed: {}", inner.key, e),
            }
        });
    }

    /// Commits the draft.
    ///
    /// Nothing is sent while a field has an input error or no candidate has
    /// any votes. An overflow of registered voters does not block the commit,
    /// it is returned alongside the receipt.
    ///
    /// On failure the draft stays dirty and is persisted immediately. Once the
    /// server accepted the record, local storage failures are only logged.
    pub async fn submit(&self) -> SyncResult<SubmitOutcome> {
        let (request, revision, overflow) = {
            let state = self.inner.state.lock();
            if let Some((field, message)) = state.field_errors.iter().next() {
                return InvalidFieldSnafu {
                    field: field.to_string(),
                    message: message.clone(),
                }
                .fail();
            }
            ensure!(
                state.draft.entries.values().any(|v| *v > 0),
                EmptySubmissionSnafu {}
            );
            let overflow = state.totals().overflow;
            (CommitRequest::from_draft(&state.draft), state.revision, overflow)
        };
        if let Some(w) = &overflow {
            warn!(
                "submit: {} ballots cast for {} registered voters on {}",
                w.total_cast, w.expected_registered_voters, request.record_key
            );
        }

        let res = with_deadline(
            self.inner.settings.request_timeout,
            self.inner.client.commit_record(&request),
        )
        .await;

        match res {
            Ok(receipt) => {
                let mut state = self.inner.state.lock();
                if state.revision == revision {
                    state.reset(receipt.version);
                    self.inner.discard_committed(&state.draft);
                    info!(
                        "submit: {} committed as {}",
                        request.record_key, receipt.record_id
                    );
                } else {
                    // Edited while the commit was in flight: keep the newer values.
                    state.draft.base_version = receipt.version;
                    state.save_generation += 1;
                    if let Err(e) = self.inner.write(&state.draft) {
                        warn!("submit: could not persist later edits: {}", e);
                    }
                    info!(
                        "submit: {} committed as {}, later edits kept",
                        request.record_key, receipt.record_id
                    );
                }
                Ok(SubmitOutcome { receipt, overflow })
            }
            Err(source) => {
                warn!("submit: {} not committed: {}", request.record_key, source);
                if let Err(e) = self.persist_now() {
                    warn!("submit: could not persist {}: {}", request.record_key, e);
                }
                Err(SyncError::Remote { source })
            }
        }
    }

    /// Closes the editor. A dirty draft is only closed with an explicit decision.
    pub fn close(&self, decision: Option<CloseDecision>) -> SyncResult<CloseOutcome> {
        if !self.is_dirty() {
            return Ok(CloseOutcome::Closed);
        }
        match decision {
            None => Ok(CloseOutcome::NeedsConfirmation),
            Some(CloseDecision::Keep) => {
                self.persist_now()?;
                Ok(CloseOutcome::Closed)
            }
            Some(CloseDecision::Discard) => {
                let mut state = self.inner.state.lock();
                let base_version = state.layout.version;
                state.reset(base_version);
                self.inner.store.remove(&self.inner.key)?;
                info!("close: discarded draft {}", self.inner.key);
                Ok(CloseOutcome::Closed)
            }
        }
    }
}
