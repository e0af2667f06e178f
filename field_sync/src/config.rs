// ********* Synchronised data structures ***********

use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::make_key;

/// A client-generated token attached to a delta so that replaying it has no
/// further effect on the server.
#[derive(Eq, PartialEq, Debug, Clone, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for IdempotencyKey {
    fn from(s: String) -> Self {
        IdempotencyKey(s)
    }
}

impl Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An atomic signed increment to the check-in counter of a polling station.
///
/// Events are immutable once built: the key is generated exactly once, at
/// construction, and is carried unchanged through every retry.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct DeltaEvent {
    #[serde(rename = "stationId")]
    station_id: String,
    delta: i64,
    ts: DateTime<Utc>,
    key: IdempotencyKey,
}

impl DeltaEvent {
    pub fn new(station_id: impl Into<String>, delta: i64) -> DeltaEvent {
        DeltaEvent {
            station_id: station_id.into(),
            delta,
            ts: Utc::now(),
            key: make_key(),
        }
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    pub fn delta(&self) -> i64 {
        self.delta
    }

    pub fn ts(&self) -> DateTime<Utc> {
        self.ts
    }

    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }
}

/// The server's view of a polling station.
///
/// `checked_in` is the acknowledged running total. Unacknowledged local
/// deltas are applied on top of it, never in place of it.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct StationSnapshot {
    pub id: String,
    pub registered: u64,
    pub cap: u64,
    #[serde(rename = "checkedIn")]
    pub checked_in: u64,
    pub version: Option<u64>,
}

impl StationSnapshot {
    // Widened so that no combination of counts and deltas can overflow.
    pub fn projected_checked_in(&self, pending_delta: i64) -> i128 {
        i128::from(self.checked_in) + i128::from(pending_delta)
    }

    /// Limit checks are made against the cap only, the registered count is informational.
    pub fn remaining_capacity(&self, pending_delta: i64) -> i128 {
        i128::from(self.cap) - self.projected_checked_in(pending_delta)
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct DeltaBatch {
    pub events: Vec<DeltaEvent>,
}

/// `applied` is informational: the server reports how many keys it had not seen before.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct BatchReceipt {
    pub applied: u64,
}

// ********* Regions **********

/// The four levels of the region cascade, from the top.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RegionLevel {
    County,
    Constituency,
    Ward,
    PollingStation,
}

impl RegionLevel {
    pub const ALL: [RegionLevel; 4] = [
        RegionLevel::County,
        RegionLevel::Constituency,
        RegionLevel::Ward,
        RegionLevel::PollingStation,
    ];

    pub fn index(self) -> usize {
        match self {
            RegionLevel::County => 0,
            RegionLevel::Constituency => 1,
            RegionLevel::Ward => 2,
            RegionLevel::PollingStation => 3,
        }
    }

    pub fn parent(self) -> Option<RegionLevel> {
        self.index().checked_sub(1).map(|idx| RegionLevel::ALL[idx])
    }

    pub fn child(self) -> Option<RegionLevel> {
        RegionLevel::ALL.get(self.index() + 1).copied()
    }

    /// All the levels strictly below this one, top first.
    pub fn descendants(self) -> impl Iterator<Item = RegionLevel> {
        RegionLevel::ALL.into_iter().skip(self.index() + 1)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegionLevel::County => "county",
            RegionLevel::Constituency => "constituency",
            RegionLevel::Ward => "ward",
            RegionLevel::PollingStation => "pollingStation",
        }
    }
}

impl Display for RegionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Hash, Serialize, Deserialize)]
pub struct RegionOption {
    pub code: String,
    pub name: String,
}

impl RegionOption {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> RegionOption {
        RegionOption {
            code: code.into(),
            name: name.into(),
        }
    }
}

/// The chain of selected regions, stored as a path from the top level.
///
/// Downward closure holds by construction: a level can only be pushed once
/// every ancestor is present, and removing a level truncates everything below.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct RegionSelection {
    path: Vec<RegionOption>,
}

impl RegionSelection {
    pub fn get(&self, level: RegionLevel) -> Option<&RegionOption> {
        self.path.get(level.index())
    }

    pub fn code(&self, level: RegionLevel) -> Option<&str> {
        self.get(level).map(|o| o.code.as_str())
    }

    pub fn county(&self) -> Option<&RegionOption> {
        self.get(RegionLevel::County)
    }

    pub fn constituency(&self) -> Option<&RegionOption> {
        self.get(RegionLevel::Constituency)
    }

    pub fn ward(&self) -> Option<&RegionOption> {
        self.get(RegionLevel::Ward)
    }

    pub fn polling_station(&self) -> Option<&RegionOption> {
        self.get(RegionLevel::PollingStation)
    }

    /// True iff every level from the county down to `level` is selected.
    pub fn is_selected_up_to(&self, level: RegionLevel) -> bool {
        self.path.len() > level.index()
    }

    /// The deepest selected level, if any.
    pub fn deepest(&self) -> Option<RegionLevel> {
        self.path
            .len()
            .checked_sub(1)
            .map(|idx| RegionLevel::ALL[idx])
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    /// Returns false (and changes nothing) when the parent level is missing.
    pub(crate) fn select(&mut self, level: RegionLevel, option: RegionOption) -> bool {
        if self.path.len() < level.index() {
            return false;
        }
        self.path.truncate(level.index());
        self.path.push(option);
        true
    }

    pub(crate) fn clear_from(&mut self, level: RegionLevel) {
        self.path.truncate(level.index());
    }
}

// ********* Tally forms **********

/// The editable fields of a tally form.
#[derive(Eq, PartialEq, Debug, Clone, Hash, PartialOrd, Ord)]
pub enum DraftField {
    Candidate(String),
    RejectedVotes,
}

impl Display for DraftField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DraftField::Candidate(id) => write!(f, "{}", id),
            DraftField::RejectedVotes => write!(f, "rejectedVotes"),
        }
    }
}

/// The shape of a tally form as currently published by the server.
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormLayout {
    pub candidates: Vec<String>,
    #[serde(rename = "expectedRegisteredVoters")]
    pub expected_registered_voters: Option<u64>,
    pub version: Option<u64>,
}

impl FormLayout {
    /// Candidates in form order, followed by the rejected votes.
    pub fn fields(&self) -> Vec<DraftField> {
        let mut fields: Vec<DraftField> = self
            .candidates
            .iter()
            .map(|c| DraftField::Candidate(c.clone()))
            .collect();
        fields.push(DraftField::RejectedVotes);
        fields
    }

    pub fn contains(&self, field: &DraftField) -> bool {
        match field {
            DraftField::Candidate(id) => self.candidates.iter().any(|c| c == id),
            DraftField::RejectedVotes => true,
        }
    }
}

/// A scanned form or photo. Held in memory only.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Locally persisted, not yet committed, tally entries for a single record.
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormDraft {
    #[serde(rename = "recordKey")]
    pub record_key: String,
    pub entries: BTreeMap<String, u64>,
    #[serde(rename = "rejectedVotes")]
    pub rejected_votes: u64,
    pub dirty: bool,
    #[serde(rename = "baseVersion", default)]
    pub base_version: Option<u64>,
    /// The layout the draft was last edited against, so that field order
    /// and the expected voter count survive without the server.
    #[serde(default)]
    pub layout: FormLayout,
    #[serde(skip)]
    pub attachment: Option<Attachment>,
}

impl FormDraft {
    pub fn zeroed(record_key: &str, layout: &FormLayout) -> FormDraft {
        FormDraft {
            record_key: record_key.to_string(),
            entries: layout.candidates.iter().map(|c| (c.clone(), 0)).collect(),
            rejected_votes: 0,
            dirty: false,
            base_version: layout.version,
            layout: layout.clone(),
            attachment: None,
        }
    }

    pub fn get(&self, field: &DraftField) -> Option<u64> {
        match field {
            DraftField::Candidate(id) => self.entries.get(id).copied(),
            DraftField::RejectedVotes => Some(self.rejected_votes),
        }
    }

    /// Saturates at `u64::MAX`. Edits that would get there are refused.
    pub fn entries_sum(&self) -> u64 {
        self.entries
            .values()
            .fold(0u64, |acc, v| acc.saturating_add(*v))
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    #[serde(rename = "recordKey")]
    pub record_key: String,
    pub entries: BTreeMap<String, u64>,
    #[serde(rename = "rejectedVotes")]
    pub rejected_votes: u64,
    #[serde(rename = "baseVersion", skip_serializing_if = "Option::is_none")]
    pub base_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

impl CommitRequest {
    pub fn from_draft(draft: &FormDraft) -> CommitRequest {
        CommitRequest {
            record_key: draft.record_key.clone(),
            entries: draft.entries.clone(),
            rejected_votes: draft.rejected_votes,
            base_version: draft.base_version,
            attachment: draft.attachment.clone(),
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct CommitReceipt {
    #[serde(rename = "recordId")]
    pub record_id: String,
    pub version: Option<u64>,
}

// ********* Settings **********

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct SyncSettings {
    /// Deadline applied to option fetches, record commits and batch flushes.
    pub request_timeout: Duration,
    pub draft_debounce: Duration,
    pub options_cache_ttl: Duration,
    /// Queue length above which a warning is logged on every enqueue.
    pub queue_warn_threshold: usize,
    pub retry_interval: Option<Duration>,
}

impl SyncSettings {
    pub const DEFAULT_SETTINGS: SyncSettings = SyncSettings {
        request_timeout: Duration::from_secs(15),
        draft_debounce: Duration::from_millis(300),
        options_cache_ttl: Duration::from_secs(120),
        queue_warn_threshold: 500,
        retry_interval: Some(Duration::from_secs(30)),
    };
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings::DEFAULT_SETTINGS
    }
}
