use std::collections::BTreeMap;

use serde_json::json;
use serde_json::Map as JSMap;
use serde_json::Value as JSValue;

use field_sync::*;

pub fn flush_outcome_to_json(outcome: &FlushOutcome) -> JSValue {
    match outcome {
        FlushOutcome::Idle => json!({"flush": "idle"}),
        FlushOutcome::Flushed {
            sent,
            applied,
            remaining,
        } => json!({
            "flush": "sent",
            "sent": sent,
            "applied": applied,
            "remaining": remaining
        }),
        FlushOutcome::Deferred { pending, kind } => json!({
            "flush": "deferred",
            "pending": pending,
            "reason": format!("{:?}", kind)
        }),
    }
}

/// Pending events with the net delta per station.
pub fn pending_to_json(events: &[DeltaEvent]) -> JSValue {
    let mut per_station: BTreeMap<&str, i64> = BTreeMap::new();
    for e in events.iter() {
        let net = per_station.entry(e.station_id()).or_default();
        *net = net.saturating_add(e.delta());
    }
    let mut stations: JSMap<String, JSValue> = JSMap::new();
    for (station, delta) in per_station {
        stations.insert(station.to_string(), json!(delta));
    }
    let oldest = events.iter().map(|e| e.ts()).min();
    json!({
        "pending": events.len(),
        "stations": stations,
        "oldest": oldest.map(|ts| ts.to_rfc3339())
    })
}

pub fn regions_to_json(resolver: &RegionResolver) -> JSValue {
    let selection = resolver.selection();
    let mut selected: JSMap<String, JSValue> = JSMap::new();
    for level in RegionLevel::ALL {
        if let Some(o) = selection.get(level) {
            selected.insert(level.to_string(), json!({"code": o.code, "name": o.name}));
        }
    }
    let mut levels: Vec<JSValue> = Vec::new();
    for level in RegionLevel::ALL {
        let status = resolver.status(level);
        let options = resolver.options(level);
        if options.is_empty() && status.error.is_none() {
            continue;
        }
        levels.push(json!({
            "level": level.to_string(),
            "options": options,
            "error": status.error
        }));
    }
    json!({"cycle": resolver.cycle(), "selection": selected, "levels": levels})
}

pub fn draft_to_json(draft: &DraftStore) -> JSValue {
    let d = draft.draft();
    let mut fields: JSMap<String, JSValue> = JSMap::new();
    for f in draft.fields() {
        fields.insert(f.to_string(), json!(d.get(&f).unwrap_or(0)));
    }
    let errors: JSMap<String, JSValue> = draft
        .field_errors()
        .into_iter()
        .map(|(f, msg)| (f.to_string(), json!(msg)))
        .collect();
    json!({
        "recordKey": d.record_key,
        "fields": fields,
        "dirty": d.dirty,
        "baseVersion": d.base_version,
        "totals": draft.totals(),
        "errors": errors
    })
}
