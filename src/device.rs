use log::{debug, info, warn};

use field_sync::storage::{draft_key, read_json, FileStore, KeyValueStore};
use field_sync::*;
use snafu::{prelude::*, Snafu};

use std::sync::Arc;

use serde_json::Value as JSValue;
use tokio::sync::mpsc;

use crate::args::{Args, Command, DraftAction};
use crate::device::config_reader::*;
use crate::device::http_client::HttpSubmissionClient;
use crate::device::report::*;

pub mod config_reader;
pub mod http_client;
pub mod report;

#[derive(Debug, Snafu)]
pub enum DeviceError {
    #[snafu(display("Error opening configuration file {path}"))]
    OpeningJson {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Error parsing configuration file {path}"))]
    ParsingJson {
        source: serde_json::Error,
        path: String,
    },
    #[snafu(display("{name} must be a whole number"))]
    ParsingJsonNumber { name: String },

    #[snafu(display("{source}"))]
    Sync { source: SyncError },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error>, Some)))]
        source: Option<Box<dyn std::error::Error>>,
    },
}

impl From<SyncError> for DeviceError {
    fn from(source: SyncError) -> Self {
        DeviceError::Sync { source }
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Everything a command needs, built once from the validated settings.
struct Device {
    settings: DeviceSettings,
    store: Arc<dyn KeyValueStore>,
    client: Arc<dyn SubmissionClient>,
}

impl Device {
    fn open(settings: DeviceSettings) -> DeviceResult<Device> {
        let store = FileStore::open(&settings.data_directory)?;
        info!(
            "Device::open: data in {:?}, server {}",
            settings.data_directory, settings.server_url
        );
        let client = HttpSubmissionClient::new(&settings.server_url);
        Ok(Device {
            settings,
            store: Arc::new(store),
            client: Arc::new(client),
        })
    }

    fn queue(&self) -> DeviceResult<Arc<DeltaEventQueue>> {
        let q = DeltaEventQueue::open(
            self.store.clone(),
            self.client.clone(),
            self.settings.sync.clone(),
        )?;
        Ok(Arc::new(q))
    }
}

fn print_js(js: &JSValue) -> DeviceResult<()> {
    let pretty = serde_json::to_string_pretty(js).context(ParsingJsonSnafu { path: "stdout" })?;
    println!("{}", pretty);
    Ok(())
}

pub async fn run(args: Args) -> DeviceResult<()> {
    let config = match &args.config {
        Some(path) => read_config(path)?,
        None => DeviceConfig::default(),
    };
    let settings = config.with_overrides(&args).validate()?;
    debug!("settings: {:?}", settings);
    let device = Device::open(settings)?;

    match args.command {
        Command::CheckIn {
            station,
            delta,
            cap,
            checked_in,
        } => check_in(&device, station, delta, cap, checked_in).await,
        Command::Flush => {
            let outcome = device.queue()?.flush().await;
            print_js(&flush_outcome_to_json(&outcome))
        }
        Command::Status => print_js(&pending_to_json(&device.queue()?.pending())),
        Command::Watch => watch(&device).await,
        Command::Regions {
            county,
            constituency,
            ward,
            polling_station,
        } => regions(&device, [county, constituency, ward, polling_station]).await,
        Command::Draft {
            record,
            candidates,
            expected_voters,
            action,
        } => draft(&device, &record, candidates, expected_voters, action).await,
    }
}

async fn check_in(
    device: &Device,
    station: String,
    delta: i64,
    cap: Option<u64>,
    checked_in: Option<u64>,
) -> DeviceResult<()> {
    let queue = device.queue()?;
    let event = match (cap, checked_in) {
        (Some(cap), Some(checked_in)) => {
            let snapshot = StationSnapshot {
                id: station,
                registered: cap,
                cap,
                checked_in,
                version: None,
            };
            queue.record_check_in(&snapshot, delta)?
        }
        _ => {
            let event = DeltaEvent::new(station, delta);
            queue.enqueue(event.clone())?;
            event
        }
    };
    info!("check_in: queued {} as {}", event.delta(), event.key());

    // A one-shot command behaves like a device coming online.
    let mut trigger = SyncTrigger::new(queue, false, true);
    let outcome = trigger.observe(DeviceSignal::Online).await;
    if let Some(outcome) = outcome {
        print_js(&flush_outcome_to_json(&outcome))?;
    }
    Ok(())
}

async fn watch(device: &Device) -> DeviceResult<()> {
    let queue = device.queue()?;
    let (tx, rx) = mpsc::channel(16);
    let trigger = SyncTrigger::new(queue.clone(), false, true);
    let retry_interval = device.settings.sync.retry_interval;
    let running = tokio::spawn(trigger.run(rx, retry_interval));

    if tx.send(DeviceSignal::Online).await.is_err() {
        whatever!("The sync loop stopped unexpectedly");
    }
    info!("watch: {} events pending, Ctrl-C to stop", queue.pending_len());
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("watch: cannot listen for Ctrl-C: {}", e);
    }
    drop(tx);
    if let Err(e) = running.await {
        whatever!("The sync loop failed: {}", e);
    }
    print_js(&pending_to_json(&queue.pending()))
}

async fn regions(device: &Device, codes: [Option<String>; 4]) -> DeviceResult<()> {
    let resolver = RegionResolver::new(
        device.client.clone(),
        device.store.clone(),
        device.settings.sync.clone(),
        device.settings.cycle.clone(),
    );
    let mut outcome = resolver.load_counties().await;
    for (level, code) in RegionLevel::ALL.into_iter().zip(codes) {
        let code = match code {
            Some(code) => code,
            None => break,
        };
        if let FetchOutcome::Failed { .. } = outcome {
            break;
        }
        let option = match resolver.options(level).into_iter().find(|o| o.code == code) {
            Some(o) => o,
            None => whatever!("Unknown {} code {:?}", level, code),
        };
        outcome = resolver.select(level, option)?.await;
    }
    debug!("regions: last fetch {:?}", outcome);
    print_js(&regions_to_json(&resolver))
}

/// The form for `record`. Whatever is not given on the command line comes
/// from the layout saved with the draft, so field order stays stable.
fn draft_layout(
    store: &dyn KeyValueStore,
    record: &str,
    candidates: Option<Vec<String>>,
    expected_voters: Option<u64>,
) -> DeviceResult<FormLayout> {
    let saved: Option<FormDraft> = read_json(store, &draft_key(record))?;
    let saved = saved.map(|d| d.layout).unwrap_or_default();
    let candidates = match candidates {
        Some(c) => c,
        None if !saved.candidates.is_empty() => saved.candidates,
        None => whatever!("No saved form for {}: pass --candidates", record),
    };
    Ok(FormLayout {
        candidates,
        expected_registered_voters: expected_voters.or(saved.expected_registered_voters),
        version: saved.version,
    })
}

async fn draft(
    device: &Device,
    record: &str,
    candidates: Option<Vec<String>>,
    expected_voters: Option<u64>,
    action: DraftAction,
) -> DeviceResult<()> {
    let layout = draft_layout(device.store.as_ref(), record, candidates, expected_voters)?;
    let draft = DraftStore::load(
        device.store.clone(),
        device.client.clone(),
        device.settings.sync.clone(),
        record,
        layout,
    )?;

    match action {
        DraftAction::Show => {}
        DraftAction::Set { field, value } => {
            let field = if field == DraftField::RejectedVotes.to_string() {
                DraftField::RejectedVotes
            } else {
                DraftField::Candidate(field)
            };
            draft.set_input(field, &value)?;
        }
        DraftAction::Paste { series } => {
            let written = draft.paste_series(&series)?;
            info!("draft: {} fields filled", written);
        }
        DraftAction::Zero => {
            draft.zero_fill()?;
        }
        DraftAction::Submit => {
            let outcome = draft.submit().await?;
            if let Some(w) = &outcome.overflow {
                warn!(
                    "{} ballots cast for {} registered voters ({} over)",
                    w.total_cast, w.expected_registered_voters, w.excess
                );
            }
            println!("committed {}", outcome.receipt.record_id);
        }
        DraftAction::Discard => {
            draft.close(Some(CloseDecision::Discard))?;
            println!("discarded {}", record);
            return Ok(());
        }
    }
    draft.close(Some(CloseDecision::Keep))?;
    print_js(&draft_to_json(&draft))
}
