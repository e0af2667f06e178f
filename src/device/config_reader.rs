use crate::args::Args;
use crate::device::*;

use log::debug;
use snafu::prelude::*;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JSValue;

use field_sync::SyncSettings;

/// The configuration file, as written by the operator.
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(rename = "serverUrl")]
    pub server_url: Option<String>,
    #[serde(rename = "dataDirectory")]
    pub data_directory: Option<String>,
    pub cycle: Option<String>,
    #[serde(rename = "requestTimeoutSeconds")]
    pub request_timeout_seconds: Option<JSValue>,
    #[serde(rename = "draftDebounceMillis")]
    pub draft_debounce_millis: Option<JSValue>,
    #[serde(rename = "optionsCacheTtlSeconds")]
    pub options_cache_ttl_seconds: Option<JSValue>,
    #[serde(rename = "queueWarnThreshold")]
    pub queue_warn_threshold: Option<JSValue>,
    #[serde(rename = "retryIntervalSeconds")]
    pub retry_interval_seconds: Option<JSValue>,
}

/// The validated configuration.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct DeviceSettings {
    pub server_url: String,
    pub data_directory: PathBuf,
    pub cycle: String,
    pub sync: SyncSettings,
}

pub const DEFAULT_DATA_DIRECTORY: &str = ".fieldsync";
pub const DEFAULT_CYCLE: &str = "current";

pub fn read_config(path: &str) -> DeviceResult<DeviceConfig> {
    let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
    debug!("read_config: {:?}", contents);
    serde_json::from_str(&contents).context(ParsingJsonSnafu { path })
}

impl DeviceConfig {
    /// Applies the command line overrides.
    pub fn with_overrides(mut self, args: &Args) -> DeviceConfig {
        if let Some(server) = &args.server {
            self.server_url = Some(server.clone());
        }
        if let Some(dir) = &args.data_dir {
            self.data_directory = Some(dir.clone());
        }
        if let Some(cycle) = &args.cycle {
            self.cycle = Some(cycle.clone());
        }
        self
    }

    pub fn validate(&self) -> DeviceResult<DeviceSettings> {
        let server_url = match &self.server_url {
            Some(url) if !url.trim().is_empty() => url.trim().trim_end_matches('/').to_string(),
            _ => {
                whatever!(
                    "No server configured: set serverUrl in the configuration or pass --server"
                )
            }
        };
        let defaults = SyncSettings::DEFAULT_SETTINGS;

        let request_timeout =
            match read_opt_js_int(&self.request_timeout_seconds, "requestTimeoutSeconds")? {
                Some(0) => whatever!("requestTimeoutSeconds must be at least 1"),
                Some(x) => Duration::from_secs(x),
                None => defaults.request_timeout,
            };
        let retry_interval =
            match read_opt_js_int(&self.retry_interval_seconds, "retryIntervalSeconds")? {
                Some(0) => None,
                Some(x) => Some(Duration::from_secs(x)),
                None => defaults.retry_interval,
            };
        let sync = SyncSettings {
            request_timeout,
            draft_debounce: read_opt_js_int(&self.draft_debounce_millis, "draftDebounceMillis")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.draft_debounce),
            options_cache_ttl: read_opt_js_int(
                &self.options_cache_ttl_seconds,
                "optionsCacheTtlSeconds",
            )?
            .map(Duration::from_secs)
            .unwrap_or(defaults.options_cache_ttl),
            queue_warn_threshold: read_opt_js_int(&self.queue_warn_threshold, "queueWarnThreshold")?
                .map(|x| x as usize)
                .unwrap_or(defaults.queue_warn_threshold),
            retry_interval,
        };

        Ok(DeviceSettings {
            server_url,
            data_directory: PathBuf::from(
                self.data_directory
                    .clone()
                    .unwrap_or_else(|| DEFAULT_DATA_DIRECTORY.to_string()),
            ),
            cycle: self.cycle.clone().unwrap_or_else(|| DEFAULT_CYCLE.to_string()),
            sync,
        })
    }
}

// Numbers may be written as JSON numbers or as strings.
fn read_js_int(x: &JSValue, name: &str) -> DeviceResult<u64> {
    match x {
        JSValue::Number(n) => n.as_u64().context(ParsingJsonNumberSnafu { name }),
        JSValue::String(s) => s
            .trim()
            .parse::<u64>()
            .ok()
            .context(ParsingJsonNumberSnafu { name }),
        _ => None.context(ParsingJsonNumberSnafu { name }),
    }
}

fn read_opt_js_int(x: &Option<JSValue>, name: &str) -> DeviceResult<Option<u64>> {
    x.as_ref().map(|v| read_js_int(v, name)).transpose()
}
