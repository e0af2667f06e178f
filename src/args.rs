use clap::{Parser, Subcommand};

/// Field device tool for election day: queues check-ins while offline,
/// keeps tally drafts and walks the region lists.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// (file path, optional) A JSON configuration file. See the README for the keys.
    #[clap(short, long, value_parser)]
    pub config: Option<String>,

    /// (url) The base URL of the tally server. Overrides serverUrl in the configuration.
    #[clap(short, long, value_parser)]
    pub server: Option<String>,

    /// (directory) Where the queue and drafts are kept. Overrides dataDirectory (default .fieldsync).
    #[clap(long, value_parser)]
    pub data_dir: Option<String>,

    /// (election cycle id) Scopes the region lists. Overrides cycle in the configuration.
    #[clap(long, value_parser)]
    pub cycle: Option<String>,

    // Other arguments
    /// If passed as an argument, will turn on verbose logging to the standard output.
    #[clap(long, takes_value = false)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Records check-ins at a polling station and tries to send them.
    CheckIn {
        #[clap(long, value_parser)]
        station: String,
        /// (default 1) Signed number of check-ins. Negative values correct a mistake.
        #[clap(long, value_parser, default_value_t = 1, allow_hyphen_values = true)]
        delta: i64,
        /// The station's check-in cap. With --checked-in, the delta is refused if it would go over.
        #[clap(long, value_parser, requires = "checked-in")]
        cap: Option<u64>,
        /// The station's acknowledged check-in count, as last seen from the server.
        #[clap(long, value_parser, requires = "cap")]
        checked_in: Option<u64>,
    },
    /// Sends the queued check-ins once.
    Flush,
    /// Lists the queued check-ins.
    Status,
    /// Keeps retrying queued check-ins until interrupted.
    Watch,
    /// Walks the region cascade and prints the options of the next level.
    Regions {
        #[clap(long, value_parser)]
        county: Option<String>,
        #[clap(long, value_parser)]
        constituency: Option<String>,
        #[clap(long, value_parser)]
        ward: Option<String>,
        #[clap(long, value_parser)]
        polling_station: Option<String>,
    },
    /// Edits or submits the tally draft of a record.
    Draft {
        /// The record key, e.g. the polling station code.
        #[clap(long, value_parser)]
        record: String,
        /// (list of comma-separated values) The candidates of the form, in form order.
        /// Defaults to the candidates of the saved draft.
        #[clap(long, value_parser, use_value_delimiter = true)]
        candidates: Option<Vec<String>>,
        /// Registered voters at the station, used for the overflow warning.
        #[clap(long, value_parser)]
        expected_voters: Option<u64>,
        #[clap(subcommand)]
        action: DraftAction,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum DraftAction {
    Show,
    /// Sets one field. Use `rejectedVotes` for the rejected ballots.
    Set { field: String, value: String },
    /// Fills the fields in order from a list such as "120, 87, 3".
    Paste { series: String },
    /// Sets every field to zero.
    Zero,
    Submit,
    /// Drops the saved draft.
    Discard,
}
