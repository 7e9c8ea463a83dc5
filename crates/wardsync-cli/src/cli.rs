use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "wardsync")]
#[command(about = "Capture clinical records at a facility and sync them with central")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to the facility database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create, update, delete or inspect local records
    Record {
        #[command(subcommand)]
        command: RecordCommands,
    },
    /// Run one sync round against the central server
    Sync {
        /// Central server base URL
        #[arg(long, env = "WARDSYNC_CENTRAL_URL", value_name = "URL")]
        central_url: String,
        /// This facility's id; remembered after the first sync
        #[arg(long, env = "WARDSYNC_FACILITY_ID")]
        facility_id: Option<String>,
        /// Device id reported to the admission queue
        #[arg(long, env = "WARDSYNC_DEVICE_ID")]
        device_id: Option<String>,
        /// Only pull records of these patients
        #[arg(long = "follow", value_name = "PATIENT_ID")]
        follow: Vec<String>,
        /// Ask to be admitted ahead of routine syncs
        #[arg(long)]
        urgent: bool,
        /// Records per pull page and push batch
        #[arg(long, default_value = "500")]
        page_size: u32,
    },
    /// Show the local tick and time since the last successful sync
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum RecordCommands {
    /// Write a record (insert or full update)
    #[command(alias = "put")]
    Add {
        /// Record type, e.g. Patient or Encounter
        record_type: String,
        /// JSON payload
        data: String,
        /// Record id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
        /// Patient the record belongs to
        #[arg(long)]
        patient: Option<String>,
        /// Facility the record belongs to
        #[arg(long)]
        facility: Option<String>,
    },
    /// Soft-delete a record
    Delete { record_type: String, id: String },
    /// Print a record
    Show {
        record_type: String,
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
