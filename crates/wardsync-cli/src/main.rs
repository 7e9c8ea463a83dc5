//! wardsync CLI - facility-side record capture and sync
//!
//! Writes records into the facility database and runs sync rounds against a
//! central `wardsync-api` server.

mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::Parser;

use cli::{Cli, Commands, RecordCommands};
use commands::common::resolve_db_path;
use commands::record::{run_record_add, run_record_delete, run_record_show, NewRecord};
use commands::status::run_status;
use commands::sync::{run_sync, SyncOptions};
use error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wardsync=info".parse().expect("valid directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Record { command } => match command {
            RecordCommands::Add {
                record_type,
                data,
                id,
                patient,
                facility,
            } => {
                run_record_add(
                    NewRecord {
                        record_type: &record_type,
                        data: &data,
                        id: id.as_deref(),
                        patient: patient.as_deref(),
                        facility: facility.as_deref(),
                    },
                    &db_path,
                )
                .await?;
            }
            RecordCommands::Delete { record_type, id } => {
                run_record_delete(&record_type, &id, &db_path).await?;
            }
            RecordCommands::Show {
                record_type,
                id,
                json,
            } => run_record_show(&record_type, &id, json, &db_path).await?,
        },
        Commands::Sync {
            central_url,
            facility_id,
            device_id,
            follow,
            urgent,
            page_size,
        } => {
            run_sync(
                SyncOptions {
                    central_url,
                    facility_id,
                    device_id,
                    follow,
                    urgent,
                    page_size,
                },
                &db_path,
            )
            .await?;
        }
        Commands::Status { json } => run_status(json, &db_path).await?,
    }

    Ok(())
}
