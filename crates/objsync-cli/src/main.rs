//! objsync CLI - administer a sync database from the terminal
//!
//! Inspects stream heads, partners and their collections, and device states.

mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::Parser;

use crate::cli::{
    Cli, CollectionCommands, Commands, DeviceCommands, ObjectCommands, PartnerCommands,
};
use crate::commands::collections::{
    run_add_collection, run_export_collection, run_fast_forward, run_list_collections,
    run_pending, run_remove_collection,
};
use crate::commands::common::resolve_db_path;
use crate::commands::completions::run_completions;
use crate::commands::devices::{
    run_clean_states, run_link, run_list_devices, run_orphans, run_unlink, run_users,
};
use crate::commands::heads::{run_heads, run_init};
use crate::commands::objects::{run_delete_object, run_put_object};
use crate::commands::partners::{run_add_partner, run_delete_partner, run_list_partners};
use crate::error::CliError;

fn main() {
    if let Err(error) = run() {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("objsync=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Init => run_init(&db_path)?,
        Commands::Heads { json } => run_heads(json, &db_path)?,
        Commands::Objects { command } => match command {
            ObjectCommands::Put {
                stream,
                id,
                fields,
                parent,
            } => run_put_object(&stream, &id, &fields, parent.as_deref(), &db_path)?,
            ObjectCommands::Delete { stream, id } => run_delete_object(&stream, &id, &db_path)?,
        },
        Commands::Partners { command } => match command {
            PartnerCommands::List { owner, json } => {
                run_list_partners(owner.as_deref(), json, &db_path)?;
            }
            PartnerCommands::Add { pid, owner } => run_add_partner(&pid, &owner, &db_path)?,
            PartnerCommands::Delete { pid } => run_delete_partner(&pid, &db_path)?,
        },
        Commands::Collections { command } => match command {
            CollectionCommands::List { pid, json } => run_list_collections(&pid, json, &db_path)?,
            CollectionCommands::Add {
                pid,
                object_type,
                field,
                conditions,
            } => run_add_collection(
                &pid,
                &object_type,
                field.as_deref(),
                conditions.as_deref(),
                &db_path,
            )?,
            CollectionCommands::Pending { id, json } => run_pending(id, json, &db_path)?,
            CollectionCommands::Export { id, json } => run_export_collection(id, json, &db_path)?,
            CollectionCommands::FastForward { id } => run_fast_forward(id, &db_path)?,
            CollectionCommands::Remove { id } => run_remove_collection(id, &db_path)?,
        },
        Commands::Devices { command } => match command {
            DeviceCommands::List { user, json } => {
                run_list_devices(user.as_deref(), json, &db_path)?;
            }
            DeviceCommands::Orphans => run_orphans(&db_path)?,
            DeviceCommands::Users { device } => run_users(&device, &db_path)?,
            DeviceCommands::Link { user, device } => run_link(&user, &device, &db_path)?,
            DeviceCommands::Unlink { user, device } => run_unlink(&user, &device, &db_path)?,
            DeviceCommands::Clean {
                device,
                state_type,
                uuid,
                counter,
                only,
            } => run_clean_states(
                &device,
                &state_type,
                uuid.as_deref(),
                counter,
                only,
                &db_path,
            )?,
        },
        Commands::Completions { shell, output } => {
            run_completions(shell, output.as_deref())?;
        }
    }

    Ok(())
}
