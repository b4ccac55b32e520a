use std::path::Path;

use objsync_core::models::{CollectionSpec, Conditions, ExportStat};
use objsync_core::sync::PartnerRegistry;
use objsync_core::Error;

use crate::commands::common::{
    change_to_item, collection_to_list_item, format_change_line, format_collection_lines,
    open_service,
};
use crate::error::CliError;

pub fn run_list_collections(pid: &str, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let service = open_service(db_path)?;
    let registry = service.partners();
    let partner = registry
        .get(pid)?
        .ok_or_else(|| CliError::PartnerNotFound(pid.to_string()))?;
    let records = registry.list_collections(partner.id)?;

    if as_json {
        let items = records.iter().map(collection_to_list_item).collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if records.is_empty() {
        println!("No collections for {pid}.");
    } else {
        for line in format_collection_lines(&records) {
            println!("{line}");
        }
    }

    Ok(())
}

pub fn run_add_collection(
    pid: &str,
    object_type: &str,
    field: Option<&str>,
    conditions: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let spec = build_spec(object_type, field, conditions)?;
    let service = open_service(db_path)?;
    let registry = service.partners();
    let partner = registry
        .get(pid)?
        .ok_or_else(|| CliError::PartnerNotFound(pid.to_string()))?;
    let record = registry.ensure_collection(partner.id, &spec)?;
    println!("{} {}", record.id, record.spec.stream_key());
    Ok(())
}

pub fn build_spec(
    object_type: &str,
    field: Option<&str>,
    conditions: Option<&str>,
) -> Result<CollectionSpec, CliError> {
    let object_type = object_type.trim();
    if object_type.is_empty() {
        return Err(CliError::InvalidArgument("object type cannot be empty".to_string()));
    }
    let spec = match field.map(str::trim).filter(|field| !field.is_empty()) {
        Some(field) => CollectionSpec::grouping(object_type, field),
        None => CollectionSpec::entity(object_type),
    };
    match conditions {
        Some(raw) => Ok(spec.with_conditions(Conditions::from_json(raw)?)),
        None => Ok(spec),
    }
}

pub fn run_pending(id: i64, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let service = open_service(db_path)?;
    let changes = service.pending_changes(id).map_err(|error| not_found(error, id))?;
    print_changes(&changes, as_json)
}

pub fn run_export_collection(id: i64, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let service = open_service(db_path)?;
    let mut sink: Vec<ExportStat> = Vec::new();
    let progress = service
        .export_batch(id, &mut sink)
        .map_err(|error| not_found(error, id))?;
    print_changes(&sink, as_json)?;
    if !as_json {
        println!("Exported {}/{} changes", progress.step, progress.steps);
    }
    Ok(())
}

pub fn run_fast_forward(id: i64, db_path: &Path) -> Result<(), CliError> {
    let service = open_service(db_path)?;
    let head = service.fast_forward(id).map_err(|error| not_found(error, id))?;
    println!("Collection {id} @{head}");
    Ok(())
}

pub fn run_remove_collection(id: i64, db_path: &Path) -> Result<(), CliError> {
    let service = open_service(db_path)?;
    if !service.partners().remove_collection(id)? {
        return Err(CliError::CollectionNotFound(id));
    }
    println!("Removed collection {id}");
    Ok(())
}

fn print_changes(changes: &[ExportStat], as_json: bool) -> Result<(), CliError> {
    if as_json {
        let items = changes.iter().map(change_to_item).collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if changes.is_empty() {
        println!("Nothing to export.");
    } else {
        for stat in changes {
            println!("{}", format_change_line(stat));
        }
    }
    Ok(())
}

fn not_found(error: Error, id: i64) -> CliError {
    match error {
        Error::NotFound(_) => CliError::CollectionNotFound(id),
        other => CliError::Core(other),
    }
}
