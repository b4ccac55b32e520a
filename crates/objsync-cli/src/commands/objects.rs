use std::path::Path;

use crate::commands::common::{open_service, parse_fields, parse_stream_key};
use crate::error::CliError;

pub fn run_put_object(
    stream: &str,
    id: &str,
    fields: &str,
    parent: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let stream = parse_stream_key(stream)?;
    let fields = parse_fields(fields)?;
    let service = open_service(db_path)?;
    let commit_id = service.put_object(&stream, id, &fields, parent)?;
    println!("{stream} {id} @{commit_id}");
    Ok(())
}

pub fn run_delete_object(stream: &str, id: &str, db_path: &Path) -> Result<(), CliError> {
    let stream = parse_stream_key(stream)?;
    let service = open_service(db_path)?;
    match service.entities().delete(&stream, id)? {
        Some(commit_id) => println!("Deleted {stream} {id} @{commit_id}"),
        None => return Err(CliError::InvalidArgument(format!("no live object {id} in {stream}"))),
    }
    Ok(())
}
