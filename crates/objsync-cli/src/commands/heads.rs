use std::path::Path;

use crate::commands::common::{open_service, HeadItem};
use crate::error::CliError;

pub fn run_init(db_path: &Path) -> Result<(), CliError> {
    open_service(db_path)?;
    println!("{}", db_path.display());
    Ok(())
}

pub fn run_heads(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let service = open_service(db_path)?;
    let heads = service
        .commit_heads()?
        .into_iter()
        .map(|(stream, head)| HeadItem {
            stream,
            head: head.value(),
        })
        .collect::<Vec<_>>();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&heads)?);
    } else if heads.is_empty() {
        println!("No commits yet.");
    } else {
        for item in &heads {
            println!("{:<40}  {}", item.stream, item.head);
        }
    }

    Ok(())
}
