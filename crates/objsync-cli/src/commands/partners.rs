use std::path::Path;

use chrono::Utc;
use objsync_core::sync::PartnerRegistry;

use crate::commands::common::{format_partner_lines, open_service, partner_to_list_item};
use crate::error::CliError;

pub fn run_list_partners(owner: Option<&str>, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let service = open_service(db_path)?;
    let registry = service.partners();
    let partners = match owner {
        Some(owner_id) => registry.list_by_owner(owner_id)?,
        None => registry.list()?,
    };

    if as_json {
        let items = partners.iter().map(partner_to_list_item).collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if partners.is_empty() {
        println!("No partners.");
    } else {
        for line in format_partner_lines(&partners, Utc::now().timestamp_millis()) {
            println!("{line}");
        }
    }

    Ok(())
}

pub fn run_add_partner(pid: &str, owner: &str, db_path: &Path) -> Result<(), CliError> {
    let pid = pid.trim();
    if pid.is_empty() {
        return Err(CliError::InvalidArgument("partner key cannot be empty".to_string()));
    }
    let service = open_service(db_path)?;
    let partner = service.partners().get_or_create(pid, owner.trim())?;
    println!("{} {}", partner.id, partner.pid);
    Ok(())
}

pub fn run_delete_partner(pid: &str, db_path: &Path) -> Result<(), CliError> {
    let service = open_service(db_path)?;
    if !service.partners().delete(pid)? {
        return Err(CliError::PartnerNotFound(pid.to_string()));
    }
    println!("Deleted partner {pid}");
    Ok(())
}
