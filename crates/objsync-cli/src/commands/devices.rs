use std::path::Path;

use crate::commands::common::open_service;
use crate::error::CliError;

pub fn run_list_devices(user: Option<&str>, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let service = open_service(db_path)?;
    let devices = service.device_states().get_all_devices(user)?;
    print_names(&devices, as_json, "No devices.")
}

pub fn run_orphans(db_path: &Path) -> Result<(), CliError> {
    let service = open_service(db_path)?;
    let devices = service.device_states().get_orphaned_devices()?;
    print_names(&devices, false, "No orphaned devices.")
}

pub fn run_users(device: &str, db_path: &Path) -> Result<(), CliError> {
    let service = open_service(db_path)?;
    let users = service.device_states().get_device_users(device)?;
    print_names(&users, false, "No users linked.")
}

pub fn run_link(user: &str, device: &str, db_path: &Path) -> Result<(), CliError> {
    let service = open_service(db_path)?;
    if service.device_states().link_user_device(user, device)? {
        println!("Linked {user} to {device}");
    } else {
        println!("{user} is already linked to {device}");
    }
    Ok(())
}

pub fn run_unlink(user: &str, device: &str, db_path: &Path) -> Result<(), CliError> {
    let service = open_service(db_path)?;
    if service.device_states().unlink_user_device(user, device)? {
        println!("Unlinked {user} from {device}");
    } else {
        println!("{user} was not linked to {device}");
    }
    Ok(())
}

pub fn run_clean_states(
    device: &str,
    state_type: &str,
    uuid: Option<&str>,
    counter: Option<i64>,
    this_counter_only: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let service = open_service(db_path)?;
    let removed =
        service
            .device_states()
            .clean_states(device, state_type, uuid, counter, this_counter_only)?;
    println!("Removed {removed} state(s)");
    Ok(())
}

fn print_names(names: &[String], as_json: bool, empty_message: &str) -> Result<(), CliError> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(names)?);
    } else if names.is_empty() {
        println!("{empty_message}");
    } else {
        for name in names {
            println!("{name}");
        }
    }
    Ok(())
}
