use std::env;
use std::path::{Path, PathBuf};

use objsync_core::models::{CollectionRecord, ExportStat, Partner};
use objsync_core::services::SyncService;
use objsync_core::{StreamKey, SyncConfig};
use serde::Serialize;
use serde_json::Value;

use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct HeadItem {
    pub stream: String,
    pub head: i64,
}

#[derive(Debug, Serialize)]
pub struct PartnerListItem {
    pub id: i64,
    pub pid: String,
    pub owner_id: String,
    pub last_sync: Option<i64>,
    pub last_sync_iso: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CollectionListItem {
    pub id: i64,
    pub stream: String,
    pub conditions: usize,
    pub last_commit_id: i64,
    pub stale_checked_commit_id: i64,
    pub revision: i64,
    pub state: String,
}

#[derive(Debug, Serialize)]
pub struct ChangeItem {
    pub entity_id: String,
    pub action: String,
    pub commit_id: i64,
    pub stale: bool,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("OBJSYNC_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("objsync")
        .join("objsync.db")
}

/// Open the service at `path`, taking every other setting from the environment
pub fn open_service(path: &Path) -> Result<SyncService, CliError> {
    let config = SyncConfig::from_env()?.with_database_path(path);
    Ok(SyncService::open(config)?)
}

/// Parse `type` or `type/field` into a stream key
pub fn parse_stream_key(raw: &str) -> Result<StreamKey, CliError> {
    let raw = raw.trim();
    let (object_type, field) = match raw.split_once('/') {
        Some((object_type, field)) => (object_type.trim(), Some(field.trim())),
        None => (raw, None),
    };
    if object_type.is_empty() || field.is_some_and(str::is_empty) {
        return Err(CliError::InvalidArgument(format!(
            "stream must be `type` or `type/field`, got '{raw}'"
        )));
    }
    Ok(field.map_or_else(
        || StreamKey::entity(object_type),
        |field| StreamKey::grouping(object_type, field),
    ))
}

/// Parse a JSON object of object fields
pub fn parse_fields(raw: &str) -> Result<Value, CliError> {
    let value: Value = serde_json::from_str(raw)?;
    if !value.is_object() {
        return Err(CliError::InvalidArgument(
            "fields must be a JSON object".to_string(),
        ));
    }
    Ok(value)
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

pub fn partner_to_list_item(partner: &Partner) -> PartnerListItem {
    PartnerListItem {
        id: partner.id,
        pid: partner.pid.clone(),
        owner_id: partner.owner_id.clone(),
        last_sync: partner.last_sync,
        last_sync_iso: partner.last_sync.map(format_sync_timestamp),
    }
}

pub fn format_partner_lines(partners: &[Partner], now_ms: i64) -> Vec<String> {
    partners
        .iter()
        .map(|partner| {
            let last_sync = partner
                .last_sync
                .map_or_else(|| "never".to_string(), |ms| format_relative_time(ms, now_ms));
            format!(
                "{:<6}  {:<32}  {:<16}  {last_sync}",
                partner.id, partner.pid, partner.owner_id
            )
        })
        .collect()
}

pub fn collection_to_list_item(record: &CollectionRecord) -> CollectionListItem {
    CollectionListItem {
        id: record.id,
        stream: record.spec.stream_key().watermark_key(),
        conditions: record.spec.conditions.len(),
        last_commit_id: record.last_commit_id.value(),
        stale_checked_commit_id: record.stale_checked_commit_id.value(),
        revision: record.revision,
        state: format!("{:?}", record.init_state()).to_lowercase(),
    }
}

pub fn format_collection_lines(records: &[CollectionRecord]) -> Vec<String> {
    records
        .iter()
        .map(collection_to_list_item)
        .map(|item| {
            format!(
                "{:<6}  {:<40}  @{:<8}  rev {:<6}  {}",
                item.id, item.stream, item.last_commit_id, item.revision, item.state
            )
        })
        .collect()
}

pub fn change_to_item(stat: &ExportStat) -> ChangeItem {
    ChangeItem {
        entity_id: stat.entity_id.clone(),
        action: stat.action.to_string(),
        commit_id: stat.commit_id.value(),
        stale: !stat.advances_watermark(),
    }
}

pub fn format_change_line(stat: &ExportStat) -> String {
    let marker = if stat.advances_watermark() { "" } else { "  (stale)" };
    format!(
        "{:<8}  {:<6}  {}{marker}",
        stat.commit_id, stat.action, stat.entity_id
    )
}
