use std::path::PathBuf;

use objsync_core::models::{ChangeAction, CollectionKind, CommitId, ExportOrigin, ExportStat};
use objsync_core::sync::PartnerRegistry;
use objsync_core::StreamKey;
use pretty_assertions::assert_eq;
use tempfile::{tempdir, TempDir};

use crate::cli::CompletionShell;
use crate::commands::collections::{
    build_spec, run_add_collection, run_export_collection, run_fast_forward,
    run_remove_collection,
};
use crate::commands::common::{
    change_to_item, format_change_line, format_relative_time, format_sync_timestamp,
    open_service, parse_fields, parse_stream_key, resolve_db_path,
};
use crate::commands::completions::run_completions;
use crate::commands::devices::{run_link, run_unlink};
use crate::commands::objects::{run_delete_object, run_put_object};
use crate::commands::partners::{run_add_partner, run_delete_partner};
use crate::error::CliError;

fn test_db() -> (TempDir, PathBuf) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("objsync.db");
    (dir, path)
}

#[test]
fn parse_stream_key_accepts_entity_and_grouping() {
    assert_eq!(parse_stream_key("task").unwrap(), StreamKey::entity("task"));
    assert_eq!(
        parse_stream_key(" email_message/mailbox_id ").unwrap(),
        StreamKey::grouping("email_message", "mailbox_id")
    );
}

#[test]
fn parse_stream_key_rejects_empty_parts() {
    for raw in ["", "/field", "task/", "  "] {
        assert!(matches!(
            parse_stream_key(raw),
            Err(CliError::InvalidArgument(_))
        ));
    }
}

#[test]
fn parse_fields_requires_object() {
    assert!(parse_fields(r#"{"title":"a"}"#).is_ok());
    assert!(matches!(parse_fields("[1]"), Err(CliError::InvalidArgument(_))));
    assert!(matches!(parse_fields("{"), Err(CliError::Serialization(_))));
}

#[test]
fn resolve_db_path_prefers_cli_value() {
    let path = PathBuf::from("/tmp/explicit.db");
    assert_eq!(resolve_db_path(Some(path.clone())), path);
}

#[test]
fn format_relative_time_buckets() {
    let now = 10 * 24 * 60 * 60 * 1000;
    assert_eq!(format_relative_time(now - 1_000, now), "just now");
    assert_eq!(format_relative_time(now - 5 * 60_000, now), "5m ago");
    assert_eq!(format_relative_time(now - 3 * 60 * 60_000, now), "3h ago");
    assert_eq!(format_relative_time(0, now), "10d ago");
}

#[test]
fn format_sync_timestamp_renders_utc() {
    assert_eq!(format_sync_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn stale_changes_are_marked() {
    let stat = ExportStat {
        entity_id: "C".to_string(),
        action: ChangeAction::Delete,
        commit_id: CommitId::new(10),
        origin: ExportOrigin::Stale,
    };
    assert!(change_to_item(&stat).stale);
    assert!(format_change_line(&stat).ends_with("(stale)"));
}

#[test]
fn build_spec_parses_grouping_and_conditions() {
    let spec = build_spec(
        "email_message",
        Some("mailbox_id"),
        Some(r#"[{"field":"subject","operator":"begins_with","value":"Re:"}]"#),
    )
    .unwrap();
    assert_eq!(
        spec.kind,
        CollectionKind::Grouping {
            field_name: "mailbox_id".to_string()
        }
    );
    assert_eq!(spec.conditions.len(), 1);

    assert!(matches!(
        build_spec("task", None, Some("not json")),
        Err(CliError::Core(objsync_core::Error::InvalidFilter(_)))
    ));
    assert!(matches!(
        build_spec(" ", None, None),
        Err(CliError::InvalidArgument(_))
    ));
}

#[test]
fn export_collection_moves_watermark() {
    let (_dir, path) = test_db();
    run_put_object("task", "A", r#"{"title":"first"}"#, None, &path).unwrap();
    run_put_object("task", "B", "{}", None, &path).unwrap();
    run_add_partner("Devices/dev1", "u1", &path).unwrap();
    run_add_collection("Devices/dev1", "task", None, None, &path).unwrap();

    let collection_id = {
        let service = open_service(&path).unwrap();
        let partner = service.partners().get("Devices/dev1").unwrap().unwrap();
        service.partners().list_collections(partner.id).unwrap()[0].id
    };

    run_export_collection(collection_id, true, &path).unwrap();

    let service = open_service(&path).unwrap();
    let record = service
        .partners()
        .get_collection(collection_id)
        .unwrap()
        .unwrap();
    assert_eq!(record.last_commit_id, CommitId::new(2));
    assert!(service.pending_changes(collection_id).unwrap().is_empty());
}

#[test]
fn delete_object_reports_missing_object() {
    let (_dir, path) = test_db();
    run_put_object("task", "A", "{}", None, &path).unwrap();
    run_delete_object("task", "A", &path).unwrap();
    assert!(matches!(
        run_delete_object("task", "A", &path),
        Err(CliError::InvalidArgument(_))
    ));
}

#[test]
fn collection_commands_report_unknown_ids() {
    let (_dir, path) = test_db();
    assert!(matches!(
        run_add_collection("Devices/none", "task", None, None, &path),
        Err(CliError::PartnerNotFound(_))
    ));
    assert!(matches!(
        run_export_collection(42, false, &path),
        Err(CliError::CollectionNotFound(42))
    ));
    assert!(matches!(
        run_remove_collection(42, &path),
        Err(CliError::CollectionNotFound(42))
    ));
    assert!(matches!(
        run_delete_partner("Devices/none", &path),
        Err(CliError::PartnerNotFound(_))
    ));
}

#[test]
fn fast_forward_rejects_entity_collections() {
    let (_dir, path) = test_db();
    run_add_partner("Devices/dev1", "u1", &path).unwrap();
    run_add_collection("Devices/dev1", "task", None, None, &path).unwrap();
    let service = open_service(&path).unwrap();
    let partner = service.partners().get("Devices/dev1").unwrap().unwrap();
    let collection_id = service.partners().list_collections(partner.id).unwrap()[0].id;
    drop(service);

    assert!(matches!(
        run_fast_forward(collection_id, &path),
        Err(CliError::Core(objsync_core::Error::Unsupported(_)))
    ));
}

#[test]
fn link_and_unlink_devices() {
    let (_dir, path) = test_db();
    run_link("alice", "dev1", &path).unwrap();
    run_link("alice", "dev1", &path).unwrap();

    let service = open_service(&path).unwrap();
    assert_eq!(
        service.device_states().get_device_users("dev1").unwrap(),
        vec!["alice".to_string()]
    );
    drop(service);

    run_unlink("alice", "dev1", &path).unwrap();
    let service = open_service(&path).unwrap();
    assert!(service.device_states().get_device_users("dev1").unwrap().is_empty());
}

#[test]
fn run_completions_writes_bash_script_file() {
    let dir = tempdir().unwrap();
    let output_path = dir.path().join("objsync.bash");

    run_completions(CompletionShell::Bash, Some(&output_path)).unwrap();

    let script = std::fs::read_to_string(&output_path).unwrap();
    assert!(script.contains("_objsync()"));
    assert!(script.contains("complete -F _objsync"));
}

#[test]
fn zsh_completions_list_subcommands() {
    let script =
        String::from_utf8(crate::commands::completions::render_completions(CompletionShell::Zsh))
            .unwrap();
    assert!(script.contains("#compdef objsync"));
    assert!(script.contains("collections"));
}
