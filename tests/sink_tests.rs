//! End-to-end tests driving the sink with protocol lines

mod common;

use common::*;
use data_modelling_sink::cli::CliError;
use data_modelling_sink::config::IngestConfig;
use data_modelling_sink::orchestrator::SinkError;
use data_modelling_sink::store::MemoryStore;
use serde_json::json;
use std::sync::Arc;

fn users_run() -> Vec<String> {
    vec![
        schema_line("users", &users_schema(), &["id"]),
        record_line(
            "users",
            json!({"id": 1, "name": "a", "tags": [{"name": "t1"}, {"name": "t2"}]}),
        ),
        state_line(json!({"bookmark": 1})),
    ]
}

#[tokio::test]
async fn test_nested_record_end_to_end() {
    let store = Arc::new(MemoryStore::new());
    let (result, output) = run_lines(&store, IngestConfig::default(), &users_run()).await;

    let report = result.unwrap();
    assert_eq!(output, "{\"bookmark\":1}\n");
    assert_eq!(report.streams[0].records, 1);
    assert_eq!(report.streams[0].rows["users__tags"], 2);

    assert_eq!(
        store.row_values("users", &["id", "name", "_ver"]),
        vec![vec![json!(1), json!("a"), json!(1)]]
    );
    assert_eq!(
        store.row_values("users__tags", &["_root_id", "_level_1", "name", "_root_ver"]),
        vec![
            vec![json!(1), json!(0), json!("t1"), json!(1)],
            vec![json!(1), json!(1), json!("t2"), json!(1)],
        ]
    );
}

#[tokio::test]
async fn test_rerun_replaces_previous_version() {
    let store = Arc::new(MemoryStore::new());
    run_lines(&store, IngestConfig::default(), &users_run())
        .await
        .0
        .unwrap();
    let (result, _) = run_lines(&store, IngestConfig::default(), &users_run()).await;
    assert_eq!(result.unwrap().streams[0].version, 2);

    assert_eq!(
        store.row_values("users", &["id", "_ver"]),
        vec![vec![json!(1), json!(2)]]
    );
    assert_eq!(
        store.row_values("users__tags", &["_level_1", "_root_ver"]),
        vec![vec![json!(0), json!(2)], vec![json!(1), json!(2)]]
    );
}

#[tokio::test]
async fn test_delete_removes_record_and_children() {
    let store = Arc::new(MemoryStore::new());
    let lines = vec![
        schema_line("users", &users_schema(), &["id"]),
        record_line("users", json!({"id": 1, "tags": [{"name": "t1"}]})),
        record_line("users", json!({"id": 2, "tags": [{"name": "t2"}]})),
        delete_line("users", json!({"id": 1})),
    ];
    let (result, _) = run_lines(&store, IngestConfig::default(), &lines).await;

    assert_eq!(result.unwrap().streams[0].deletes, 1);
    assert_eq!(store.row_values("users", &["id"]), vec![vec![json!(2)]]);
    assert_eq!(store.row_values("users__tags", &["name"]), vec![vec![json!("t2")]]);
}

#[tokio::test]
async fn test_record_before_schema_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let lines = vec![record_line("users", json!({"id": 1}))];
    let (result, output) = run_lines(&store, IngestConfig::default(), &lines).await;

    assert!(matches!(
        result.unwrap_err(),
        CliError::Sink(SinkError::UnknownStream(ref s)) if s == "users"
    ));
    assert!(output.is_empty());
    assert!(store.table_names().is_empty());
}

#[tokio::test]
async fn test_malformed_line_reports_line_number() {
    let store = Arc::new(MemoryStore::new());
    let mut lines = users_run();
    lines.push("{\"type\": ".to_string());
    let (result, output) = run_lines(&store, IngestConfig::default(), &lines).await;

    let err = result.unwrap_err();
    assert!(err.to_string().contains("line 4"), "{err}");
    assert_eq!(output, "{\"bookmark\":1}\n");
    assert_eq!(store.rows("users").len(), 1);
}

#[tokio::test]
async fn test_added_property_extends_table() {
    let store = Arc::new(MemoryStore::new());
    run_lines(&store, IngestConfig::default(), &users_run())
        .await
        .0
        .unwrap();

    let mut schema = users_schema();
    schema["properties"]["email"] = json!({"type": "string"});
    let lines = vec![
        schema_line("users", &schema, &["id"]),
        record_line("users", json!({"id": 2, "email": "b@example.com"})),
    ];
    run_lines(&store, IngestConfig::default(), &lines)
        .await
        .0
        .unwrap();

    assert!(
        store
            .statements()
            .iter()
            .any(|s| s.starts_with("ALTER TABLE `users` ADD COLUMN IF NOT EXISTS `email`"))
    );
    assert_eq!(
        store.row_values("users", &["id", "email"]),
        vec![
            vec![json!(1), json!(null)],
            vec![json!(2), json!("b@example.com")]
        ]
    );
}

#[tokio::test]
async fn test_refused_type_change_fails_stream() {
    let store = Arc::new(MemoryStore::new().with_refused_type_changes());
    let mut schema = users_schema();
    schema["properties"]["name"] = json!({"type": "integer"});
    run_lines(
        &store,
        IngestConfig::default(),
        &[
            schema_line("users", &schema, &["id"]),
            record_line("users", json!({"id": 1, "name": 5})),
        ],
    )
    .await
    .0
    .unwrap();

    let (result, output) = run_lines(&store, IngestConfig::default(), &users_run()).await;
    match result.unwrap_err() {
        CliError::StreamsFailed(streams) => assert_eq!(streams, vec!["users"]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(output.is_empty());
    assert_eq!(store.rows("users").len(), 1);
}

#[tokio::test]
async fn test_failed_stream_does_not_stop_others() {
    let store = Arc::new(MemoryStore::new());
    let lines = vec![
        schema_line("users", &users_schema(), &["id"]),
        schema_line("orders", &json!({"type": "object", "properties": {"order_id": {"type": "integer"}}}), &["order_id"]),
        record_line("orders", json!({"total": 3})),
        record_line("users", json!({"id": 1})),
        state_line(json!(1)),
    ];
    let (result, output) = run_lines(&store, IngestConfig::default(), &lines).await;

    assert!(matches!(result.unwrap_err(), CliError::StreamsFailed(_)));
    assert!(output.is_empty());
    assert_eq!(store.row_values("users", &["id"]), vec![vec![json!(1)]]);
    assert!(store.rows("orders").is_empty());
}

#[tokio::test]
async fn test_keyless_stream_indexes_array_items() {
    let store = Arc::new(MemoryStore::new());
    let schema = json!({"type": "object", "properties": {
        "events": {"type": "array", "items": {"type": "string"}}
    }});
    let lines = vec![
        schema_line("log", &schema, &[]),
        record_line("log", json!({"events": ["x", "y"]})),
    ];
    run_lines(&store, IngestConfig::default(), &lines)
        .await
        .0
        .unwrap();

    assert_eq!(
        store.row_values("log__events", &["_level_1", "value"]),
        vec![vec![json!(0), json!("x")], vec![json!(1), json!("y")]]
    );
}

#[tokio::test]
async fn test_clean_first_replaces_previous_load() {
    let store = Arc::new(MemoryStore::new());
    run_lines(&store, IngestConfig::default(), &users_run())
        .await
        .0
        .unwrap();

    let lines = vec![
        schema_line_with("users", &users_schema(), &["id"], None, true),
        record_line("users", json!({"id": 7, "tags": [{"name": "fresh"}]})),
        state_line(json!("done")),
    ];
    let (result, output) = run_lines(&store, IngestConfig::default(), &lines).await;

    result.unwrap();
    assert_eq!(output, "\"done\"\n");
    assert_eq!(store.row_values("users", &["id", "_ver"]), vec![vec![json!(7), json!(1)]]);
    assert_eq!(store.row_values("users__tags", &["name"]), vec![vec![json!("fresh")]]);
    assert!(store.statements().iter().any(|s| s.starts_with("EXCHANGE TABLES")));
}

#[tokio::test]
async fn test_duplicate_keys_fail_integrity_check() {
    let store = Arc::new(MemoryStore::new().without_optimize());
    let lines = vec![
        schema_line("users", &users_schema(), &["id"]),
        record_line("users", json!({"id": 1})),
        record_line("users", json!({"id": 1})),
    ];
    let (result, _) = run_lines(&store, IngestConfig::default(), &lines).await;
    assert!(matches!(result.unwrap_err(), CliError::StreamsFailed(ref s) if s == &["users"]));
}

#[tokio::test]
async fn test_small_batches_write_every_row() {
    let store = Arc::new(MemoryStore::new());
    let config = IngestConfig {
        batch_size: 2,
        ..IngestConfig::default()
    };
    let mut lines = vec![schema_line("users", &users_schema(), &["id"])];
    for id in 1..=5 {
        lines.push(record_line("users", json!({"id": id})));
    }
    let (result, _) = run_lines(&store, config, &lines).await;

    assert_eq!(result.unwrap().streams[0].rows["users"], 5);
    assert_eq!(store.rows("users").len(), 5);
}

#[tokio::test]
async fn test_reinsert_after_delete_keeps_latest_record() {
    let store = Arc::new(MemoryStore::new());
    let lines = vec![
        schema_line("users", &users_schema(), &["id"]),
        record_line("users", json!({"id": 1, "name": "old", "tags": [{"name": "t1"}]})),
        delete_line("users", json!({"id": 1})),
        record_line("users", json!({"id": 1, "name": "new", "tags": [{"name": "t2"}]})),
    ];
    let (result, _) = run_lines(&store, IngestConfig::default(), &lines).await;

    result.unwrap();
    assert_eq!(
        store.row_values("users", &["id", "name"]),
        vec![vec![json!(1), json!("new")]]
    );
    assert_eq!(store.row_values("users__tags", &["name"]), vec![vec![json!("t2")]]);
}

fn events_schema() -> serde_json::Value {
    json!({"type": "object", "properties": {
        "day": {"type": "string"},
        "tags": {"type": "array", "items": {"type": "string"}}
    }})
}

async fn load_events(store: &Arc<MemoryStore>, records: &[serde_json::Value]) {
    let mut lines = vec![schema_line_with("ev", &events_schema(), &[], Some("day"), false)];
    lines.extend(records.iter().map(|r| record_line("ev", r.clone())));
    run_lines(store, IngestConfig::default(), &lines)
        .await
        .0
        .unwrap();
}

#[tokio::test]
async fn test_cleaning_reload_replaces_child_rows() {
    let store = Arc::new(MemoryStore::new());
    let record = json!({"day": "mon", "tags": ["x", "y"]});
    load_events(&store, &[record.clone()]).await;
    load_events(&store, &[record]).await;

    assert_eq!(store.rows("ev").len(), 1);
    assert_eq!(
        store.row_values("ev__tags", &["_level_1", "value"]),
        vec![vec![json!(0), json!("x")], vec![json!(1), json!("y")]]
    );
}

#[tokio::test]
async fn test_cleaning_reload_leaves_other_partitions() {
    let store = Arc::new(MemoryStore::new());
    load_events(&store, &[json!({"day": "mon", "tags": ["x"]})]).await;
    load_events(&store, &[json!({"day": "tue", "tags": ["y"]})]).await;
    load_events(&store, &[json!({"day": "mon", "tags": ["z"]})]).await;

    assert_eq!(
        store.row_values("ev", &["day", "_root_ver"]),
        vec![vec![json!("tue"), json!(2)], vec![json!("mon"), json!(3)]]
    );
    assert_eq!(
        store.row_values("ev__tags", &["value", "_root_ver"]),
        vec![vec![json!("y"), json!(2)], vec![json!("z"), json!(3)]]
    );
}
