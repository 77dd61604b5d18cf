use odata_sync::repositories::{Loader, OutboxReader, WriteStrategy};
use odata_sync::transform::{MapOptions, map_row};
use serde_json::{Value, json};

mod test_utils;
use test_utils::{
    count, defects_mapping, defects_query, error_log_lines, execute, file_reporter,
    materials_mapping, materials_target, query_json, setup_test_db,
};

fn mapped(records: &[Value]) -> Vec<Vec<Value>> {
    let mapping = materials_mapping();
    records
        .iter()
        .map(|record| map_row(record, &mapping, MapOptions::default()))
        .collect()
}

#[tokio::test]
async fn row_wise_insert_isolates_bad_rows() {
    let db = setup_test_db().await.unwrap();
    let logs = tempfile::tempdir().unwrap();
    let loader = Loader::new(db.clone(), 100, file_reporter(logs.path()).unwrap());

    // Row 2 violates NOT NULL on description.
    let rows = mapped(&[
        json!({"Material": "M-1", "MaterialName": "Bolt", "Plant": "1000"}),
        json!({"Material": "M-2", "MaterialName": "", "Plant": "1000"}),
        json!({"Material": "M-3", "MaterialName": "Nut", "Plant": "2000"}),
    ]);

    let report = loader
        .load(
            "materials",
            &materials_target(WriteStrategy::Insert),
            &materials_mapping(),
            &rows,
        )
        .await
        .unwrap();

    assert_eq!(report.attempted, 3);
    assert_eq!(report.written, 2);
    assert_eq!(report.failed, 1);

    let ids = query_json(&db, "SELECT json_object('id', id) AS j FROM materials ORDER BY id")
        .await
        .unwrap();
    assert_eq!(ids, vec![json!({"id": "M-1"}), json!({"id": "M-3"})]);

    let errors = error_log_lines(logs.path());
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["job_id"], "materials");
    assert_eq!(errors[0]["table"], "materials");
    assert_eq!(errors[0]["row"]["id"], "M-2");
    assert!(errors[0]["sql"].as_str().unwrap().starts_with("INSERT INTO"));
}

#[tokio::test]
async fn upsert_updates_existing_rows() {
    let db = setup_test_db().await.unwrap();
    let logs = tempfile::tempdir().unwrap();
    let loader = Loader::new(db.clone(), 100, file_reporter(logs.path()).unwrap());
    let target = materials_target(WriteStrategy::Upsert {
        key: vec!["id".into()],
    });

    let first = mapped(&[json!({"Material": "M-1", "MaterialName": "Bolt"})]);
    loader
        .load("materials", &target, &materials_mapping(), &first)
        .await
        .unwrap();

    let second = mapped(&[
        json!({"Material": "M-1", "MaterialName": "Bolt M8", "Plant": "1000"}),
        json!({"Material": "M-2", "MaterialName": "Washer"}),
    ]);
    let report = loader
        .load("materials", &target, &materials_mapping(), &second)
        .await
        .unwrap();
    assert_eq!(report.written, 2);

    let rows = query_json(
        &db,
        "SELECT json_object('id', id, 'description', description, 'plant', plant) AS j \
         FROM materials ORDER BY id",
    )
    .await
    .unwrap();
    assert_eq!(
        rows,
        vec![
            json!({"id": "M-1", "description": "Bolt M8", "plant": "1000"}),
            json!({"id": "M-2", "description": "Washer", "plant": null}),
        ]
    );
}

#[tokio::test]
async fn replace_swaps_table_contents() {
    let db = setup_test_db().await.unwrap();
    let logs = tempfile::tempdir().unwrap();
    // Batch size 2 forces several INSERT statements inside the transaction.
    let loader = Loader::new(db.clone(), 2, file_reporter(logs.path()).unwrap());
    execute(
        &db,
        "INSERT INTO materials (id, description) VALUES ('OLD-1', 'stale'), ('OLD-2', 'stale')",
    )
    .await
    .unwrap();

    let rows = mapped(&[
        json!({"Material": "N-1", "MaterialName": "a"}),
        json!({"Material": "N-2", "MaterialName": "b"}),
        json!({"Material": "N-3", "MaterialName": "c"}),
    ]);
    let report = loader
        .load(
            "materials",
            &materials_target(WriteStrategy::Replace),
            &materials_mapping(),
            &rows,
        )
        .await
        .unwrap();

    assert_eq!(report.written, 3);
    assert_eq!(count(&db, "materials").await.unwrap(), 3);
}

#[tokio::test]
async fn failed_replace_rolls_back() {
    let db = setup_test_db().await.unwrap();
    let logs = tempfile::tempdir().unwrap();
    let loader = Loader::new(db.clone(), 10, file_reporter(logs.path()).unwrap());
    execute(
        &db,
        "INSERT INTO materials (id, description) VALUES ('KEEP', 'existing')",
    )
    .await
    .unwrap();

    // Duplicate primary key inside the batch.
    let rows = mapped(&[
        json!({"Material": "D-1", "MaterialName": "a"}),
        json!({"Material": "D-1", "MaterialName": "b"}),
    ]);
    let result = loader
        .load(
            "materials",
            &materials_target(WriteStrategy::Replace),
            &materials_mapping(),
            &rows,
        )
        .await;

    assert!(result.is_err());
    let ids = query_json(&db, "SELECT json_object('id', id) AS j FROM materials")
        .await
        .unwrap();
    assert_eq!(ids, vec![json!({"id": "KEEP"})]);
}

#[tokio::test]
async fn outbox_reads_pending_and_marks_once() {
    let db = setup_test_db().await.unwrap();
    execute(
        &db,
        "INSERT INTO defects_outbox (id, material, quantity, sync_status) VALUES \
         (3, 'M-3', 30, 'pending'), (1, 'M-1', 10, 'pending'), \
         (2, 'M-2', 20, 'sent'), (4, 'M-4', 40, 'error')",
    )
    .await
    .unwrap();

    let reader = OutboxReader::new(db.clone());
    let query = defects_query();
    let fields = defects_mapping().source_fields();

    let pending = reader.read_pending(&query, &fields, 100).await.unwrap();
    let keys: Vec<&Value> = pending.iter().map(|row| &row.key).collect();
    assert_eq!(keys, vec![&json!(1), &json!(3)]);
    assert_eq!(pending[0].record["material"], "M-1");
    assert_eq!(pending[0].record["quantity"], 10);

    assert!(
        reader
            .mark_sent(&query, &json!(1), &json!({"DefectId": "D-1"}))
            .await
            .unwrap()
    );
    assert!(reader.mark_error(&query, &json!(3), "HTTP 400").await.unwrap());

    // Already transitioned: no second move.
    assert!(!reader.mark_error(&query, &json!(1), "late").await.unwrap());

    let rows = query_json(
        &db,
        "SELECT json_object('id', id, 'status', sync_status, 'error', sync_error, \
         'response', response, 'sent', sent_at IS NOT NULL) AS j FROM defects_outbox \
         WHERE id IN (1, 3) ORDER BY id",
    )
    .await
    .unwrap();
    assert_eq!(rows[0]["status"], "sent");
    assert_eq!(rows[0]["error"], Value::Null);
    assert_eq!(rows[0]["response"], "{\"DefectId\":\"D-1\"}");
    assert_eq!(rows[0]["sent"], 1);
    assert_eq!(rows[1]["status"], "error");
    assert_eq!(rows[1]["error"], "HTTP 400");

    assert!(reader.read_pending(&query, &fields, 100).await.unwrap().is_empty());
}

#[tokio::test]
async fn outbox_honours_filter_and_limit() {
    let db = setup_test_db().await.unwrap();
    execute(
        &db,
        "INSERT INTO defects_outbox (id, material, quantity) VALUES \
         (1, 'M-1', 1), (2, 'M-2', 2), (3, 'M-3', 3), (4, 'X-4', 4)",
    )
    .await
    .unwrap();

    let reader = OutboxReader::new(db.clone());
    let mut query = defects_query();
    query.filter = Some("material LIKE 'M-%'".to_string());
    query.order_by = Some("id DESC".to_string());
    query.limit = Some(2);

    let pending = reader
        .read_pending(&query, &defects_mapping().source_fields(), 100)
        .await
        .unwrap();
    let keys: Vec<Value> = pending.into_iter().map(|row| row.key).collect();
    assert_eq!(keys, vec![json!(3), json!(2)]);
}
