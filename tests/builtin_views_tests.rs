use docindex::projection::builtin::{CHARON_DOCTYPE_FIELD, charon_views};
use docindex::{
    EngineConfig, Freshness, Grouping, IndexEngine, KeyBound, KeyRange, MemoryDocumentStore,
    RangeQuery, ReduceQuery, Value,
};
use serde_json::json;
use std::sync::Arc;

async fn charon_engine() -> (Arc<MemoryDocumentStore>, IndexEngine) {
    let store = Arc::new(MemoryDocumentStore::with_doctype_field(CHARON_DOCTYPE_FIELD));
    let docs = vec![
        json!({"_id": "u1", "charon_doctype": "user", "name": "Ada Lovelace", "email": "ada@example.org"}),
        json!({"_id": "u2", "charon_doctype": "user", "name": "Grace", "email": "grace@example.org"}),
        json!({"_id": "p1", "charon_doctype": "project", "projectid": "P1", "name": "ab.cd", "projectname": "Alpha"}),
        json!({"_id": "s1", "charon_doctype": "sample", "projectid": "P1", "sampleid": "S1",
               "status": "DONE", "analysis_status": "ANALYZED", "total_autosomal_coverage": 30.5}),
        json!({"_id": "s2", "charon_doctype": "sample", "projectid": "P1", "sampleid": "S2",
               "status": "NEW", "analysis_status": "FAILED", "total_autosomal_coverage": 10}),
        json!({"_id": "s3", "charon_doctype": "sample", "projectid": "P2", "sampleid": "S1",
               "status": "NEW", "analysis_status": "ANALYZED"}),
        json!({"_id": "r1", "charon_doctype": "seqrun", "projectid": "P1", "sampleid": "S1", "libprepid": "A", "seqrunid": "R1"}),
        json!({"_id": "r2", "charon_doctype": "seqrun", "projectid": "P1", "sampleid": "S1", "libprepid": "A", "seqrunid": "R2"}),
        json!({"_id": "r3", "charon_doctype": "seqrun", "projectid": "P1", "sampleid": "S2", "libprepid": "A", "seqrunid": "R3"}),
        json!({"_id": "r4", "charon_doctype": "seqrun", "projectid": "P2", "sampleid": "S1", "libprepid": "B", "seqrunid": "R4"}),
    ];
    for doc in docs {
        store.put_json(doc).await.unwrap();
    }

    let engine = IndexEngine::new(
        store.clone(),
        EngineConfig::new().doctype_field(CHARON_DOCTYPE_FIELD),
    );
    for definition in charon_views() {
        engine.register_view(definition).await.unwrap();
    }
    (store, engine)
}

fn bucket(name: &str) -> ReduceQuery {
    ReduceQuery::prefix(vec![Value::from(name)])
}

#[tokio::test]
async fn test_summary_count_overall_and_per_project() {
    let (_store, engine) = charon_engine().await;

    let overall = engine
        .reduce_query("sample/summary_count", &ReduceQuery::all().group_level(1))
        .await
        .unwrap();
    let figures: Vec<(Value, Value)> = overall
        .into_iter()
        .map(|row| (row.key, row.value))
        .collect();
    assert!(figures.contains(&(Value::from(vec!["TOTAL"]), Value::Integer(3))));
    assert!(figures.contains(&(Value::from(vec!["ANALYZED"]), Value::Integer(2))));
    assert!(figures.contains(&(Value::from(vec!["FAILED"]), Value::Integer(1))));
    assert!(figures.contains(&(Value::from(vec!["SEQUENCED"]), Value::Integer(4))));
    assert!(
        figures
            .iter()
            .all(|(key, _)| *key != Value::from(vec!["UNDER_ANALYSIS"]))
    );

    let per_project = engine
        .reduce_query("sample/summary_count", &bucket("TOTAL").group_level(2))
        .await
        .unwrap();
    let per_project: Vec<(Value, Value)> = per_project
        .into_iter()
        .map(|row| (row.key, row.value))
        .collect();
    assert_eq!(
        per_project,
        vec![
            (Value::from(vec!["TOTAL", "P1"]), Value::Integer(2)),
            (Value::from(vec!["TOTAL", "P2"]), Value::Integer(1)),
        ]
    );

    let coverage = engine
        .reduce_query("sample/summary_count", &bucket("TOTAL_COV"))
        .await
        .unwrap();
    assert!(matches!(coverage[0].value, Value::Float(f) if (f - 40.5).abs() < 1e-9));
}

#[tokio::test]
async fn test_sequenced_samples_are_distinct_groups() {
    let (_store, engine) = charon_engine().await;
    let sequenced = KeyRange {
        lower: KeyBound::Prefix(vec![Value::from("SEQUENCED")]),
        upper: KeyBound::Prefix(vec![Value::from("SEQUENCED")]),
    };

    let samples = engine
        .distinct_groups(
            "sample/summary_count",
            &sequenced,
            Grouping::Level(3),
            Freshness::AllowStale,
        )
        .await
        .unwrap();
    assert_eq!(samples, 3);

    let p1 = KeyRange {
        lower: KeyBound::Prefix(vec![Value::from("SEQUENCED"), Value::from("P1")]),
        upper: KeyBound::Prefix(vec![Value::from("SEQUENCED"), Value::from("P1")]),
    };
    let p1_samples = engine
        .distinct_groups(
            "sample/summary_count",
            &p1,
            Grouping::Level(3),
            Freshness::AllowStale,
        )
        .await
        .unwrap();
    assert_eq!(p1_samples, 2);
}

#[tokio::test]
async fn test_not_done_tracks_status_changes() {
    let (store, engine) = charon_engine().await;
    let page = engine
        .range_query("sample/not_done", &RangeQuery::all())
        .await
        .unwrap();
    let ids: Vec<&str> = page.rows.iter().map(|r| r.doc_id.as_str()).collect();
    assert_eq!(ids, vec!["s2", "s3"]);
    assert_eq!(page.rows[0].value.get("status"), Some(&Value::from("NEW")));

    store
        .put_json(json!({"_id": "s2", "charon_doctype": "sample", "projectid": "P1",
                         "sampleid": "S2", "status": "DONE"}))
        .await
        .unwrap();
    let page = engine
        .range_query(
            "sample/not_done",
            &RangeQuery::all().with_freshness(Freshness::require_fresh()),
        )
        .await
        .unwrap();
    let ids: Vec<&str> = page.rows.iter().map(|r| r.doc_id.as_str()).collect();
    assert_eq!(ids, vec!["s3"]);
}

#[tokio::test]
async fn test_user_and_project_name_lookups() {
    let (_store, engine) = charon_engine().await;

    let by_word = engine
        .range_query("user/name", &RangeQuery::key("Lovelace"))
        .await
        .unwrap();
    assert_eq!(by_word.rows.len(), 1);
    assert_eq!(by_word.rows[0].value, Value::from("ada@example.org"));

    let single_word = engine
        .range_query("user/name", &RangeQuery::key("Grace"))
        .await
        .unwrap();
    assert_eq!(single_word.rows.len(), 1);

    let split = engine
        .range_query("project/splitname", &RangeQuery::key("cd"))
        .await
        .unwrap();
    assert_eq!(split.rows[0].value, Value::from("P1"));
}

#[tokio::test]
async fn test_views_only_see_their_doctype() {
    let (_store, engine) = charon_engine().await;
    let samples = engine
        .reduce_query("sample/count", &ReduceQuery::all())
        .await
        .unwrap();
    assert_eq!(samples[0].value, Value::Integer(3));

    let runs = engine
        .range_query("seqrun/seqrunid", &RangeQuery::all())
        .await
        .unwrap();
    assert_eq!(runs.rows.len(), 4);

    let users = engine
        .range_query("user/email", &RangeQuery::all())
        .await
        .unwrap();
    assert_eq!(users.total_rows, 2);
}

#[tokio::test]
async fn test_log_entries_are_keyed_by_logged_document() {
    let (store, engine) = charon_engine().await;
    let entries = vec![
        json!({"_id": "l1", "charon_doctype": "log", "doc": "s1", "doctype": "sample",
               "changed": {"status": "DONE"}, "timestamp": "2024-01-02T10:00:00Z"}),
        json!({"_id": "l2", "charon_doctype": "log", "doc": "s1", "doctype": "sample",
               "changed": {"status": "NEW"}, "timestamp": "2024-01-01T09:00:00Z"}),
        json!({"_id": "l3", "charon_doctype": "log", "doc": "p1", "doctype": "project",
               "timestamp": "2024-01-01T08:00:00Z"}),
    ];
    for entry in entries {
        store.put_json(entry).await.unwrap();
    }

    let logs = engine
        .range_query(
            "log/doc",
            &RangeQuery::key("s1")
                .with_freshness(Freshness::require_fresh())
                .include_docs(),
        )
        .await
        .unwrap();
    let ids: Vec<&str> = logs.rows.iter().map(|r| r.doc_id.as_str()).collect();
    assert_eq!(ids, vec!["l1", "l2"]);
    assert_eq!(logs.rows[1].value, Value::from("2024-01-01T09:00:00Z"));
    let changed = logs.rows[0].doc.as_ref().unwrap().get("changed").unwrap();
    assert_eq!(changed.get("status"), Some(&Value::from("DONE")));

    let project_logs = engine
        .range_query("log/doc", &RangeQuery::key("p1"))
        .await
        .unwrap();
    assert_eq!(project_logs.rows.len(), 1);
    assert_eq!(project_logs.total_rows, 3);

    // Log entries are not samples, whatever their `doctype` field says.
    let samples = engine
        .reduce_query("sample/count", &ReduceQuery::all())
        .await
        .unwrap();
    assert_eq!(samples[0].value, Value::Integer(3));
}
