//! Store-level tests: ingest, read-back, scan, persistence across reopen

mod common;

use agentdb::{CancellationToken, DbError, DbOptions, MetadataFilter, VectorRecord};
use common::{seeded_embedding, seeded_record, TestDb};
use serde_json::json;

#[test]
fn test_open_creates_schema() {
    let db = TestDb::new(8);
    let stats = db.stats().unwrap();
    assert_eq!(stats.records, 0);
    assert_eq!(stats.dimension, 8);
    assert!(stats.size_bytes > 0);
}

#[test]
fn test_norm_precomputed_on_insert() {
    let db = TestDb::new(4);
    let id = db
        .insert(VectorRecord::new(vec![3.0, 4.0, 0.0, 0.0]))
        .unwrap();
    let record = db.get(&id).unwrap().unwrap();
    assert!((record.norm - 5.0).abs() <= 1e-6);
}

#[test]
fn test_norm_matches_embedding_within_tolerance() {
    let db = TestDb::new(64);
    for seed in 0..20 {
        let v = seeded_embedding(64, seed);
        let id = db.insert(VectorRecord::new(v.clone())).unwrap();
        let record = db.get(&id).unwrap().unwrap();
        let expected: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!(
            (record.norm - expected).abs() <= 1e-6,
            "norm drift for seed {seed}: {} vs {expected}",
            record.norm
        );
    }
}

#[test]
fn test_round_trip_exact_embedding() {
    let db = TestDb::new(6);
    let v = vec![0.1f32, -0.2, 0.3, f32::MIN_POSITIVE, 1e30, -1e-30];
    let id = db.insert(VectorRecord::new(v.clone())).unwrap();
    let record = db.get(&id).unwrap().unwrap();
    assert_eq!(record.embedding, v, "read-back must be bit-exact");
}

#[test]
fn test_metadata_round_trip() {
    let db = TestDb::new(4);
    let metadata = json!({"kind": "note", "weight": 0.5, "tags": ["a", "b"]});
    let id = db
        .insert(VectorRecord::new(vec![1.0; 4]).with_metadata(metadata.clone()))
        .unwrap();
    let record = db.get(&id).unwrap().unwrap();
    assert_eq!(record.metadata, Some(metadata));
}

#[test]
fn test_insert_batch_returns_ordered_ids() {
    let db = TestDb::new(8);
    let records: Vec<VectorRecord> = (0..50).map(|i| seeded_record(8, i)).collect();
    let ids = db.insert_batch(records).unwrap();
    assert_eq!(ids.len(), 50);
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(id, &format!("rec{i:05}"));
    }
    assert_eq!(db.stats().unwrap().records, 50);
}

#[test]
fn test_generated_ids_are_sortable_by_insertion() {
    let db = TestDb::new(4);
    let a = db.insert(VectorRecord::new(vec![1.0; 4])).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(2));
    let b = db.insert(VectorRecord::new(vec![1.0; 4])).unwrap();
    assert!(a < b, "ids must sort by creation time");
}

#[test]
fn test_id_conflict() {
    let db = TestDb::new(4);
    db.insert(VectorRecord::new(vec![1.0; 4]).with_id("dup"))
        .unwrap();
    let err = db
        .insert(VectorRecord::new(vec![2.0; 4]).with_id("dup"))
        .unwrap_err();
    assert!(matches!(err, DbError::Conflict(_)), "got {err:?}");
}

#[test]
fn test_dimension_mismatch_has_no_side_effects() {
    let db = TestDb::new(4);
    let records = vec![
        VectorRecord::new(vec![1.0; 4]),
        VectorRecord::new(vec![1.0; 3]), // wrong
    ];
    let err = db.insert_batch(records).unwrap_err();
    assert!(matches!(
        err,
        DbError::DimensionMismatch {
            expected: 4,
            actual: 3
        }
    ));
    // Validation happens before any write
    assert_eq!(db.stats().unwrap().records, 0);
}

#[test]
fn test_delete_and_get_none() {
    let db = TestDb::new(4);
    let id = db.insert(VectorRecord::new(vec![1.0; 4])).unwrap();
    assert!(db.delete(&id).unwrap());
    assert!(db.get(&id).unwrap().is_none());
    assert!(!db.delete(&id).unwrap(), "second delete reports false");
}

#[test]
fn test_update_replaces_embedding_and_metadata() {
    let db = TestDb::new(4);
    let id = db
        .insert(VectorRecord::new(vec![1.0, 0.0, 0.0, 0.0]).with_metadata(json!({"v": 1})))
        .unwrap();
    db.update(
        &id,
        VectorRecord::new(vec![0.0, 1.0, 0.0, 0.0]).with_metadata(json!({"v": 2})),
    )
    .unwrap();

    let record = db.get(&id).unwrap().unwrap();
    assert_eq!(record.embedding, vec![0.0, 1.0, 0.0, 0.0]);
    assert_eq!(record.metadata, Some(json!({"v": 2})));
    assert!((record.norm - 1.0).abs() <= 1e-6);
}

#[test]
fn test_update_missing_is_not_found() {
    let db = TestDb::new(4);
    assert!(matches!(
        db.update("missing", VectorRecord::new(vec![1.0; 4])),
        Err(DbError::NotFound(_))
    ));
}

#[test]
fn test_scan_with_filter_and_limit() {
    let db = TestDb::new(4);
    for i in 0..20 {
        let kind = if i % 2 == 0 { "even" } else { "odd" };
        db.insert(
            VectorRecord::new(seeded_embedding(4, i)).with_metadata(json!({"parity": kind})),
        )
        .unwrap();
    }

    let evens = db
        .scan(
            &MetadataFilter::new().with_eq("parity", json!("even")),
            100,
        )
        .unwrap();
    assert_eq!(evens.len(), 10);

    let limited = db.scan(&MetadataFilter::new(), 7).unwrap();
    assert_eq!(limited.len(), 7);
}

#[test]
fn test_cancelled_batch_insert() {
    let db = TestDb::new(4);
    let token = CancellationToken::new();
    token.cancel();
    let records: Vec<VectorRecord> = (0..10).map(|i| seeded_record(4, i)).collect();
    let err = db
        .insert_batch_with(records, Some(&token), None)
        .unwrap_err();
    assert!(matches!(err, DbError::Cancelled));
    assert_eq!(db.stats().unwrap().records, 0);
}

#[test]
fn test_reopen_preserves_data() {
    let db = TestDb::new(8);
    let records: Vec<VectorRecord> = (0..25).map(|i| seeded_record(8, i)).collect();
    db.insert_batch(records).unwrap();

    let db = db.reopen(DbOptions::new(8));
    assert_eq!(db.stats().unwrap().records, 25);
    let record = db.get("rec00003").unwrap().unwrap();
    assert_eq!(record.embedding, seeded_embedding(8, 3));
}

#[test]
fn test_reopen_with_wrong_dimension_fails() {
    let db = TestDb::new(8);
    db.insert(VectorRecord::new(seeded_embedding(8, 1))).unwrap();
    let path = db.path();
    drop(db);

    let err = agentdb::Db::open(DbOptions::new(16).with_path(path)).unwrap_err();
    assert!(matches!(err, DbError::DimensionMismatch { .. }));
}

#[test]
fn test_read_your_writes() {
    let db = TestDb::new(4);
    let id = db
        .insert(VectorRecord::new(vec![1.0, 0.0, 0.0, 0.0]))
        .unwrap();
    // Immediately visible to search from the same handle
    let results = db.search(&[1.0, 0.0, 0.0, 0.0], 1).unwrap();
    assert_eq!(results[0].id, id);
}

#[test]
fn test_large_batch_chunks() {
    // Crosses the 5,000-row chunk boundary
    let db = TestDb::new(4);
    let records: Vec<VectorRecord> = (0..6_000)
        .map(|i| VectorRecord::new(seeded_embedding(4, i)))
        .collect();
    let ids = db.insert_batch(records).unwrap();
    assert_eq!(ids.len(), 6_000);
    assert_eq!(db.stats().unwrap().records, 6_000);
}
