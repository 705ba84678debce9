//! Invariant and boundary coverage for the merge engine.

mod common;

use std::sync::{Arc, Mutex};

use hivemerge::{
    DatasetPath, FileOperation, MergeEngine, MergeError, MergeOptions, MergeStrategy, TokioFs,
};
use tempfile::TempDir;

use common::*;

fn engine() -> MergeEngine<TokioFs> {
    MergeEngine::new(TokioFs)
}

fn keys() -> Vec<String> {
    vec!["id".to_string()]
}

#[tokio::test]
async fn empty_source_is_a_read_only_no_op() {
    let dir = TempDir::new().unwrap();
    write_target_file(dir.path(), "part-00000-aaaaaaaa.parquet", &[(1, Some("a"))]);
    let hash = file_crc(&dir.path().join("part-00000-aaaaaaaa.parquet"));

    let result = engine()
        .merge(
            vec![flat_source(&[])],
            &DatasetPath::from(dir.path()),
            MergeStrategy::Upsert,
            keys(),
            vec![],
            MergeOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.inserted, 0);
    assert_eq!(result.updated, 0);
    assert_eq!(result.deleted, 0);
    assert_eq!(result.target_rows_before, 1);
    assert_eq!(result.target_rows_after, 1);
    assert!(result
        .files
        .iter()
        .all(|f| f.operation == FileOperation::Preserved));
    assert_eq!(
        file_crc(&dir.path().join("part-00000-aaaaaaaa.parquet")),
        hash
    );
}

#[tokio::test]
async fn insert_discards_rows_for_existing_keys_without_rewriting() {
    let dir = TempDir::new().unwrap();
    write_target_file(dir.path(), "part-00000-aaaaaaaa.parquet", &[(1, Some("a"))]);
    let hash = file_crc(&dir.path().join("part-00000-aaaaaaaa.parquet"));

    let result = engine()
        .merge(
            vec![flat_source(&[(1, Some("X")), (2, Some("y"))])],
            &DatasetPath::from(dir.path()),
            MergeStrategy::Insert,
            keys(),
            vec![],
            MergeOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.inserted, 1);
    assert_eq!(result.updated, 0);
    assert_eq!(result.target_rows_after, 2);
    // The row for the existing key is unchanged, byte for byte.
    assert_eq!(
        file_crc(&dir.path().join("part-00000-aaaaaaaa.parquet")),
        hash
    );
    assert_eq!(
        dataset_rows(dir.path()),
        vec![(1, Some("a".to_string())), (2, Some("y".to_string()))]
    );
}

#[tokio::test]
async fn statistics_keep_disjoint_files_untouched() {
    let dir = TempDir::new().unwrap();
    let low: Vec<(i64, Option<&str>)> = (1..=10).map(|id| (id, Some("low"))).collect();
    let high: Vec<(i64, Option<&str>)> = (100..=110).map(|id| (id, Some("high"))).collect();
    write_target_file(dir.path(), "part-00000-aaaaaaaa.parquet", &low);
    write_target_file(dir.path(), "part-00001-bbbbbbbb.parquet", &high);
    let low_hash = file_crc(&dir.path().join("part-00000-aaaaaaaa.parquet"));

    let result = engine()
        .merge(
            vec![flat_source(&[(105, Some("HIGH"))])],
            &DatasetPath::from(dir.path()),
            MergeStrategy::Upsert,
            keys(),
            vec![],
            MergeOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.updated, 1);
    assert_eq!(result.inserted, 0);
    let by_op = |op: FileOperation| {
        result
            .files
            .iter()
            .filter(|f| f.operation == op)
            .count()
    };
    assert_eq!(by_op(FileOperation::Rewritten), 1);
    assert_eq!(by_op(FileOperation::Preserved), 1);
    assert_eq!(
        file_crc(&dir.path().join("part-00000-aaaaaaaa.parquet")),
        low_hash
    );
}

#[tokio::test]
async fn upsert_into_an_empty_target_writes_the_source() {
    let dir = TempDir::new().unwrap();

    let result = engine()
        .merge(
            vec![partitioned_source(&[
                (1, "2024-01-01", "a"),
                (2, "2024-01-01", "b"),
                (3, "2024-01-02", "c"),
            ])],
            &DatasetPath::from(dir.path()),
            MergeStrategy::Upsert,
            keys(),
            vec!["day".to_string()],
            MergeOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.inserted, 3);
    assert_eq!(result.updated, 0);
    assert_eq!(result.target_rows_before, 0);
    assert_eq!(result.target_rows_after, 3);

    // One file per partition, under the Hive layout.
    let first = parquet_files(&dir.path().join("day=2024-01-01"));
    let second = parquet_files(&dir.path().join("day=2024-01-02"));
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(
        dataset_rows(dir.path()),
        vec![
            (1, Some("a".to_string())),
            (2, Some("b".to_string())),
            (3, Some("c".to_string())),
        ]
    );
}

#[tokio::test]
async fn update_on_an_empty_target_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = engine()
        .merge(
            vec![flat_source(&[(1, Some("a"))])],
            &DatasetPath::from(dir.path()),
            MergeStrategy::Update,
            keys(),
            vec![],
            MergeOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MergeError::InvalidArgument(_)));
}

#[tokio::test]
async fn update_discards_rows_with_unknown_keys() {
    let dir = TempDir::new().unwrap();
    write_target_file(dir.path(), "part-00000-aaaaaaaa.parquet", &[(1, Some("a"))]);

    let result = engine()
        .merge(
            vec![flat_source(&[(1, Some("B")), (9, Some("z"))])],
            &DatasetPath::from(dir.path()),
            MergeStrategy::Update,
            keys(),
            vec![],
            MergeOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.updated, 1);
    assert_eq!(result.inserted, 0);
    assert_eq!(
        dataset_rows(dir.path()),
        vec![(1, Some("B".to_string()))]
    );
}

#[tokio::test]
async fn missing_key_columns_are_rejected_for_update_and_upsert() {
    let dir = TempDir::new().unwrap();
    for strategy in [MergeStrategy::Update, MergeStrategy::Upsert] {
        let err = engine()
            .merge(
                vec![flat_source(&[(1, Some("a"))])],
                &DatasetPath::from(dir.path()),
                strategy,
                vec![],
                vec![],
                MergeOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::InvalidArgument(_)));
    }
}

#[tokio::test]
async fn target_column_missing_from_source_is_schema_drift() {
    let dir = TempDir::new().unwrap();
    // Target files carry an extra column the source cannot supply.
    {
        use arrow::array::{Int64Array, RecordBatch, StringArray};
        use arrow::datatypes::{DataType, Field, Schema};
        use parquet::arrow::ArrowWriter;
        use std::sync::Arc;

        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("v", DataType::Utf8, true),
            Field::new("extra", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![
                Arc::new(Int64Array::from(vec![1])),
                Arc::new(StringArray::from(vec![Some("a")])),
                Arc::new(StringArray::from(vec![Some("x")])),
            ],
        )
        .unwrap();
        let file = std::fs::File::create(dir.path().join("part-00000-aaaaaaaa.parquet")).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    let err = engine()
        .merge(
            vec![flat_source(&[(1, Some("B"))])],
            &DatasetPath::from(dir.path()),
            MergeStrategy::Upsert,
            keys(),
            vec![],
            MergeOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MergeError::Schema(_)));
}

#[tokio::test]
async fn a_file_without_statistics_is_still_matched() {
    let dir = TempDir::new().unwrap();
    {
        use parquet::arrow::ArrowWriter;
        use parquet::file::properties::{EnabledStatistics, WriterProperties};

        let schema = target_schema();
        let batch = flat_source(&[(1, Some("a")), (2, Some("b"))]);
        let props = WriterProperties::builder()
            .set_statistics_enabled(EnabledStatistics::None)
            .build();
        let file = std::fs::File::create(dir.path().join("part-00000-aaaaaaaa.parquet")).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, Some(props)).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    let result = engine()
        .merge(
            vec![flat_source(&[(2, Some("B"))])],
            &DatasetPath::from(dir.path()),
            MergeStrategy::Upsert,
            keys(),
            vec![],
            MergeOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.updated, 1);
    assert_eq!(
        dataset_rows(dir.path()),
        vec![(1, Some("a".to_string())), (2, Some("B".to_string()))]
    );
}

#[tokio::test]
async fn progress_is_monotonic_and_reaches_the_total() {
    let dir = TempDir::new().unwrap();
    write_target_file(
        dir.path(),
        "part-00000-aaaaaaaa.parquet",
        &[(1, Some("a")), (2, Some("b")), (3, Some("c"))],
    );

    let observed: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    let options = MergeOptions::default().progress_callback(move |processed, total| {
        sink.lock().unwrap().push((processed, total));
    });

    engine()
        .merge(
            vec![flat_source(&[(2, Some("B")), (7, Some("n"))])],
            &DatasetPath::from(dir.path()),
            MergeStrategy::Upsert,
            keys(),
            vec![],
            options,
        )
        .await
        .unwrap();

    let observed = observed.lock().unwrap();
    assert!(!observed.is_empty());
    for pair in observed.windows(2) {
        assert!(pair[1].0 >= pair[0].0);
    }
    let (processed, total) = *observed.last().unwrap();
    assert_eq!(processed, total);
    // Three rewritten target rows plus one inserted row.
    assert_eq!(processed, 4);
}

#[tokio::test]
async fn nulls_outside_key_columns_survive_a_rewrite_verbatim() {
    let dir = TempDir::new().unwrap();
    write_target_file(
        dir.path(),
        "part-00000-aaaaaaaa.parquet",
        &[(1, None), (2, Some("b"))],
    );

    let result = engine()
        .merge(
            vec![flat_source(&[(2, Some("B"))])],
            &DatasetPath::from(dir.path()),
            MergeStrategy::Upsert,
            keys(),
            vec![],
            MergeOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.updated, 1);
    assert_eq!(
        read_rows(&dir.path().join("part-00000-aaaaaaaa.parquet")),
        vec![(1, None), (2, Some("B".to_string()))]
    );
}

#[tokio::test]
async fn upsert_is_idempotent_for_the_same_source() {
    let dir = TempDir::new().unwrap();
    write_target_file(dir.path(), "part-00000-aaaaaaaa.parquet", &[(1, Some("a"))]);

    let root = DatasetPath::from(dir.path());
    let source = vec![flat_source(&[(1, Some("A")), (2, Some("b"))])];

    let first = engine()
        .merge(
            source.clone(),
            &root,
            MergeStrategy::Upsert,
            keys(),
            vec![],
            MergeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!((first.inserted, first.updated), (1, 1));

    let second = engine()
        .merge(
            source,
            &root,
            MergeStrategy::Upsert,
            keys(),
            vec![],
            MergeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!((second.inserted, second.updated), (0, 2));
    assert_eq!(
        dataset_rows(dir.path()),
        vec![(1, Some("A".to_string())), (2, Some("b".to_string()))]
    );
}
