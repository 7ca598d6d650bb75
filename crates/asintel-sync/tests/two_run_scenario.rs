use std::path::{Path, PathBuf};

use asintel_sync::export::ExportFormat;
use asintel_sync::{collect, init_collection, known_reviews, PipelineConfig, RunContext};
use tempfile::tempdir;

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn stage(run: &str, inbox: &Path) {
    std::fs::create_dir_all(inbox).unwrap();
    for entry in std::fs::read_dir(fixtures().join(run)).unwrap() {
        let entry = entry.unwrap();
        std::fs::copy(entry.path(), inbox.join(entry.file_name())).unwrap();
    }
}

#[tokio::test]
async fn second_run_only_adds_unseen_reviews() {
    let dir = tempdir().unwrap();
    let cfg = PipelineConfig {
        data_dir: dir.path().join("data"),
        inbox_dir: dir.path().join("inbox"),
        policy_path: dir.path().join("policy.yaml"),
        prefer_parquet: false,
        workers: 2,
    };
    init_collection(&cfg, "blenders", &["B001EXAMPLE".to_string()])
        .await
        .unwrap();

    stage("run1", &cfg.inbox_dir);
    let first = collect(&RunContext::new(&cfg, "blenders").unwrap()).await.unwrap();
    assert_eq!(first.asins[0].new_reviews, 2);
    assert_eq!(first.asins[0].duplicates_skipped, 0);

    stage("run2", &cfg.inbox_dir);
    let second = collect(&RunContext::new(&cfg, "blenders").unwrap()).await.unwrap();
    let row = &second.asins[0];
    assert_eq!(row.asin, "B001EXAMPLE");
    assert_eq!(row.new_reviews, 1);
    assert_eq!(row.duplicates_skipped, 1);
    assert_eq!(row.snapshots_written, 1);
    assert!(row.error.is_none());

    let store = cfg.store("blenders");
    let tables = store.load_tables().await.unwrap();
    let mut ids: Vec<_> = tables.reviews.iter().map(|r| r.review_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, ["R1", "R2", "R3"]);
    let r2 = tables.reviews.iter().find(|r| r.review_id == "R2").unwrap();
    assert_eq!(r2.rating, Some(1));
    assert_eq!(r2.helpful_votes, 1);

    let hidden = tables
        .snapshots
        .iter()
        .find(|s| s.price_raw.as_deref() == Some("Click to see price"))
        .unwrap();
    assert_eq!(hidden.price, None);
    assert!(hidden.price_hidden);

    let known = known_reviews(&cfg, "blenders", "B001EXAMPLE").await.unwrap();
    assert_eq!(known.len(), 3);
    assert_eq!(
        known.latest_review_date().map(|d| d.to_string()).as_deref(),
        Some("2025-01-03")
    );

    assert_eq!(second.export.format, ExportFormat::Csv);
    let latest = store.dir().join("exports").join("latest");
    let daily = std::fs::read_to_string(latest.join("metrics_daily.csv")).unwrap();
    // header + 2025-01-01 ..= 2025-01-03; R1 predates the first snapshot
    assert_eq!(daily.lines().count(), 4);
    let first_day = daily.lines().nth(1).unwrap();
    assert!(first_day.contains("2025-01-01"), "{first_day}");

    stage("run2", &cfg.inbox_dir);
    let replay = collect(&RunContext::new(&cfg, "blenders").unwrap()).await.unwrap();
    assert_eq!(replay.asins[0].new_reviews, 0);
    assert_eq!(replay.asins[0].duplicates_skipped, 2);
    assert_eq!(replay.asins[0].snapshots_written, 0);
    assert_eq!(store.load_tables().await.unwrap().snapshots.len(), 2);
    assert_eq!(store.load_tables().await.unwrap().reviews.len(), 3);
}
