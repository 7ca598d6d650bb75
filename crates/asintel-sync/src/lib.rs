//! Run orchestration: intake, merge, analytics, export and reports for one
//! tracked collection.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use asintel_analytics::{analyze_asin, default_significance, AnalyticsPolicy, AnalyticsTables, SignificanceTest};
use asintel_core::{normalize_asin, AsinMeta, LexiconScorer, StopReason, TrackedCollection};
use asintel_intake::{load_inbox, InboxBatch};
use asintel_storage::{KnownReviews, RowStore, RowTables};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

pub mod export;
pub mod merge;
mod report;

use export::{export_tables, select_sink, ExportFormat, TableSink};
use merge::{AsinMerge, BatchOutcome, CollectionMerger, MergeError};

pub use report::{report_markdown, RUN_BRIEF_FILE, RUN_SUMMARY_FILE};

pub const CRATE_NAME: &str = "asintel-sync";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub inbox_dir: PathBuf,
    pub policy_path: PathBuf,
    pub prefer_parquet: bool,
    pub workers: usize,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("ASINTEL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            inbox_dir: std::env::var("ASINTEL_INBOX_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./inbox")),
            policy_path: std::env::var("ASINTEL_POLICY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./policy.yaml")),
            prefer_parquet: std::env::var("ASINTEL_PREFER_PARQUET")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            workers: std::env::var("ASINTEL_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(4),
        }
    }

    pub fn store(&self, collection_id: &str) -> RowStore {
        RowStore::new(&self.data_dir, collection_id)
    }
}

/// Everything a run needs, decided once up front and passed to every stage.
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub store: RowStore,
    pub inbox_dir: PathBuf,
    pub policy: Arc<AnalyticsPolicy>,
    pub sink: Box<dyn TableSink>,
    pub significance: Arc<dyn SignificanceTest>,
    pub workers: usize,
}

impl RunContext {
    pub fn new(config: &PipelineConfig, collection_id: &str) -> Result<Self> {
        let policy = AnalyticsPolicy::load(&config.policy_path)?;
        let ctx = Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            store: config.store(collection_id),
            inbox_dir: config.inbox_dir.clone(),
            policy: Arc::new(policy),
            sink: select_sink(config.prefer_parquet),
            significance: Arc::from(default_significance()),
            workers: config.workers.max(1),
        };
        info!(
            run_id = %ctx.run_id,
            collection = ctx.store.collection_id(),
            sink = ctx.sink.format().extension(),
            significance = ctx.significance.name(),
            workers = ctx.workers,
            "run context ready"
        );
        Ok(ctx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Collect,
    Analyze,
}

/// Per-ASIN result of a collect run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsinRunRow {
    pub asin: String,
    pub batches: usize,
    pub new_reviews: u32,
    pub duplicates_skipped: u32,
    pub snapshots_written: usize,
    pub pages_visited: Option<u32>,
    pub stopped_reason: Option<StopReason>,
    /// Set when the ASIN was skipped; its stored rows were left untouched.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedFile {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub dir: String,
    pub latest_dir: String,
    pub format: ExportFormat,
    pub tables: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub collection_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub significance: String,
    pub asins: Vec<AsinRunRow>,
    pub rejected_files: Vec<RejectedFile>,
    pub registered_asins: usize,
    pub sentiment_backfilled: usize,
    pub archived_batches: usize,
    pub export: ExportSummary,
    pub reports_dir: String,
}

impl RunSummary {
    pub fn skipped(&self) -> impl Iterator<Item = &AsinRunRow> {
        self.asins.iter().filter(|a| a.error.is_some())
    }
}

pub async fn init_collection(
    config: &PipelineConfig,
    name: &str,
    asins: &[String],
) -> Result<TrackedCollection> {
    let mut collection = TrackedCollection::new(name, Utc::now());
    collection.append_asins(asins.iter().map(|a| AsinMeta::new(a)));
    let store = config.store(&collection.collection_id);
    store.create(&collection).await?;
    Ok(collection)
}

/// Appends ASINs to an existing collection. Returns how many were new.
pub async fn add_asins(config: &PipelineConfig, collection_id: &str, asins: &[String]) -> Result<usize> {
    let store = config.store(collection_id);
    let _lock = store.lock()?;
    let mut collection = store.load_collection().await?;
    let added = collection.append_asins(asins.iter().map(|a| AsinMeta::new(a)));
    store.save_collection(&collection).await?;
    info!(collection = collection_id, added, total = collection.asins.len(), "asins added");
    Ok(added)
}

/// What the scraper needs to decide when to stop paginating an ASIN.
pub async fn known_reviews(config: &PipelineConfig, collection_id: &str, asin: &str) -> Result<KnownReviews> {
    let store = config.store(collection_id);
    store.load_collection().await?;
    let tables = store.load_tables().await?;
    Ok(tables.known_reviews(&normalize_asin(asin)))
}

/// Consumes the inbox into the collection, then regenerates every derived
/// table and export. Durable files are only rewritten after export succeeds.
pub async fn collect(ctx: &RunContext) -> Result<RunSummary> {
    let span = tracing::info_span!("collect", run_id = %ctx.run_id, collection = ctx.store.collection_id());
    collect_inner(ctx).instrument(span).await
}

async fn collect_inner(ctx: &RunContext) -> Result<RunSummary> {
    let store = &ctx.store;
    let _lock = store.lock()?;
    let mut collection = store.load_collection().await?;
    let mut tables = store.load_tables().await?;

    let scan = load_inbox(&ctx.inbox_dir)?;
    let rejected_files = scan
        .rejected
        .iter()
        .map(|(path, err)| RejectedFile {
            path: path.display().to_string(),
            error: err.to_string(),
        })
        .collect();

    let mut by_asin: BTreeMap<String, Vec<InboxBatch>> = BTreeMap::new();
    for item in scan.batches {
        by_asin.entry(item.batch.asin.clone()).or_default().push(item);
    }

    let scorer = LexiconScorer;
    let merger = CollectionMerger::new(&scorer);
    let mut rows = Vec::new();
    let mut consumed = Vec::new();
    let mut metas = Vec::new();
    for (asin, mut batches) in by_asin {
        batches.sort_by(|a, b| (a.batch.captured_at, &a.path).cmp(&(b.batch.captured_at, &b.path)));
        match merge_asin(&merger, &tables, &asin, &batches) {
            Ok((merge, outcomes)) => {
                merge.commit(&mut tables);
                rows.push(asin_row(&asin, &outcomes, None));
                metas.extend(batches.iter().map(|b| b.batch.asin_meta()));
                consumed.extend(batches);
            }
            Err(err) => {
                warn!(asin = %asin, error = %err, "skipping asin for this run");
                rows.push(asin_row(&asin, &[], Some(err.to_string())));
            }
        }
    }

    let skipped: BTreeSet<&str> = rows
        .iter()
        .filter(|r| r.error.is_some())
        .map(|r| r.asin.as_str())
        .collect();
    let mut sentiment_backfilled = 0;
    for asin in tables.asins() {
        if !skipped.contains(asin.as_str()) {
            sentiment_backfilled += merger.backfill_sentiment(&mut tables, &asin);
        }
    }
    let registered_asins = collection.append_asins(metas);
    if registered_asins > 0 {
        info!(registered_asins, "new asins registered from batches");
    }

    let analytics = run_analytics(ctx, &collection, &tables).await?;
    let export = export_run(ctx, &collection, &tables, &analytics)?;

    store.save_tables(&tables).await?;
    store.save_collection(&collection).await?;

    let archive = store.archive();
    let mut archived_batches = 0;
    for item in &consumed {
        archive
            .archive(item.batch.captured_at, &item.batch.asin, &item.bytes)
            .await?;
        archived_batches += 1;
        if let Err(err) = tokio::fs::remove_file(&item.path).await {
            warn!(file = %item.path.display(), error = %err, "could not remove consumed batch");
        }
    }

    let summary = RunSummary {
        run_id: ctx.run_id,
        kind: RunKind::Collect,
        collection_id: store.collection_id().to_string(),
        started_at: ctx.started_at,
        finished_at: Utc::now(),
        significance: ctx.significance.name().to_string(),
        asins: rows,
        rejected_files,
        registered_asins,
        sentiment_backfilled,
        archived_batches,
        export,
        reports_dir: String::new(),
    };
    let summary = report::write_run_reports(store.dir(), summary).await?;
    info!(
        asins = summary.asins.len(),
        skipped = summary.skipped().count(),
        archived_batches,
        "collect run finished"
    );
    Ok(summary)
}

/// Regenerates analytics and exports from the stored rows without intake.
pub async fn analyze(ctx: &RunContext) -> Result<RunSummary> {
    let span = tracing::info_span!("analyze", run_id = %ctx.run_id, collection = ctx.store.collection_id());
    analyze_inner(ctx).instrument(span).await
}

async fn analyze_inner(ctx: &RunContext) -> Result<RunSummary> {
    let store = &ctx.store;
    let _lock = store.lock()?;
    let collection = store.load_collection().await?;
    let mut tables = store.load_tables().await?;

    let scorer = LexiconScorer;
    let merger = CollectionMerger::new(&scorer);
    let mut sentiment_backfilled = 0;
    for asin in tables.asins() {
        if tables.integrity_issue(&asin).is_none() {
            sentiment_backfilled += merger.backfill_sentiment(&mut tables, &asin);
        }
    }

    let analytics = run_analytics(ctx, &collection, &tables).await?;
    let export = export_run(ctx, &collection, &tables, &analytics)?;
    if sentiment_backfilled > 0 {
        store.save_tables(&tables).await?;
    }

    let summary = RunSummary {
        run_id: ctx.run_id,
        kind: RunKind::Analyze,
        collection_id: store.collection_id().to_string(),
        started_at: ctx.started_at,
        finished_at: Utc::now(),
        significance: ctx.significance.name().to_string(),
        asins: Vec::new(),
        rejected_files: Vec::new(),
        registered_asins: 0,
        sentiment_backfilled,
        archived_batches: 0,
        export,
        reports_dir: String::new(),
    };
    report::write_run_reports(store.dir(), summary).await
}

fn merge_asin(
    merger: &CollectionMerger,
    tables: &RowTables,
    asin: &str,
    batches: &[InboxBatch],
) -> Result<(AsinMerge, Vec<BatchOutcome>), MergeError> {
    let mut merge = merger.begin(tables, asin)?;
    let outcomes = batches
        .iter()
        .map(|b| merger.merge_batch(&mut merge, &b.batch))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((merge, outcomes))
}

fn asin_row(asin: &str, outcomes: &[BatchOutcome], error: Option<String>) -> AsinRunRow {
    let last = outcomes.last();
    AsinRunRow {
        asin: asin.to_string(),
        batches: outcomes.len(),
        new_reviews: outcomes.iter().map(|o| o.new_reviews).sum(),
        duplicates_skipped: outcomes.iter().map(|o| o.duplicates_skipped).sum(),
        snapshots_written: outcomes.iter().filter(|o| o.snapshot_written).count(),
        pages_visited: last.and_then(|o| o.pages_visited),
        stopped_reason: last.map(|o| o.stopped_reason.clone()),
        error,
    }
}

/// Derives every ASIN's tables on a bounded pool of blocking workers.
async fn run_analytics(
    ctx: &RunContext,
    collection: &TrackedCollection,
    tables: &RowTables,
) -> Result<AnalyticsTables> {
    let mut asins: BTreeSet<String> = collection.asins.iter().map(|m| m.asin.clone()).collect();
    asins.extend(tables.asins());

    let mut set = JoinSet::new();
    let mut merged = AnalyticsTables::default();
    for asin in asins {
        while set.len() >= ctx.workers {
            if let Some(joined) = set.join_next().await {
                merged.extend(joined.context("analytics worker failed")?);
            }
        }
        let reviews: Vec<_> = tables.reviews.iter().filter(|r| r.asin == asin).cloned().collect();
        let snapshots: Vec<_> = tables.snapshots.iter().filter(|s| s.asin == asin).cloned().collect();
        let policy = Arc::clone(&ctx.policy);
        let significance = Arc::clone(&ctx.significance);
        set.spawn_blocking(move || {
            analyze_asin(&asin, &reviews, &snapshots, &policy, significance.as_ref())
        });
    }
    while let Some(joined) = set.join_next().await {
        merged.extend(joined.context("analytics worker failed")?);
    }
    merged.sort();
    Ok(merged)
}

fn export_run(
    ctx: &RunContext,
    collection: &TrackedCollection,
    tables: &RowTables,
    analytics: &AnalyticsTables,
) -> Result<ExportSummary> {
    let result = export_tables(
        &ctx.store.dir().join("exports"),
        ctx.run_id,
        Utc::now(),
        ctx.sink.as_ref(),
        collection,
        tables,
        analytics,
    )?;
    Ok(ExportSummary {
        dir: result.dir.display().to_string(),
        latest_dir: result.latest_dir.display().to_string(),
        format: result.manifest.format,
        tables: result.manifest.files.len(),
    })
}
