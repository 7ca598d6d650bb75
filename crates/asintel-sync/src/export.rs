//! Table export: Arrow record batches written through one sink per run into
//! `exports/<run_ts>/`, then mirrored to `exports/latest/` with a manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Float64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use asintel_analytics::AnalyticsTables;
use asintel_core::{SnapshotRecord, TrackedCollection};
use asintel_storage::RowTables;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

pub const SCHEMA_VERSION: u32 = 1;
pub const LATEST_DIR: &str = "latest";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Parquet,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Parquet => "parquet",
            Self::Csv => "csv",
        }
    }
}

/// Writes one record batch to one file.
pub trait TableSink: Send + Sync {
    fn format(&self) -> ExportFormat;
    fn write(&self, path: &Path, batch: &RecordBatch) -> Result<()>;
}

#[cfg(feature = "parquet")]
#[derive(Debug, Clone, Copy, Default)]
pub struct ParquetSink;

#[cfg(feature = "parquet")]
impl TableSink for ParquetSink {
    fn format(&self) -> ExportFormat {
        ExportFormat::Parquet
    }

    fn write(&self, path: &Path, batch: &RecordBatch) -> Result<()> {
        use parquet::arrow::ArrowWriter;

        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
            .with_context(|| format!("opening parquet writer {}", path.display()))?;
        writer
            .write(batch)
            .with_context(|| format!("writing record batch {}", path.display()))?;
        writer
            .close()
            .with_context(|| format!("closing parquet writer {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvSink;

impl TableSink for CsvSink {
    fn format(&self) -> ExportFormat {
        ExportFormat::Csv
    }

    fn write(&self, path: &Path, batch: &RecordBatch) -> Result<()> {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut writer = arrow_csv::WriterBuilder::new().with_header(true).build(file);
        writer
            .write(batch)
            .with_context(|| format!("writing csv {}", path.display()))?;
        Ok(())
    }
}

/// Parquet when preferred and compiled in, CSV otherwise.
pub fn select_sink(prefer_parquet: bool) -> Box<dyn TableSink> {
    if prefer_parquet {
        binary_sink()
    } else {
        Box::new(CsvSink)
    }
}

#[cfg(feature = "parquet")]
fn binary_sink() -> Box<dyn TableSink> {
    Box::new(ParquetSink)
}

#[cfg(not(feature = "parquet"))]
fn binary_sink() -> Box<dyn TableSink> {
    warn!("parquet support not compiled in, exporting csv");
    Box::new(CsvSink)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub exported_at: DateTime<Utc>,
    pub format: ExportFormat,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ExportResult {
    pub dir: PathBuf,
    pub latest_dir: PathBuf,
    pub manifest: ExportManifest,
}

/// Builds every table and writes it under `exports_root`. A failing primary
/// sink is replaced by CSV for the whole run.
pub fn export_tables(
    exports_root: &Path,
    run_id: Uuid,
    exported_at: DateTime<Utc>,
    sink: &dyn TableSink,
    collection: &TrackedCollection,
    rows: &RowTables,
    analytics: &AnalyticsTables,
) -> Result<ExportResult> {
    let batches = build_batches(collection, rows, analytics)?;
    let dir = unique_run_dir(exports_root, exported_at)?;
    let staging = exports_root.join(format!(".{}.tmp", Uuid::new_v4()));

    let files = match write_all(&staging, sink, &batches) {
        Ok(files) => files,
        Err(err) if sink.format() != ExportFormat::Csv => {
            let reason = format!("{err:#}");
            warn!(error = %reason, "export sink failed, falling back to csv");
            let _ = std::fs::remove_dir_all(&staging);
            write_all(&staging, &CsvSink, &batches)?
        }
        Err(err) => {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(err);
        }
    };
    let format = files
        .first()
        .map(|(_, f)| *f)
        .unwrap_or_else(|| sink.format());

    let manifest = ExportManifest {
        schema_version: SCHEMA_VERSION,
        run_id,
        exported_at,
        format,
        files: files.into_iter().map(|(entry, _)| entry).collect(),
    };
    let manifest_bytes =
        serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    std::fs::write(staging.join(MANIFEST_FILE), manifest_bytes)
        .with_context(|| format!("writing manifest in {}", staging.display()))?;

    std::fs::rename(&staging, &dir)
        .with_context(|| format!("moving {} -> {}", staging.display(), dir.display()))?;
    let latest_dir = replace_latest(exports_root, &dir)?;

    info!(
        dir = %dir.display(),
        format = format.extension(),
        tables = manifest.files.len(),
        "tables exported"
    );
    Ok(ExportResult {
        dir,
        latest_dir,
        manifest,
    })
}

fn write_all(
    dir: &Path,
    sink: &dyn TableSink,
    batches: &[(&'static str, RecordBatch)],
) -> Result<Vec<(ExportManifestFile, ExportFormat)>> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let format = sink.format();
    batches
        .iter()
        .map(|(name, batch)| {
            let file_name = format!("{name}.{}", format.extension());
            let path = dir.join(&file_name);
            sink.write(&path, batch)?;
            let entry = manifest_entry(name, &file_name, &path, batch.num_rows())?;
            Ok((entry, format))
        })
        .collect()
}

fn manifest_entry(name: &str, file_name: &str, path: &Path, rows: usize) -> Result<ExportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: file_name.to_string(),
        rows,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

fn unique_run_dir(root: &Path, exported_at: DateTime<Utc>) -> Result<PathBuf> {
    std::fs::create_dir_all(root).with_context(|| format!("creating {}", root.display()))?;
    let stamp = exported_at.format("%Y%m%d_%H%M%S").to_string();
    let mut candidate = root.join(&stamp);
    let mut n = 1;
    while candidate.exists() {
        candidate = root.join(format!("{stamp}_{n}"));
        n += 1;
    }
    Ok(candidate)
}

/// Copies a finished run directory over `latest/` via a temp directory.
fn replace_latest(root: &Path, run_dir: &Path) -> Result<PathBuf> {
    let latest = root.join(LATEST_DIR);
    let staging = root.join(format!(".latest-{}.tmp", Uuid::new_v4()));
    std::fs::create_dir_all(&staging).with_context(|| format!("creating {}", staging.display()))?;
    for entry in std::fs::read_dir(run_dir).with_context(|| format!("reading {}", run_dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::copy(entry.path(), staging.join(entry.file_name()))
                .with_context(|| format!("copying {}", entry.path().display()))?;
        }
    }
    if latest.exists() {
        std::fs::remove_dir_all(&latest)
            .with_context(|| format!("removing {}", latest.display()))?;
    }
    std::fs::rename(&staging, &latest)
        .with_context(|| format!("moving {} -> {}", staging.display(), latest.display()))?;
    Ok(latest)
}

#[derive(Default)]
struct BatchBuilder {
    fields: Vec<ArrowField>,
    columns: Vec<ArrayRef>,
}

impl BatchBuilder {
    fn key<I: IntoIterator<Item = String>>(mut self, name: &str, values: I) -> Self {
        let array = StringArray::from(values.into_iter().map(Some).collect::<Vec<_>>());
        self.fields.push(ArrowField::new(name, DataType::Utf8, false));
        self.columns.push(Arc::new(array));
        self
    }

    fn text<I: IntoIterator<Item = Option<String>>>(mut self, name: &str, values: I) -> Self {
        let array = StringArray::from(values.into_iter().collect::<Vec<_>>());
        self.fields.push(ArrowField::new(name, DataType::Utf8, true));
        self.columns.push(Arc::new(array));
        self
    }

    fn float<I: IntoIterator<Item = Option<f64>>>(mut self, name: &str, values: I) -> Self {
        let array = Float64Array::from(values.into_iter().collect::<Vec<_>>());
        self.fields.push(ArrowField::new(name, DataType::Float64, true));
        self.columns.push(Arc::new(array));
        self
    }

    fn uint<I: IntoIterator<Item = Option<u64>>>(mut self, name: &str, values: I) -> Self {
        let array = UInt64Array::from(values.into_iter().collect::<Vec<_>>());
        self.fields.push(ArrowField::new(name, DataType::UInt64, true));
        self.columns.push(Arc::new(array));
        self
    }

    fn flag<I: IntoIterator<Item = Option<bool>>>(mut self, name: &str, values: I) -> Self {
        let array = BooleanArray::from(values.into_iter().collect::<Vec<_>>());
        self.fields.push(ArrowField::new(name, DataType::Boolean, true));
        self.columns.push(Arc::new(array));
        self
    }

    fn finish(self, table: &str) -> Result<RecordBatch> {
        RecordBatch::try_new(Arc::new(Schema::new(self.fields)), self.columns)
            .with_context(|| format!("building {table} record batch"))
    }
}

fn date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn opt_date(d: Option<NaiveDate>) -> Option<String> {
    d.map(date)
}

fn count<T: Into<u64>>(v: T) -> Option<u64> {
    Some(v.into())
}

/// Every exported table, in manifest order.
pub fn build_batches(
    collection: &TrackedCollection,
    rows: &RowTables,
    a: &AnalyticsTables,
) -> Result<Vec<(&'static str, RecordBatch)>> {
    let mut snapshots: Vec<&SnapshotRecord> = rows.snapshots.iter().collect();
    snapshots.sort_by(|x, y| (&x.asin, x.captured_at).cmp(&(&y.asin, y.captured_at)));
    let mut latest: Vec<&SnapshotRecord> = Vec::new();
    for snap in snapshots.iter().copied() {
        match latest.last_mut() {
            Some(last) if last.asin == snap.asin => *last = snap,
            _ => latest.push(snap),
        }
    }
    let mut reviews: Vec<_> = rows.reviews.iter().collect();
    reviews.sort_by(|x, y| (&x.asin, &x.review_id).cmp(&(&y.asin, &y.review_id)));

    let asins = BatchBuilder::default()
        .key("asin", collection.asins.iter().map(|m| m.asin.clone()))
        .text("title", collection.asins.iter().map(|m| m.title.clone()))
        .text("category_path", collection.asins.iter().map(|m| m.category_path.clone()))
        .text("country", collection.asins.iter().map(|m| m.country.clone()))
        .finish("asins_dim")?;

    let reviews_fact = BatchBuilder::default()
        .key("asin", reviews.iter().map(|r| r.asin.clone()))
        .key("review_id", reviews.iter().map(|r| r.review_id.clone()))
        .text("review_date", reviews.iter().map(|r| opt_date(r.review_date)))
        .uint("rating", reviews.iter().map(|r| r.rating.map(u64::from)))
        .float("sentiment", reviews.iter().map(|r| r.sentiment))
        .uint("review_helpful_votes", reviews.iter().map(|r| count(r.helpful_votes)))
        .text("captured_at", reviews.iter().map(|r| Some(r.captured_at.to_rfc3339())))
        .finish("reviews_fact")?;

    let batches = vec![
        ("asins_dim", asins),
        ("reviews_fact", reviews_fact),
        ("snapshot_fact", snapshot_batch(&snapshots, "snapshot_fact")?),
        ("snapshot_latest", snapshot_batch(&latest, "snapshot_latest")?),
        ("sentiment_daily", sentiment_daily_batch(a)?),
        ("metrics_daily", metrics_daily_batch(a)?),
        ("metrics_rolling_7d", rolling_batch(&a.rolling_7d, 7)?),
        ("metrics_rolling_28d", rolling_batch(&a.rolling_28d, 28)?),
        ("flags_detail", flags_detail_batch(a)?),
        ("flags_summary_by_asin", flags_summary_batch(a)?),
        ("nps_by_asin", nps_by_asin_batch(a)?),
        ("nps_daily", nps_daily_batch(a)?),
        ("nps_rolling", nps_rolling_batch(a)?),
        ("correlations_by_asin", correlations_batch(a)?),
        ("correlations_alerts_7d", alerts_batch(a)?),
    ];
    Ok(batches)
}

fn snapshot_batch(snaps: &[&SnapshotRecord], table: &str) -> Result<RecordBatch> {
    BatchBuilder::default()
        .key("asin", snaps.iter().map(|s| s.asin.clone()))
        .key("captured_at", snaps.iter().map(|s| s.captured_at.to_rfc3339()))
        .float("price", snaps.iter().map(|s| s.price))
        .flag("price_hidden", snaps.iter().map(|s| Some(s.price_hidden)))
        .float("rating", snaps.iter().map(|s| s.rating))
        .uint("total_reviews", snaps.iter().map(|s| s.total_reviews))
        .uint("new_reviews", snaps.iter().map(|s| count(s.new_reviews)))
        .uint("bsr", snaps.iter().map(|s| s.bsr))
        .text("category_path", snaps.iter().map(|s| s.category_path.clone()))
        .text("title", snaps.iter().map(|s| s.title.clone()))
        .uint("pages_visited", snaps.iter().map(|s| s.pages_visited.map(u64::from)))
        .text("stopped_reason", snaps.iter().map(|s| Some(s.stopped_reason.to_string())))
        .finish(table)
}

fn sentiment_daily_batch(a: &AnalyticsTables) -> Result<RecordBatch> {
    let rows = &a.sentiment_daily;
    BatchBuilder::default()
        .key("asin", rows.iter().map(|r| r.asin.clone()))
        .key("date", rows.iter().map(|r| date(r.date)))
        .uint("review_count", rows.iter().map(|r| count(r.review_count)))
        .float("avg_sentiment", rows.iter().map(|r| r.avg_sentiment))
        .uint("pos_cnt", rows.iter().map(|r| count(r.pos_cnt)))
        .uint("neut_cnt", rows.iter().map(|r| count(r.neut_cnt)))
        .uint("neg_cnt", rows.iter().map(|r| count(r.neg_cnt)))
        .finish("sentiment_daily")
}

fn metrics_daily_batch(a: &AnalyticsTables) -> Result<RecordBatch> {
    let rows = &a.metrics_daily;
    BatchBuilder::default()
        .key("asin", rows.iter().map(|r| r.asin.clone()))
        .key("date", rows.iter().map(|r| date(r.date)))
        .float("price", rows.iter().map(|r| r.price))
        .flag("price_hidden", rows.iter().map(|r| r.price_hidden))
        .float("rating", rows.iter().map(|r| r.rating))
        .uint("total_reviews", rows.iter().map(|r| r.total_reviews))
        .uint("bsr", rows.iter().map(|r| r.bsr))
        .uint("new_reviews", rows.iter().map(|r| count(r.new_reviews)))
        .uint("review_count", rows.iter().map(|r| count(r.review_count)))
        .float("avg_sentiment", rows.iter().map(|r| r.avg_sentiment))
        .uint("pos_cnt", rows.iter().map(|r| count(r.pos_cnt)))
        .uint("neut_cnt", rows.iter().map(|r| count(r.neut_cnt)))
        .uint("neg_cnt", rows.iter().map(|r| count(r.neg_cnt)))
        .float("price_3d", rows.iter().map(|r| r.price_3d))
        .float("rating_3d", rows.iter().map(|r| r.rating_3d))
        .float("bsr_3d", rows.iter().map(|r| r.bsr_3d))
        .float("review_count_3d", rows.iter().map(|r| r.review_count_3d))
        .float("avg_sentiment_3d", rows.iter().map(|r| r.avg_sentiment_3d))
        .finish("metrics_daily")
}

fn rolling_batch(rows: &[asintel_analytics::RollingMetric], window: usize) -> Result<RecordBatch> {
    BatchBuilder::default()
        .key("asin", rows.iter().map(|r| r.asin.clone()))
        .key("date", rows.iter().map(|r| date(r.date)))
        .float(&format!("price_{window}d"), rows.iter().map(|r| r.price))
        .float(&format!("rating_{window}d"), rows.iter().map(|r| r.rating))
        .float(&format!("bsr_{window}d"), rows.iter().map(|r| r.bsr))
        .float(&format!("review_count_{window}d"), rows.iter().map(|r| r.review_count))
        .float(&format!("avg_sentiment_{window}d"), rows.iter().map(|r| r.avg_sentiment))
        .finish(&format!("metrics_rolling_{window}d"))
}

fn flags_detail_batch(a: &AnalyticsTables) -> Result<RecordBatch> {
    let rows = &a.flags_detail;
    BatchBuilder::default()
        .key("asin", rows.iter().map(|r| r.asin.clone()))
        .key("review_id", rows.iter().map(|r| r.review_id.clone()))
        .text("review_date", rows.iter().map(|r| opt_date(r.review_date)))
        .uint("text_length", rows.iter().map(|r| Some(r.text_length as u64)))
        .key("flag", rows.iter().map(|r| r.flag.as_str().to_string()))
        .finish("flags_detail")
}

fn flags_summary_batch(a: &AnalyticsTables) -> Result<RecordBatch> {
    let rows = &a.flags_summary;
    let n = |f: fn(&asintel_analytics::FlagSummary) -> usize| {
        rows.iter().map(move |r| Some(f(r) as u64))
    };
    BatchBuilder::default()
        .key("asin", rows.iter().map(|r| r.asin.clone()))
        .uint("n_reviews", n(|r| r.n_reviews))
        .uint("flagged_reviews", n(|r| r.flagged_reviews))
        .uint("short", n(|r| r.short))
        .uint("long", n(|r| r.long))
        .uint("duplicate", n(|r| r.duplicate))
        .uint("volume_spike", n(|r| r.volume_spike))
        .uint("hyperactive_author", n(|r| r.hyperactive_author))
        .finish("flags_summary_by_asin")
}

fn nps_by_asin_batch(a: &AnalyticsTables) -> Result<RecordBatch> {
    let rows = &a.nps_by_asin;
    BatchBuilder::default()
        .key("asin", rows.iter().map(|r| r.asin.clone()))
        .uint("n_reviews", rows.iter().map(|r| Some(r.n_reviews as u64)))
        .float("promoter_pct", rows.iter().map(|r| r.promoter_pct))
        .float("passive_pct", rows.iter().map(|r| r.passive_pct))
        .float("detractor_pct", rows.iter().map(|r| r.detractor_pct))
        .float("nps", rows.iter().map(|r| r.nps))
        .text("date_captured", rows.iter().map(|r| opt_date(r.date_captured)))
        .finish("nps_by_asin")
}

fn nps_daily_batch(a: &AnalyticsTables) -> Result<RecordBatch> {
    let rows = &a.nps_daily;
    BatchBuilder::default()
        .key("asin", rows.iter().map(|r| r.asin.clone()))
        .key("date", rows.iter().map(|r| date(r.date)))
        .uint("promoter_cnt", rows.iter().map(|r| count(r.promoter_cnt)))
        .uint("passive_cnt", rows.iter().map(|r| count(r.passive_cnt)))
        .uint("detractor_cnt", rows.iter().map(|r| count(r.detractor_cnt)))
        .uint("n_reviews", rows.iter().map(|r| count(r.n_reviews)))
        .float("nps_daily", rows.iter().map(|r| r.nps_daily))
        .finish("nps_daily")
}

fn nps_rolling_batch(a: &AnalyticsTables) -> Result<RecordBatch> {
    let rows = &a.nps_rolling;
    BatchBuilder::default()
        .key("asin", rows.iter().map(|r| r.asin.clone()))
        .key("date", rows.iter().map(|r| date(r.date)))
        .float("nps_7d", rows.iter().map(|r| r.nps_7d))
        .float("nps_28d", rows.iter().map(|r| r.nps_28d))
        .finish("nps_rolling")
}

fn correlations_batch(a: &AnalyticsTables) -> Result<RecordBatch> {
    let rows = &a.correlations;
    BatchBuilder::default()
        .key("asin", rows.iter().map(|r| r.asin.clone()))
        .key("smoothing", rows.iter().map(|r| r.smoothing.as_str().to_string()))
        .uint("window_days", rows.iter().map(|r| Some(r.window_days.max(0) as u64)))
        .key("pair", rows.iter().map(|r| r.pair.as_str().to_string()))
        .text("window_start", rows.iter().map(|r| Some(date(r.window_start))))
        .text("window_end", rows.iter().map(|r| Some(date(r.window_end))))
        .uint("n_obs", rows.iter().map(|r| Some(r.n_obs as u64)))
        .float("r", rows.iter().map(|r| r.r))
        .float("p", rows.iter().map(|r| r.p))
        .float("first_half_r", rows.iter().map(|r| r.first_half_r))
        .float("second_half_r", rows.iter().map(|r| r.second_half_r))
        .flag("stable", rows.iter().map(|r| Some(r.stable)))
        .flag("sig", rows.iter().map(|r| Some(r.sig)))
        .finish("correlations_by_asin")
}

fn alerts_batch(a: &AnalyticsTables) -> Result<RecordBatch> {
    let rows = &a.alerts;
    BatchBuilder::default()
        .key("asin", rows.iter().map(|r| r.asin.clone()))
        .key("date", rows.iter().map(|r| date(r.date)))
        .key("smoothing", rows.iter().map(|r| r.smoothing.as_str().to_string()))
        .key("pair", rows.iter().map(|r| r.pair.as_str().to_string()))
        .float("r", rows.iter().map(|r| Some(r.r)))
        .float("p", rows.iter().map(|r| Some(r.p)))
        .uint("n_obs", rows.iter().map(|r| Some(r.n_obs as u64)))
        .flag("stable", rows.iter().map(|r| Some(r.stable)))
        .float("severity", rows.iter().map(|r| Some(r.severity)))
        .text("tier", rows.iter().map(|r| Some(r.tier.clone())))
        .finish("correlations_alerts_7d")
}

#[cfg(test)]
mod tests {
    use super::*;
    use asintel_analytics::{analyze_asin, AnalyticsPolicy, NoPValue};
    use asintel_core::{AsinMeta, StopReason};
    use chrono::TimeZone;
    use tempfile::tempdir;

    struct BrokenSink;

    impl TableSink for BrokenSink {
        fn format(&self) -> ExportFormat {
            ExportFormat::Parquet
        }

        fn write(&self, path: &Path, _batch: &RecordBatch) -> Result<()> {
            anyhow::bail!("codec unavailable for {}", path.display())
        }
    }

    fn fixture() -> (TrackedCollection, RowTables, AnalyticsTables) {
        let at = |d: u32| Utc.with_ymd_and_hms(2025, 1, d, 9, 0, 0).single().unwrap();
        let mut collection = TrackedCollection::new("demo", at(1));
        collection.append_asins([AsinMeta::new("B1")]);
        let mut rows = RowTables::default();
        for d in [1, 3] {
            rows.snapshots.push(SnapshotRecord {
                asin: "B1".into(),
                captured_at: at(d),
                price_raw: Some("$5".into()),
                price: Some(5.0 + f64::from(d)),
                price_hidden: false,
                rating: Some(4.0),
                total_reviews: Some(3),
                new_reviews: 1,
                duplicates_skipped: 0,
                bsr: Some(10),
                category_path: None,
                title: Some("Thing".into()),
                pages_visited: Some(1),
                stopped_reason: StopReason::EndPagination,
            });
        }
        let analytics = analyze_asin(
            "B1",
            &rows.reviews,
            &rows.snapshots,
            &AnalyticsPolicy::default(),
            &NoPValue,
        );
        (collection, rows, analytics)
    }

    #[test]
    fn every_table_is_built_with_its_columns() {
        let (collection, rows, analytics) = fixture();
        let batches = build_batches(&collection, &rows, &analytics).expect("batches");
        assert_eq!(batches.len(), 15);

        let by_name = |name: &str| {
            batches
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, b)| b.clone())
                .unwrap()
        };
        assert_eq!(by_name("snapshot_fact").num_rows(), 2);
        assert_eq!(by_name("snapshot_latest").num_rows(), 1);
        assert_eq!(by_name("metrics_daily").num_rows(), 3);
        assert_eq!(by_name("metrics_daily").num_columns(), 18);
        let rolling = by_name("metrics_rolling_28d");
        assert!(rolling.schema().field_with_name("avg_sentiment_28d").is_ok());
        assert_eq!(by_name("correlations_alerts_7d").num_rows(), 0);
    }

    #[test]
    fn csv_export_writes_versioned_and_latest_with_manifest() {
        let dir = tempdir().expect("tempdir");
        let (collection, rows, analytics) = fixture();
        let at = Utc.with_ymd_and_hms(2025, 1, 3, 10, 0, 0).single().unwrap();
        let result = export_tables(
            dir.path(),
            Uuid::new_v4(),
            at,
            &CsvSink,
            &collection,
            &rows,
            &analytics,
        )
        .expect("export");

        assert!(result.dir.ends_with("20250103_100000"));
        assert_eq!(result.manifest.format, ExportFormat::Csv);
        assert_eq!(result.manifest.schema_version, SCHEMA_VERSION);
        let latest_csv = result.latest_dir.join("metrics_daily.csv");
        let header = std::fs::read_to_string(latest_csv).unwrap();
        assert!(header.starts_with("asin,date,price,price_hidden,rating"));
        assert!(result.latest_dir.join(MANIFEST_FILE).exists());

        let again = export_tables(
            dir.path(),
            Uuid::new_v4(),
            at,
            &CsvSink,
            &collection,
            &rows,
            &analytics,
        )
        .expect("second export");
        assert!(again.dir.ends_with("20250103_100000_1"));
    }

    #[test]
    fn failing_primary_sink_falls_back_to_csv() {
        let dir = tempdir().expect("tempdir");
        let (collection, rows, analytics) = fixture();
        let result = export_tables(
            dir.path(),
            Uuid::new_v4(),
            Utc::now(),
            &BrokenSink,
            &collection,
            &rows,
            &analytics,
        )
        .expect("export");
        assert_eq!(result.manifest.format, ExportFormat::Csv);
        assert!(result
            .manifest
            .files
            .iter()
            .all(|f| f.path.ends_with(".csv")));
    }

    #[cfg(feature = "parquet")]
    #[test]
    fn parquet_sink_writes_files() {
        let dir = tempdir().expect("tempdir");
        let (collection, rows, analytics) = fixture();
        let result = export_tables(
            dir.path(),
            Uuid::new_v4(),
            Utc::now(),
            &ParquetSink,
            &collection,
            &rows,
            &analytics,
        )
        .expect("export");
        assert_eq!(result.manifest.format, ExportFormat::Parquet);
        assert!(result.dir.join("reviews_fact.parquet").exists());
    }
}
