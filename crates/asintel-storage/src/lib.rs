//! Durable row store, run lock and raw batch archive for tracked collections.
//!
//! Layout under `<data_root>/<collection_id>/`:
//! `collection.json`, `reviews.jsonl`, `snapshots.jsonl`, `raw/`, `.asintel.lock`.
//! Every rewrite goes through a temp file and an atomic rename.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use asintel_core::{ReviewRecord, SnapshotRecord, TrackedCollection};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod schema;

pub use schema::{REVIEW_FIELD_ALIASES, SNAPSHOT_FIELD_ALIASES};

pub const COLLECTION_FILE: &str = "collection.json";
pub const REVIEWS_FILE: &str = "reviews.jsonl";
pub const SNAPSHOTS_FILE: &str = "snapshots.jsonl";
pub const LOCK_FILE: &str = ".asintel.lock";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("collection {0} already exists")]
    CollectionExists(String),
    #[error("collection {id} not found under {dir}")]
    CollectionMissing { id: String, dir: String },
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("collection is locked by another run ({path}): {holder}")]
    Held { path: String, holder: String },
    #[error("acquiring lock {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Write bytes to `path` through a uniquely named temp file and an atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ArchivedBatch {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed copies of every consumed scrape batch.
#[derive(Debug, Clone)]
pub struct RawArchive {
    root: PathBuf,
}

impl RawArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn relative_path(captured_at: DateTime<Utc>, asin: &str, content_hash: &str) -> PathBuf {
        let stamp = captured_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(asin)
            .join(format!("{content_hash}.json"))
    }

    pub async fn archive(
        &self,
        captured_at: DateTime<Utc>,
        asin: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedBatch> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path(captured_at, asin, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes).await?;
        }

        Ok(ArchivedBatch {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Exclusive per-collection run lock. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(dir: &Path) -> Result<Self, LockError> {
        let path = dir.join(LOCK_FILE);
        let io_err = |source| LockError::Io {
            path: path.display().to_string(),
            source,
        };
        std::fs::create_dir_all(dir).map_err(io_err)?;

        match std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write;
                let holder = serde_json::json!({
                    "pid": std::process::id(),
                    "acquired_at": Utc::now(),
                });
                file.write_all(holder.to_string().as_bytes())
                    .map_err(io_err)?;
                debug!(lock = %path.display(), "run lock acquired");
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path).unwrap_or_default();
                Err(LockError::Held {
                    path: path.display().to_string(),
                    holder,
                })
            }
            Err(err) => Err(io_err(err)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}

/// Row kept verbatim because it could not be decoded into a typed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantinedRow {
    pub line: String,
    pub reason: String,
}

/// Review identifiers and latest review date already on file for one ASIN.
///
/// This is the query surface handed to the scraper for early pagination stops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KnownReviews {
    pub asin: String,
    #[serde(rename = "known_review_ids")]
    ids: BTreeSet<String>,
    latest_review_date: Option<NaiveDate>,
}

impl KnownReviews {
    pub fn new(asin: &str) -> Self {
        Self {
            asin: asin.to_string(),
            ..Default::default()
        }
    }

    pub fn has_seen(&self, review_id: &str) -> bool {
        self.ids.contains(review_id)
    }

    pub fn latest_review_date(&self) -> Option<NaiveDate> {
        self.latest_review_date
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Returns `true` when the identifier was not known before.
    pub fn remember(&mut self, review_id: &str, review_date: Option<NaiveDate>) -> bool {
        if let Some(date) = review_date {
            self.latest_review_date = self.latest_review_date.max(Some(date));
        }
        self.ids.insert(review_id.to_string())
    }

    /// A page with no review newer than the latest stored date ends pagination.
    /// With nothing on file there is no cut-off.
    pub fn should_stop_by_date(&self, page_dates: &[Option<NaiveDate>]) -> bool {
        match self.latest_review_date {
            None => false,
            Some(latest) => !page_dates.iter().flatten().any(|d| *d > latest),
        }
    }

    /// A page made only of known identifiers ends pagination.
    pub fn should_stop_no_new(&self, page_ids: &[&str]) -> bool {
        page_ids.iter().all(|id| self.has_seen(id))
    }
}

/// In-memory copy of a collection's durable tables.
#[derive(Debug, Clone, Default)]
pub struct RowTables {
    pub reviews: Vec<ReviewRecord>,
    pub snapshots: Vec<SnapshotRecord>,
    quarantined_reviews: BTreeMap<String, Vec<QuarantinedRow>>,
    quarantined_snapshots: BTreeMap<String, Vec<QuarantinedRow>>,
}

impl RowTables {
    pub fn known_reviews(&self, asin: &str) -> KnownReviews {
        let mut known = KnownReviews::new(asin);
        for review in self.reviews.iter().filter(|r| r.asin == asin) {
            known.remember(&review.review_id, review.review_date);
        }
        known
    }

    pub fn asins(&self) -> BTreeSet<String> {
        self.reviews
            .iter()
            .map(|r| r.asin.clone())
            .chain(self.snapshots.iter().map(|s| s.asin.clone()))
            .collect()
    }

    pub fn quarantined_asins(&self) -> BTreeSet<String> {
        self.quarantined_reviews
            .keys()
            .chain(self.quarantined_snapshots.keys())
            .filter(|asin| *asin != UNATTRIBUTED)
            .cloned()
            .collect()
    }

    /// Quarantined lines that name no recognizable ASIN.
    pub fn unattributed_rows(&self) -> usize {
        self.quarantined_reviews
            .get(UNATTRIBUTED)
            .into_iter()
            .chain(self.quarantined_snapshots.get(UNATTRIBUTED))
            .map(Vec::len)
            .sum()
    }

    /// Why this ASIN's stored rows cannot be trusted for a merge, if they can't.
    pub fn integrity_issue(&self, asin: &str) -> Option<String> {
        let quarantined = self
            .quarantined_reviews
            .get(asin)
            .into_iter()
            .chain(self.quarantined_snapshots.get(asin))
            .flatten()
            .next();
        if let Some(row) = quarantined {
            return Some(format!("stored row could not be decoded: {}", row.reason));
        }

        let mut seen = HashSet::new();
        self.reviews
            .iter()
            .filter(|r| r.asin == asin)
            .find(|r| !seen.insert(r.review_id.as_str()))
            .map(|r| format!("review id {} is stored more than once", r.review_id))
    }
}

#[derive(Debug, Clone)]
pub struct RowStore {
    dir: PathBuf,
    collection_id: String,
}

impl RowStore {
    pub fn new(data_root: impl AsRef<Path>, collection_id: &str) -> Self {
        Self {
            dir: data_root.as_ref().join(collection_id),
            collection_id: collection_id.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    pub fn archive(&self) -> RawArchive {
        RawArchive::new(self.dir.join("raw"))
    }

    pub fn lock(&self) -> Result<RunLock, LockError> {
        RunLock::acquire(&self.dir)
    }

    pub async fn exists(&self) -> anyhow::Result<bool> {
        let path = self.path(COLLECTION_FILE);
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))
    }

    pub async fn create(&self, collection: &TrackedCollection) -> anyhow::Result<()> {
        if self.exists().await? {
            return Err(StoreError::CollectionExists(self.collection_id.clone()).into());
        }
        self.save_collection(collection).await?;
        info!(collection = %self.collection_id, dir = %self.dir.display(), "collection created");
        Ok(())
    }

    pub async fn load_collection(&self) -> anyhow::Result<TrackedCollection> {
        let path = self.path(COLLECTION_FILE);
        if !self.exists().await? {
            return Err(StoreError::CollectionMissing {
                id: self.collection_id.clone(),
                dir: self.dir.display().to_string(),
            }
            .into());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub async fn save_collection(&self, collection: &TrackedCollection) -> anyhow::Result<()> {
        let bytes =
            serde_json::to_vec_pretty(collection).context("serializing collection metadata")?;
        write_atomic(&self.path(COLLECTION_FILE), &bytes).await
    }

    pub async fn load_tables(&self) -> anyhow::Result<RowTables> {
        let (reviews, quarantined_reviews) =
            load_rows::<ReviewRecord>(&self.path(REVIEWS_FILE), &schema::REVIEWS).await?;
        let (snapshots, quarantined_snapshots) =
            load_rows::<SnapshotRecord>(&self.path(SNAPSHOTS_FILE), &schema::SNAPSHOTS).await?;
        for (asin, rows) in quarantined_reviews.iter().chain(&quarantined_snapshots) {
            if asin == UNATTRIBUTED {
                warn!(rows = rows.len(), "unreadable stored rows kept verbatim");
            } else {
                warn!(asin, rows = rows.len(), "stored rows quarantined");
            }
        }
        Ok(RowTables {
            reviews,
            snapshots,
            quarantined_reviews,
            quarantined_snapshots,
        })
    }

    /// Rewrites both tables. Quarantined rows are written back verbatim.
    ///
    /// Snapshots land before reviews: if the second rename never happens, the
    /// retry re-merges the reviews and skips the already stored snapshot, so
    /// the snapshot keeps the run's original counters.
    pub async fn save_tables(&self, tables: &RowTables) -> anyhow::Result<()> {
        let reviews = encode_rows(&tables.reviews, &tables.quarantined_reviews)?;
        let snapshots = encode_rows(&tables.snapshots, &tables.quarantined_snapshots)?;
        write_atomic(&self.path(SNAPSHOTS_FILE), &snapshots).await?;
        write_atomic(&self.path(REVIEWS_FILE), &reviews).await?;
        debug!(
            collection = %self.collection_id,
            reviews = tables.reviews.len(),
            snapshots = tables.snapshots.len(),
            "row store written"
        );
        Ok(())
    }
}

/// Collection ids under `data_root` that carry a `collection.json`, sorted.
pub async fn list_collections(data_root: &Path) -> anyhow::Result<Vec<String>> {
    if !fs::try_exists(data_root).await.unwrap_or(false) {
        return Ok(Vec::new());
    }
    let mut entries = fs::read_dir(data_root)
        .await
        .with_context(|| format!("reading {}", data_root.display()))?;
    let mut ids = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if fs::try_exists(entry.path().join(COLLECTION_FILE))
            .await
            .unwrap_or(false)
        {
            ids.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

type Quarantine = BTreeMap<String, Vec<QuarantinedRow>>;

/// Quarantine key for lines whose ASIN cannot be recovered.
const UNATTRIBUTED: &str = "";

/// Pulls a complete `"asin": "..."` value out of a line that is not valid JSON.
fn salvage_asin(line: &str) -> Option<String> {
    let rest = &line[line.find("\"asin\"")? + "\"asin\"".len()..];
    let rest = rest.trim_start().strip_prefix(':')?.trim_start().strip_prefix('"')?;
    let asin = &rest[..rest.find('"')?];
    (!asin.is_empty()).then(|| asin.to_string())
}

async fn load_rows<T: DeserializeOwned>(
    path: &Path,
    table: &schema::TableSchema,
) -> anyhow::Result<(Vec<T>, Quarantine)> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok((Vec::new(), BTreeMap::new()));
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;

    let mut rows = Vec::new();
    let mut quarantine: Quarantine = BTreeMap::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let object = match serde_json::from_str::<Map<String, Value>>(line) {
            Ok(object) => object,
            Err(err) => {
                let asin = salvage_asin(line).unwrap_or_default();
                warn!(
                    file = %path.display(),
                    line = idx + 1,
                    asin = %asin,
                    error = %err,
                    "unparseable stored row"
                );
                quarantine.entry(asin).or_default().push(QuarantinedRow {
                    line: line.to_string(),
                    reason: format!("line {}: {err}", idx + 1),
                });
                continue;
            }
        };
        let Some(asin) = object.get("asin").and_then(Value::as_str).map(str::to_string) else {
            warn!(file = %path.display(), line = idx + 1, "stored row has no asin");
            quarantine
                .entry(UNATTRIBUTED.to_string())
                .or_default()
                .push(QuarantinedRow {
                    line: line.to_string(),
                    reason: format!("line {}: row has no asin", idx + 1),
                });
            continue;
        };

        match schema::decode_row::<T>(object, table) {
            Ok(row) => rows.push(row),
            Err(reason) => quarantine.entry(asin).or_default().push(QuarantinedRow {
                line: line.to_string(),
                reason,
            }),
        }
    }
    Ok((rows, quarantine))
}

fn encode_rows<T: Serialize>(rows: &[T], quarantine: &Quarantine) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut out, row).context("serializing stored row")?;
        out.push(b'\n');
    }
    for row in quarantine.values().flatten() {
        out.extend_from_slice(row.line.as_bytes());
        out.push(b'\n');
    }
    Ok(out)
}
