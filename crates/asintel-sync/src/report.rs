use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::{RunKind, RunSummary};

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
pub const RUN_BRIEF_FILE: &str = "run_brief.md";

fn reports_root(collection_dir: &Path) -> PathBuf {
    collection_dir.join("reports")
}

/// Writes `reports/<run_id>/` and returns the summary with `reports_dir` set.
pub(crate) async fn write_run_reports(
    collection_dir: &Path,
    mut summary: RunSummary,
) -> Result<RunSummary> {
    let reports_dir = reports_root(collection_dir).join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    summary.reports_dir = reports_dir.display().to_string();

    fs::write(reports_dir.join(RUN_BRIEF_FILE), run_brief(&summary))
        .await
        .with_context(|| format!("writing {RUN_BRIEF_FILE}"))?;
    let json = serde_json::to_vec_pretty(&summary).context("serializing run summary")?;
    fs::write(reports_dir.join(RUN_SUMMARY_FILE), json)
        .await
        .with_context(|| format!("writing {RUN_SUMMARY_FILE}"))?;
    Ok(summary)
}

fn kind_label(kind: RunKind) -> &'static str {
    match kind {
        RunKind::Collect => "collect",
        RunKind::Analyze => "analyze",
    }
}

fn run_brief(summary: &RunSummary) -> String {
    let mut out = format!(
        "# asintel run brief\n\n- Run ID: `{}`\n- Kind: {}\n- Collection: {}\n- Started: {}\n- Finished: {}\n- Significance test: {}\n- Export: {} tables as {} in `{}`\n- Sentiment backfilled: {}\n",
        summary.run_id,
        kind_label(summary.kind),
        summary.collection_id,
        summary.started_at,
        summary.finished_at,
        summary.significance,
        summary.export.tables,
        summary.export.format.extension(),
        summary.export.dir,
        summary.sentiment_backfilled,
    );
    if summary.kind == RunKind::Collect {
        out.push_str(&format!(
            "- Batches archived: {}\n- ASINs registered: {}\n\n## ASINs\n",
            summary.archived_batches, summary.registered_asins
        ));
        if summary.asins.is_empty() {
            out.push_str("- inbox was empty\n");
        }
        for row in &summary.asins {
            let line = match &row.error {
                Some(err) => format!("- {}: skipped ({err})\n", row.asin),
                None => format!(
                    "- {}: {} new, {} duplicates skipped, {} snapshots, pages {}, stopped: {}\n",
                    row.asin,
                    row.new_reviews,
                    row.duplicates_skipped,
                    row.snapshots_written,
                    row.pages_visited
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    row.stopped_reason
                        .as_ref()
                        .map(|r| r.as_str())
                        .unwrap_or("-"),
                ),
            };
            out.push_str(&line);
        }
        if !summary.rejected_files.is_empty() {
            out.push_str("\n## Rejected files\n");
            for file in &summary.rejected_files {
                out.push_str(&format!("- `{}`: {}\n", file.path, file.error));
            }
        }
    }
    out
}

/// Markdown listing of the `runs` most recent run reports of a collection.
pub fn report_markdown(collection_dir: &Path, runs: usize) -> Result<String> {
    let root = reports_root(collection_dir);
    let mut summaries = Vec::new();
    if root.exists() {
        for entry in std::fs::read_dir(&root).with_context(|| format!("reading {}", root.display()))? {
            let path = entry?.path().join(RUN_SUMMARY_FILE);
            if !path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let summary: RunSummary = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            summaries.push(summary);
        }
    }
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    summaries.truncate(runs.max(1));

    let mut lines = vec!["# asintel reports".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for s in summaries {
        let new_reviews: u32 = s.asins.iter().map(|a| a.new_reviews).sum();
        let duplicates: u32 = s.asins.iter().map(|a| a.duplicates_skipped).sum();
        lines.push(format!("## Run `{}` ({})", s.run_id, kind_label(s.kind)));
        lines.push(format!("- started: {}", s.started_at));
        lines.push(format!("- asins merged: {}", s.asins.len() - s.skipped().count()));
        lines.push(format!("- new reviews: {new_reviews}"));
        lines.push(format!("- duplicates skipped: {duplicates}"));
        for skipped in s.skipped() {
            lines.push(format!(
                "- skipped {}: {}",
                skipped.asin,
                skipped.error.as_deref().unwrap_or_default()
            ));
        }
        lines.push(format!("- export: `{}` ({})", s.export.dir, s.export.format.extension()));
        lines.push(format!("- brief: `{}`", Path::new(&s.reports_dir).join(RUN_BRIEF_FILE).display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
