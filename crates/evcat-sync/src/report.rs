//! Per-run report files and parquet snapshots under `reports/<run_id>/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::builder::{ListBuilder, StringBuilder};
use arrow_array::{Float64Array, RecordBatch, StringArray, TimestampMillisecondArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use chrono::{DateTime, Utc};
use evcat_core::{CanonicalEvent, ReviewFlag};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

use crate::cycle::{CollectionReport, CycleRun, RecordDecision};
use crate::orchestrator::SourceStatus;

pub const REPORT_FILE: &str = "collection_report.json";
pub const SUMMARY_FILE: &str = "summary.md";
const SNAPSHOT_DIR: &str = "snapshots";
const SNAPSHOT_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDocument {
    pub report: CollectionReport,
    pub decisions: Vec<RecordDecision>,
    pub reviews: Vec<ReviewFlag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub dir: PathBuf,
    pub report: PathBuf,
    pub summary: PathBuf,
    pub manifest: PathBuf,
}

/// Write the report, the markdown summary and the snapshots for one run.
pub async fn write_run(reports_root: &Path, run: &CycleRun) -> Result<RunArtifacts> {
    let dir = reports_root.join(run.report.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let document = ReportDocument {
        report: run.report.clone(),
        decisions: run.decisions.clone(),
        reviews: run.reviews.clone(),
    };
    let report_path = dir.join(REPORT_FILE);
    let bytes = serde_json::to_vec_pretty(&document).context("serializing collection report")?;
    fs::write(&report_path, bytes)
        .await
        .with_context(|| format!("writing {}", report_path.display()))?;

    let summary_path = dir.join(SUMMARY_FILE);
    fs::write(&summary_path, summary_markdown(&run.report))
        .await
        .with_context(|| format!("writing {}", summary_path.display()))?;

    let manifest = export_snapshots(&dir, &run.events, &run.reviews).await?;
    info!(run_id = %run.report.run_id, dir = %dir.display(), "run report written");
    Ok(RunArtifacts {
        dir,
        report: report_path,
        summary: summary_path,
        manifest,
    })
}

pub fn summary_markdown(report: &CollectionReport) -> String {
    let mut lines = vec![
        "# Event Catalog Collection".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!("- Locations: {}", report.locations.join("; ")),
        format!("- Records fetched: {}", report.records_fetched),
        format!("- Canonical created: {}", report.canonical_created),
        format!("- Auto-merged: {}", report.auto_merged),
        format!("- Pending review: {}", report.pending_review),
        format!("- Unchanged: {}", report.unchanged),
        format!("- Persisted: {}", report.persisted),
        format!("- Enriched: {}", report.enriched),
        String::new(),
        "## Sources".to_string(),
    ];
    for outcome in &report.source_outcomes {
        let status = match &outcome.status {
            SourceStatus::Succeeded { records } => format!("{records} records"),
            SourceStatus::Failed { reason } => format!("failed ({reason})"),
        };
        lines.push(format!(
            "- {} @ {}: {} after {} attempt(s)",
            outcome.source, outcome.location, status, outcome.attempts
        ));
    }
    for name in &report.skipped_sources {
        lines.push(format!("- {name}: skipped (disabled)"));
    }
    if !report.source_failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failures".to_string());
        for failure in &report.source_failures {
            let error = failure
                .last_error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt completed".to_string());
            lines.push(format!(
                "- {} @ {}: {} ({error})",
                failure.source, failure.location, failure.reason
            ));
        }
    }
    if !report.persistence_failures.is_empty() {
        lines.push(String::new());
        lines.push("## Persistence failures".to_string());
        for failure in &report.persistence_failures {
            lines.push(format!("- `{}`: {}", failure.canonical_id, failure.error));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// One snapshot table, encoded off the async runtime.
struct SnapshotTable {
    name: &'static str,
    batch: RecordBatch,
}

async fn export_snapshots(
    run_dir: &Path,
    events: &[CanonicalEvent],
    reviews: &[ReviewFlag],
) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join(SNAPSHOT_DIR);
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let tables = vec![
        SnapshotTable {
            name: "canonical_events",
            batch: events_batch(events)?,
        },
        SnapshotTable {
            name: "event_sources",
            batch: sources_batch(events)?,
        },
        SnapshotTable {
            name: "review_flags",
            batch: reviews_batch(reviews)?,
        },
    ];
    let encoded = tokio::task::spawn_blocking(move || {
        tables
            .into_iter()
            .map(|table| {
                let bytes = encode_parquet(&table.batch)
                    .with_context(|| format!("encoding {} snapshot", table.name))?;
                Ok((table.name, table.batch.num_rows(), bytes))
            })
            .collect::<Result<Vec<_>>>()
    })
    .await
    .context("parquet encoder task failed")??;

    let mut files = Vec::with_capacity(encoded.len());
    for (name, rows, bytes) in encoded {
        let file_name = format!("{name}.parquet");
        let path = snapshot_dir.join(&file_name);
        fs::write(&path, &bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        files.push(ParquetManifestFile {
            name: name.to_string(),
            path: format!("{SNAPSHOT_DIR}/{file_name}"),
            sha256: hex::encode(Sha256::digest(&bytes)),
            bytes: bytes.len() as u64,
            rows,
        });
    }

    let manifest = ParquetManifest {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        files,
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None)?;
    writer.write(batch)?;
    writer.close()?;
    Ok(buffer)
}

fn utc_millis() -> DataType {
    DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into()))
}

fn timestamps(values: impl Iterator<Item = DateTime<Utc>>) -> TimestampMillisecondArray {
    TimestampMillisecondArray::from(values.map(|t| t.timestamp_millis()).collect::<Vec<_>>())
        .with_timezone("UTC")
}

fn events_batch(events: &[CanonicalEvent]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("canonical_id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("start_time", utc_millis(), false),
        ArrowField::new("city", DataType::Utf8, false),
        ArrowField::new("state", DataType::Utf8, true),
        ArrowField::new("venue", DataType::Utf8, true),
        ArrowField::new("category", DataType::Utf8, true),
        ArrowField::new("price", DataType::Utf8, true),
        ArrowField::new(
            "tags",
            DataType::List(Arc::new(ArrowField::new("item", DataType::Utf8, true))),
            false,
        ),
        ArrowField::new("source_count", DataType::UInt32, false),
        ArrowField::new("enrichment_confidence", DataType::Float64, true),
        ArrowField::new("updated_at", utc_millis(), false),
    ]));

    let mut tags = ListBuilder::new(StringBuilder::new());
    for event in events {
        for tag in &event.tags {
            tags.values().append_value(tag);
        }
        tags.append(true);
    }
    let states: Vec<Option<&str>> = events.iter().map(|e| e.location().state.as_deref()).collect();
    let venues: Vec<Option<&str>> = events.iter().map(|e| e.location().venue.as_deref()).collect();

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from_iter_values(events.iter().map(|e| e.canonical_id.to_string()))),
            Arc::new(StringArray::from_iter_values(events.iter().map(|e| e.title()))),
            Arc::new(timestamps(events.iter().map(|e| e.start()))),
            Arc::new(StringArray::from_iter_values(events.iter().map(|e| e.location().city.as_str()))),
            Arc::new(StringArray::from(states)),
            Arc::new(StringArray::from(venues)),
            Arc::new(StringArray::from(
                events.iter().map(|e| e.category.as_ref().map(|c| c.value.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                events.iter().map(|e| e.price.as_ref().map(|p| p.value.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(tags.finish()),
            Arc::new(UInt32Array::from_iter_values(
                events.iter().map(|e| u32::try_from(e.sources.len()).unwrap_or(u32::MAX)),
            )),
            Arc::new(Float64Array::from(events.iter().map(|e| e.enrichment_confidence).collect::<Vec<_>>())),
            Arc::new(timestamps(events.iter().map(|e| e.updated_at))),
        ],
    )
    .context("building canonical events record batch")
}

/// One row per provenance entry.
fn sources_batch(events: &[CanonicalEvent]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("canonical_id", DataType::Utf8, false),
        ArrowField::new("platform", DataType::Utf8, false),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("source_id", DataType::Utf8, true),
        ArrowField::new("scraped_at", utc_millis(), false),
    ]));

    let rows = events
        .iter()
        .flat_map(|e| e.sources.iter().map(move |p| (e.canonical_id, p)))
        .collect::<Vec<_>>();
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from_iter_values(rows.iter().map(|(id, _)| id.to_string()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|(_, p)| p.platform.as_str()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|(_, p)| p.url.as_str()))),
            Arc::new(StringArray::from(rows.iter().map(|(_, p)| p.source_id.as_deref()).collect::<Vec<_>>())),
            Arc::new(timestamps(rows.iter().map(|(_, p)| p.scraped_at))),
        ],
    )
    .context("building event sources record batch")
}

fn reviews_batch(reviews: &[ReviewFlag]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("canonical_id", DataType::Utf8, false),
        ArrowField::new("candidate_id", DataType::Utf8, false),
        ArrowField::new("score", DataType::Float64, false),
        ArrowField::new("flagged_at", utc_millis(), false),
    ]));

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from_iter_values(reviews.iter().map(|r| r.canonical_id.to_string()))),
            Arc::new(StringArray::from_iter_values(reviews.iter().map(|r| r.candidate_id.to_string()))),
            Arc::new(Float64Array::from_iter_values(reviews.iter().map(|r| r.score))),
            Arc::new(timestamps(reviews.iter().map(|r| r.flagged_at))),
        ],
    )
    .context("building review flags record batch")
}

/// Markdown digest of the `runs` most recent reports under `reports_root`, newest first.
pub fn report_markdown(reports_root: &Path, runs: usize) -> Result<String> {
    let entries = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();

    let mut documents = Vec::new();
    for entry in entries {
        let path = entry.path().join(REPORT_FILE);
        if !path.exists() {
            continue;
        }
        let document: ReportDocument = serde_json::from_str(
            &std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?;
        documents.push((entry.path(), document));
    }
    documents.sort_by(|a, b| b.1.report.started_at.cmp(&a.1.report.started_at));

    let mut lines = vec!["# Event Catalog Runs".to_string(), String::new()];
    if documents.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for (dir, document) in documents.into_iter().take(runs.max(1)) {
        let report = &document.report;
        lines.push(format!("## Run `{}`", report.run_id));
        lines.push(format!("- started: {}", report.started_at));
        lines.push(format!("- records fetched: {}", report.records_fetched));
        lines.push(format!(
            "- created / merged / review / unchanged: {} / {} / {} / {}",
            report.canonical_created, report.auto_merged, report.pending_review, report.unchanged
        ));
        lines.push(format!("- source failures: {}", report.source_failures.len()));
        let manifest = dir.join(SNAPSHOT_DIR).join("manifest.json");
        if manifest.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::PersistenceFailure;
    use crate::orchestrator::{FailureReason, SourceOutcome, SourcePartialFailure};
    use chrono::{TimeZone, Utc};
    use evcat_core::{EventLocation, RawEventRecord, SourceError, SourceProvenance};
    use uuid::Uuid;

    fn run(started_hour: u32) -> CycleRun {
        let at = Utc.with_ymd_and_hms(2025, 10, 20, started_hour, 0, 0).unwrap();
        let record = RawEventRecord {
            title: "Jazz Night".into(),
            description: String::new(),
            start_time: at,
            end_time: None,
            location: EventLocation::new("Chicago", "US"),
            price: Some("Free".into()),
            category: None,
            tags: vec!["music".into()],
            provenance: SourceProvenance {
                platform: "fixture".into(),
                url: format!("https://fixture.test/{started_hour}"),
                scraped_at: at,
                source_id: None,
            },
        };
        let event = CanonicalEvent::from_record(&record, 0.5, at);
        CycleRun {
            report: CollectionReport {
                run_id: Uuid::new_v4(),
                started_at: at,
                finished_at: at,
                locations: vec!["Chicago, US".into()],
                records_fetched: 1,
                canonical_created: 1,
                auto_merged: 0,
                pending_review: 0,
                unchanged: 0,
                source_failures: vec![SourcePartialFailure {
                    source: "down".into(),
                    location: "Chicago, US".into(),
                    reason: FailureReason::RetriesExhausted,
                    class: None,
                    attempts: 3,
                    last_error: Some(SourceError::network("refused")),
                }],
                source_outcomes: vec![SourceOutcome {
                    source: "fixture".into(),
                    location: "Chicago, US".into(),
                    attempts: 2,
                    status: SourceStatus::Succeeded { records: 1 },
                }],
                skipped_sources: vec!["off".into()],
                persisted: 1,
                persistence_failures: vec![PersistenceFailure {
                    canonical_id: Uuid::nil(),
                    error: "disk full".into(),
                }],
                review_flags: 0,
                enriched: 0,
                enrichment_failures: 0,
            },
            events: vec![event],
            reviews: Vec::new(),
            decisions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn writes_report_summary_and_hashed_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let run = run(18);
        let artifacts = write_run(dir.path(), &run).await.unwrap();

        let summary = std::fs::read_to_string(&artifacts.summary).unwrap();
        assert!(summary.contains("- fixture @ Chicago, US: 1 records after 2 attempt(s)"));
        assert!(summary.contains("- off: skipped (disabled)"));
        assert!(summary.contains("retries exhausted"));
        assert!(summary.contains("disk full"));

        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&artifacts.manifest).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 3);
        for file in &manifest.files {
            let bytes = std::fs::read(artifacts.dir.join(&file.path)).unwrap();
            assert_eq!(file.sha256, hex::encode(Sha256::digest(&bytes)));
            assert_eq!(file.bytes, bytes.len() as u64);
        }
        assert_eq!(manifest.files[0].rows, 1);
        assert_eq!(manifest.files[0].path, "snapshots/canonical_events.parquet");
        assert_eq!(manifest.files[2].rows, 0);
    }

    #[tokio::test]
    async fn event_snapshot_keeps_typed_columns() {
        use arrow_array::cast::AsArray;
        use arrow_array::types::TimestampMillisecondType;
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

        let dir = tempfile::tempdir().unwrap();
        let run = run(18);
        let artifacts = write_run(dir.path(), &run).await.unwrap();
        let file = std::fs::File::open(artifacts.dir.join("snapshots/canonical_events.parquet")).unwrap();
        let batch = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap()
            .next()
            .unwrap()
            .unwrap();

        assert_eq!(batch.num_rows(), 1);
        let starts = batch
            .column_by_name("start_time")
            .unwrap()
            .as_primitive::<TimestampMillisecondType>();
        assert_eq!(starts.value(0), run.events[0].start().timestamp_millis());
        let tags = batch.column_by_name("tags").unwrap().as_list::<i32>();
        assert_eq!(tags.value(0).as_string::<i32>().value(0), "music");
    }

    #[tokio::test]
    async fn report_markdown_lists_newest_runs_first() {
        let dir = tempfile::tempdir().unwrap();
        let older = run(6);
        let newer = run(18);
        write_run(dir.path(), &older).await.unwrap();
        write_run(dir.path(), &newer).await.unwrap();

        let markdown = report_markdown(dir.path(), 5).unwrap();
        let newer_at = markdown.find(&newer.report.run_id.to_string()).unwrap();
        let older_at = markdown.find(&older.report.run_id.to_string()).unwrap();
        assert!(newer_at < older_at);

        let latest_only = report_markdown(dir.path(), 1).unwrap();
        assert!(!latest_only.contains(&older.report.run_id.to_string()));
    }
}
