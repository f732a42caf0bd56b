use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use super::{run_stage, CancelFlag, RowJob, StageOptions, StageReport};
use crate::checkpoint::{list_stages, CheckpointTracker};
use crate::code_examples::{
    extractor_for, is_import_only, report_path, select_by_keywords, ExamplesReport,
    METHOD_CRAWL_FAILED, METHOD_HEURISTIC, METHOD_LLM_ASSISTED,
};
use crate::config::Settings;
use crate::errors::{ExtractionError, RowError};
use crate::extract::{FieldExtractor, HeuristicExtractor, LlmExtractor, UrlContext};
use crate::fetcher::PageFetcher;
use crate::filter::{filter_records, FilterReport};
use crate::llm::{selected_blocks, split_examples, Classifier};
use crate::page::{CodeBlock, Page};
use crate::prompts;
use crate::record::{ChangeRecord, CodeExample, ExampleDocument};
use crate::store::{
    completed_json, finalize_records, journal_path, load_input_urls, write_json, CsvJournal,
    InputRow, JsonlJournal, RecordStore,
};

pub const CRAWL: &str = "crawl";
pub const ENRICH: &str = "enrich";
pub const EXAMPLES: &str = "examples";

pub const NO_CODE_BLOCKS: &str = "no-code-blocks";
pub const NO_RELEVANT_EXAMPLES: &str = "no-relevant-examples";

// ── Row jobs ──

/// Fetch a row's page and run a field extractor over it.
pub struct RecordJob {
    fetcher: Arc<dyn PageFetcher>,
    extractor: Arc<dyn FieldExtractor>,
    /// Previous-stage records, keyed by row, when re-extracting.
    existing: Option<Arc<BTreeMap<u64, ChangeRecord>>>,
}

#[async_trait]
impl RowJob for RecordJob {
    type Output = ChangeRecord;

    async fn run(&self, row: &InputRow) -> Result<ChangeRecord, RowError> {
        let fetched = self.fetcher.fetch(&row.url).await?;
        let page = Page::parse(&row.url, &fetched.content);
        let ctx = UrlContext {
            row_number: row.row_number,
            url: &row.url,
            existing: self.existing.as_ref().and_then(|m| m.get(&row.row_number)),
        };
        self.extractor.extract(&page, &ctx).await
    }
}

/// Attach code examples to one record.
pub struct ExamplesJob {
    fetcher: Arc<dyn PageFetcher>,
    classifier: Option<Arc<dyn Classifier>>,
    records: Arc<BTreeMap<u64, ChangeRecord>>,
    min_confidence: f64,
    max_content_chars: usize,
}

impl ExamplesJob {
    /// Relevant blocks and how they were chosen. A failed model call falls
    /// back to keyword matching.
    async fn select(&self, record: &ChangeRecord, page: &Page) -> (Vec<CodeBlock>, &'static str) {
        if let Some(classifier) = &self.classifier {
            let context = prompts::example_selection_context(
                &record.api_identifier,
                &record.source_url,
                &page.code_blocks,
                self.max_content_chars,
            );
            match classifier.classify(prompts::example_selection_prompt(), &context).await {
                Ok(value) => {
                    let picked = selected_blocks(&value, self.min_confidence);
                    let blocks = picked
                        .iter()
                        .filter_map(|i| page.code_blocks.iter().find(|b| b.index == *i))
                        .cloned()
                        .collect();
                    return (blocks, METHOD_LLM_ASSISTED);
                }
                Err(e) => warn!(
                    "Row {}: example selection failed, using keywords: {}",
                    record.original_row_number, e
                ),
            }
        }
        (
            select_by_keywords(&page.code_blocks, &record.api_identifier),
            METHOD_HEURISTIC,
        )
    }

    /// Examples split by the model, or `None` when there is no model, the call
    /// fails or nothing usable comes back.
    async fn split(&self, record: &ChangeRecord, blocks: &[CodeBlock]) -> Option<Vec<CodeExample>> {
        let classifier = self.classifier.as_ref()?;
        let row = record.original_row_number;
        let context =
            prompts::example_split_context(&record.api_identifier, blocks, self.max_content_chars);
        let reply = classifier.classify(prompts::example_split_prompt(), &context).await;
        let pairs = match reply.and_then(|value| split_examples(&value)) {
            Ok(pairs) => pairs,
            Err(e) => {
                warn!("Row {}: example split failed, splitting locally: {}", row, e);
                return None;
            }
        };
        let examples: Vec<CodeExample> = pairs
            .into_iter()
            .filter(|(code, _)| !is_import_only(code))
            .map(|(code, output)| CodeExample {
                code,
                output: (!output.is_empty()).then_some(output),
                extraction_method: METHOD_LLM_ASSISTED.to_string(),
            })
            .collect();
        if examples.is_empty() {
            warn!("Row {}: model returned no usable examples, splitting locally", row);
            return None;
        }
        Some(examples)
    }
}

#[async_trait]
impl RowJob for ExamplesJob {
    type Output = ExampleDocument;

    async fn run(&self, row: &InputRow) -> Result<ExampleDocument, RowError> {
        let record = self.records.get(&row.row_number).ok_or_else(|| {
            ExtractionError::Malformed(format!("row {} is not in the record store", row.row_number))
        })?;
        let fetched = self.fetcher.fetch(&row.url).await?;
        let page = Page::parse(&row.url, &fetched.content);
        let total = page.code_blocks.len();
        if total == 0 {
            return Ok(document(record, NO_CODE_BLOCKS, &[], 0, 0));
        }

        let (relevant, method) = self.select(record, &page).await;
        if relevant.is_empty() {
            return Ok(document(record, NO_RELEVANT_EXAMPLES, &[], total, 0));
        }

        if let Some(examples) = self.split(record, &relevant).await {
            return Ok(document(record, METHOD_LLM_ASSISTED, &examples, total, relevant.len()));
        }
        let examples: Vec<CodeExample> = extractor_for(&record.package_name)
            .extract_examples(record, &relevant)
            .map(|mut e| {
                e.extraction_method = method.to_string();
                e
            })
            .collect();
        Ok(document(record, method, &examples, total, relevant.len()))
    }
}

fn document(
    record: &ChangeRecord,
    method: &str,
    examples: &[CodeExample],
    total: usize,
    relevant: usize,
) -> ExampleDocument {
    let mut doc = ExampleDocument::new(record, method, examples);
    doc.total_blocks_found = total;
    doc.relevant_blocks_found = relevant;
    doc
}

// ── Stage drivers ──

/// Everything a stage needs besides its input and output paths.
pub struct StageContext<'a> {
    pub settings: &'a Settings,
    pub cancel: CancelFlag,
    pub show_progress: bool,
}

impl StageContext<'_> {
    fn options(&self) -> StageOptions {
        StageOptions::from_config(&self.settings.pipeline, self.show_progress)
    }

    /// Checkpoints are keyed by stage name and output path, so the same stage
    /// can run for several datasets side by side.
    fn tracker(&self, stage: &str, output: &Path) -> Result<CheckpointTracker> {
        CheckpointTracker::open(
            &self.settings.pipeline.checkpoint_db,
            &stage_key(stage, output),
            self.settings.pipeline.max_attempts,
        )
    }
}

pub fn stage_key(stage: &str, output: &Path) -> String {
    format!("{}:{}", stage, output.display())
}

/// First stage: input URLs → change records via the heuristic extractor.
pub async fn crawl(
    ctx: &StageContext<'_>,
    fetcher: Arc<dyn PageFetcher>,
    input: &Path,
    output: &Path,
) -> Result<StageReport> {
    let load = load_input_urls(input)?;
    let tracker = ctx.tracker(CRAWL, output)?;
    let added = tracker.register(&load.rows)?;
    info!("{} new rows registered", added);

    let job = Arc::new(RecordJob {
        fetcher,
        extractor: Arc::new(HeuristicExtractor::default()),
        existing: None,
    });
    let journal = journal_path(output, "csv");
    let mut sink = CsvJournal::<ChangeRecord>::open(&journal)?;
    let report = run_stage(job, &tracker, &mut sink, &ctx.options(), &ctx.cancel).await?;
    drop(sink);

    finalize_records(&journal, output, &tracker.completed_rows()?)?;
    Ok(report)
}

/// Drop records without any version or replacement signal.
pub fn filter(input: &Path, output: &Path) -> Result<FilterReport> {
    let store = RecordStore::load(input).with_context(|| format!("Failed to load {:?}", input))?;
    let (kept, report) = filter_records(&store);
    kept.save(output)?;
    info!("Filter kept {}/{} records -> {:?}", report.kept, report.input, output);
    Ok(report)
}

/// Re-extract every record with the model-backed extractor, filling gaps.
pub async fn enrich(
    ctx: &StageContext<'_>,
    fetcher: Arc<dyn PageFetcher>,
    classifier: Arc<dyn Classifier>,
    input: &Path,
    output: &Path,
) -> Result<StageReport> {
    let store = RecordStore::load(input).with_context(|| format!("Failed to load {:?}", input))?;
    let rows = rows_of(&store);
    let tracker = ctx.tracker(ENRICH, output)?;
    tracker.register(&rows)?;

    let extractor = LlmExtractor::new(
        classifier,
        ctx.settings.pipeline.confidence_threshold,
        ctx.settings.llm.max_content_chars,
    );
    let job = Arc::new(RecordJob {
        fetcher,
        extractor: Arc::new(extractor),
        existing: Some(Arc::new(store.into_map())),
    });
    let journal = journal_path(output, "csv");
    let mut sink = CsvJournal::<ChangeRecord>::open(&journal)?;
    let report = run_stage(job, &tracker, &mut sink, &ctx.options(), &ctx.cancel).await?;
    drop(sink);

    finalize_records(&journal, output, &tracker.completed_rows()?)?;
    Ok(report)
}

/// Final stage: one example document per record, written as a JSON array.
/// Rows whose page could not be fetched get a `crawl-failed` document. A
/// summary report is written next to the output.
pub async fn examples(
    ctx: &StageContext<'_>,
    fetcher: Arc<dyn PageFetcher>,
    classifier: Option<Arc<dyn Classifier>>,
    input: &Path,
    output: &Path,
) -> Result<(StageReport, ExamplesReport)> {
    let store = RecordStore::load(input).with_context(|| format!("Failed to load {:?}", input))?;
    let rows = rows_of(&store);
    let tracker = ctx.tracker(EXAMPLES, output)?;
    tracker.register(&rows)?;

    if classifier.is_none() {
        info!("No classifier configured; selecting example blocks by keyword");
    }
    let records = Arc::new(store.into_map());
    let job = Arc::new(ExamplesJob {
        fetcher,
        classifier,
        records: Arc::clone(&records),
        min_confidence: ctx.settings.pipeline.confidence_threshold,
        max_content_chars: ctx.settings.llm.max_content_chars,
    });
    let journal = journal_path(output, "jsonl");
    let mut sink = JsonlJournal::<ExampleDocument>::open(&journal)?;
    let report = run_stage(job, &tracker, &mut sink, &ctx.options(), &ctx.cancel).await?;
    drop(sink);

    let mut docs: BTreeMap<u64, ExampleDocument> =
        completed_json(&journal, &tracker.completed_rows()?)?;
    for failed in &report.summary.terminal {
        if let Some(record) = records.get(&failed.row_number) {
            docs.entry(failed.row_number)
                .or_insert_with(|| document(record, METHOD_CRAWL_FAILED, &[], 0, 0));
        }
    }
    let docs: Vec<ExampleDocument> = docs.into_values().collect();
    write_json(output, &docs)?;

    let summary = ExamplesReport::from_documents(&docs);
    let path = report_path(output);
    summary.save(&path)?;
    info!(
        "{}/{} records have code examples; report -> {:?}",
        summary.with_examples, summary.total_sources, path
    );
    Ok((report, summary))
}

fn rows_of(store: &RecordStore) -> Vec<InputRow> {
    store
        .iter()
        .map(|r| InputRow {
            row_number: r.original_row_number,
            url: r.source_url.clone(),
        })
        .collect()
}

// ── Operator commands ──

/// Print the checkpoint summary of every recorded stage.
pub fn print_stats(settings: &Settings) -> Result<()> {
    let db = &settings.pipeline.checkpoint_db;
    if !db.exists() {
        println!("No checkpoint database at {:?}", db);
        return Ok(());
    }
    let stages = list_stages(db)?;
    if stages.is_empty() {
        println!("No stages recorded in {:?}", db);
        return Ok(());
    }
    for stage in stages {
        let tracker = CheckpointTracker::open(db, &stage, settings.pipeline.max_attempts)?;
        let s = tracker.summary()?;
        println!(
            "{:<40} total {:>6}  done {:>6}  pending {:>6}  retryable {:>5}  failed {:>5}",
            stage,
            s.total,
            s.done,
            s.pending,
            s.retryable,
            s.terminal.len()
        );
    }
    Ok(())
}

/// Give failed rows a fresh attempt budget, for one stage key or all of them.
pub fn reset_failed(settings: &Settings, stage: Option<&str>) -> Result<usize> {
    let db = &settings.pipeline.checkpoint_db;
    let stages = match stage {
        Some(s) => vec![s.to_string()],
        None => list_stages(db)?,
    };
    let mut total = 0;
    for stage in stages {
        let tracker = CheckpointTracker::open(db, &stage, settings.pipeline.max_attempts)?;
        let n = tracker.reset_failed()?;
        info!("{}: {} failed rows reset to pending", stage, n);
        total += n;
    }
    Ok(total)
}
