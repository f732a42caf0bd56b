use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::record::{ExampleDocument, ExampleEntry};

const SAMPLE_SIZE: usize = 5;
const SAMPLE_EXAMPLES: usize = 2;

/// One documented record, trimmed for the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExampleSample {
    pub source_url: String,
    pub api: String,
    pub examples_count: usize,
    pub extraction_method: String,
    pub total_blocks_found: usize,
    pub relevant_blocks_found: usize,
    pub examples: Vec<ExampleEntry>,
}

/// Totals over the final example documents of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExamplesReport {
    pub total_sources: usize,
    pub with_examples: usize,
    pub without_examples: usize,
    pub total_examples: usize,
    pub total_blocks_found: usize,
    pub relevant_blocks_found: usize,
    /// Documents per extraction method.
    pub methods: BTreeMap<String, usize>,
    /// The first few documents that have examples.
    pub samples: Vec<ExampleSample>,
}

impl ExamplesReport {
    pub fn from_documents(docs: &[ExampleDocument]) -> Self {
        let mut report = ExamplesReport {
            total_sources: docs.len(),
            ..Default::default()
        };
        for doc in docs {
            if doc.has_examples {
                report.with_examples += 1;
                report.total_examples += doc.examples_count;
                if report.samples.len() < SAMPLE_SIZE {
                    report.samples.push(ExampleSample {
                        source_url: doc.source_url.clone(),
                        api: doc.api.clone(),
                        examples_count: doc.examples_count,
                        extraction_method: doc.extraction_method.clone(),
                        total_blocks_found: doc.total_blocks_found,
                        relevant_blocks_found: doc.relevant_blocks_found,
                        examples: doc.examples.iter().take(SAMPLE_EXAMPLES).cloned().collect(),
                    });
                }
            } else {
                report.without_examples += 1;
            }
            report.total_blocks_found += doc.total_blocks_found;
            report.relevant_blocks_found += doc.relevant_blocks_found;
            *report.methods.entry(doc.extraction_method.clone()).or_default() += 1;
        }
        report
    }

    pub fn print(&self) {
        println!("\nExamples summary");
        println!("  Sources:              {}", self.total_sources);
        println!("  With examples:        {}", self.with_examples);
        println!("  Without examples:     {}", self.without_examples);
        println!("  Code blocks found:    {}", self.total_blocks_found);
        println!("  Relevant blocks:      {}", self.relevant_blocks_found);
        println!("  Examples extracted:   {}", self.total_examples);
        if !self.methods.is_empty() {
            println!("  By method:");
            for (method, n) in &self.methods {
                println!("    {:<22} {}", method, n);
            }
        }
    }

    /// Write the report as pretty JSON with a generation timestamp.
    pub fn save(&self, path: &Path) -> Result<()> {
        #[derive(Serialize)]
        struct Saved<'a> {
            generated_at: String,
            statistics: &'a ExamplesReport,
        }
        let saved = Saved {
            generated_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            statistics: self,
        };
        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        let mut w = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut w, &saved)?;
        w.flush()?;
        Ok(())
    }
}

/// Report path kept next to the examples output, e.g. `examples.json` → `examples.report.json`.
pub fn report_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "examples".into());
    output.with_file_name(format!("{}.report.json", stem))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ChangeRecord, CodeExample};

    fn doc(row: u64, method: &str, examples: usize, total: usize, relevant: usize) -> ExampleDocument {
        let mut record = ChangeRecord::new(row, &format!("https://lodash.com/docs#f{}", row));
        record.api_identifier = format!("_.f{}", row);
        let examples: Vec<CodeExample> = (0..examples)
            .map(|i| CodeExample {
                code: format!("_.f{}({})", row, i),
                output: None,
                extraction_method: method.to_string(),
            })
            .collect();
        let mut d = ExampleDocument::new(&record, method, &examples);
        d.total_blocks_found = total;
        d.relevant_blocks_found = relevant;
        d
    }

    #[test]
    fn totals_and_samples() {
        let docs = vec![
            doc(2, "llm-assisted", 3, 4, 2),
            doc(3, "no-code-blocks", 0, 0, 0),
            doc(4, "heuristic", 1, 2, 1),
            doc(5, "crawl-failed", 0, 0, 0),
        ];
        let r = ExamplesReport::from_documents(&docs);
        assert_eq!(r.total_sources, 4);
        assert_eq!(r.with_examples, 2);
        assert_eq!(r.without_examples, 2);
        assert_eq!(r.total_examples, 4);
        assert_eq!(r.total_blocks_found, 6);
        assert_eq!(r.relevant_blocks_found, 3);
        assert_eq!(r.methods.get("crawl-failed"), Some(&1));
        assert_eq!(r.methods.len(), 4);
        assert_eq!(r.samples.len(), 2);
        assert_eq!(r.samples[0].examples.len(), SAMPLE_EXAMPLES);
        assert_eq!(r.samples[1].api, "_.f4");
    }

    #[test]
    fn saved_next_to_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = report_path(&dir.path().join("examples.json"));
        assert_eq!(path.file_name().unwrap(), "examples.report.json");

        ExamplesReport::from_documents(&[doc(2, "heuristic", 1, 1, 1)]).save(&path).unwrap();
        let saved: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["statistics"]["with_examples"], 1);
        assert_eq!(saved["statistics"]["methods"]["heuristic"], 1);
        assert!(saved["generated_at"].is_string());
    }
}
