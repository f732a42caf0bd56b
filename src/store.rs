use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::record::{ChangeRecord, Keyed};

// ── Input ──

/// One URL row of the first-stage input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRow {
    pub row_number: u64,
    pub url: String,
}

pub struct InputLoad {
    pub rows: Vec<InputRow>,
    pub blank: usize,
    pub duplicates: usize,
}

/// Read a CSV with a `url` column. Row numbers count the header as row 1.
pub fn load_input_urls(path: &Path) -> Result<InputLoad> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open input {:?}", path))?;

    let headers = reader.headers()?.clone();
    let Some(url_idx) = headers.iter().position(|h| h.trim() == "url") else {
        bail!("Input {:?} must have a 'url' column", path);
    };

    let mut rows = Vec::new();
    let mut seen = HashSet::new();
    let mut blank = 0;
    let mut duplicates = 0;

    for (i, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Malformed row {} in {:?}", i + 2, path))?;
        let row_number = i as u64 + 2;
        let url = record.get(url_idx).unwrap_or("").trim().to_string();
        if url.is_empty() {
            blank += 1;
            continue;
        }
        if !seen.insert(url.clone()) {
            duplicates += 1;
            warn!("Row {} repeats {} (keeping first occurrence)", row_number, url);
            continue;
        }
        rows.push(InputRow { row_number, url });
    }

    info!(
        "Loaded {} URLs from {:?} ({} blank, {} duplicate)",
        rows.len(),
        path,
        blank,
        duplicates
    );
    Ok(InputLoad {
        rows,
        blank,
        duplicates,
    })
}

// ── Record store ──

/// Snapshot of one stage's ChangeRecords, keyed and ordered by row number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordStore {
    records: BTreeMap<u64, ChangeRecord>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; a later record for the same row wins.
    pub fn upsert(&mut self, record: ChangeRecord) {
        self.records.insert(record.original_row_number, record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, row: u64) -> Option<&ChangeRecord> {
        self.records.get(&row)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.records.values()
    }

    pub fn row_numbers(&self) -> Vec<u64> {
        self.records.keys().copied().collect()
    }

    pub fn into_map(self) -> BTreeMap<u64, ChangeRecord> {
        self.records
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut store = RecordStore::new();
        for record in read_csv_rows::<ChangeRecord>(path)? {
            store.upsert(record);
        }
        Ok(store)
    }

    /// Write the snapshot ordered by row number. Written to a sibling temp
    /// file first, then renamed over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        let tmp = sibling(path, ".tmp");
        {
            let mut writer = csv::Writer::from_path(&tmp)
                .with_context(|| format!("Failed to create {:?}", tmp))?;
            for record in self.records.values() {
                writer.serialize(record)?;
            }
            if self.records.is_empty() {
                writer.write_record(CHANGE_RECORD_COLUMNS)?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;
        Ok(())
    }
}

impl FromIterator<ChangeRecord> for RecordStore {
    fn from_iter<I: IntoIterator<Item = ChangeRecord>>(iter: I) -> Self {
        let mut store = RecordStore::new();
        for r in iter {
            store.upsert(r);
        }
        store
    }
}

const CHANGE_RECORD_COLUMNS: &[&str] = &[
    "original_row_number",
    "source_url",
    "crawl_time",
    "api",
    "package",
    "language",
    "deprecated_in",
    "removed_in",
    "replaced_by",
    "change_type",
    "reason",
    "source",
    "extraction_method",
];

fn read_csv_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {:?}", path))?;
    let mut rows = Vec::new();
    for (i, row) in reader.deserialize().enumerate() {
        let row: T = row.with_context(|| format!("Malformed row {} in {:?}", i + 2, path))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Journal variant of `read_csv_rows`: unreadable rows are logged and skipped.
fn read_csv_rows_lenient<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {:?}", path))?;
    let mut rows = Vec::new();
    for (i, row) in reader.deserialize().enumerate() {
        match row {
            Ok(row) => rows.push(row),
            Err(e) => warn!("Skipping unreadable row {} in {:?}: {}", i + 2, path, e),
        }
    }
    Ok(rows)
}

/// Cut an interrupted CSV append back to the start of the torn record.
/// A record is whole when it ends in a newline outside any quoted field.
/// Returns whether anything, header included, is left in the file.
fn truncate_torn_record(path: &Path) -> Result<bool> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(_) => return Ok(false),
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes.as_slice());
    let mut record = csv::ByteRecord::new();
    let mut last_start = None;
    while reader
        .read_byte_record(&mut record)
        .with_context(|| format!("Failed to scan journal {:?}", path))?
    {
        last_start = record.position().map(|p| p.byte() as usize);
    }
    let Some(start) = last_start else {
        return Ok(false);
    };

    let tail = &bytes[start..];
    let quotes = tail.iter().filter(|&&b| b == b'"').count();
    if tail.ends_with(b"\n") && quotes % 2 == 0 {
        return Ok(true);
    }
    cut(path, start as u64, bytes.len())?;
    Ok(start > 0)
}

/// Line-based variant for JSON-lines journals: drop anything after the last newline.
fn truncate_torn_line(path: &Path) -> Result<()> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(_) => return Ok(()),
    };
    if bytes.is_empty() || bytes.last() == Some(&b'\n') {
        return Ok(());
    }
    let keep = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
    cut(path, keep as u64, bytes.len())
}

fn cut(path: &Path, keep: u64, len: usize) -> Result<()> {
    let f = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open journal {:?}", path))?;
    f.set_len(keep)?;
    warn!("Dropped {} bytes of a partial record at the end of {:?}", len as u64 - keep, path);
    Ok(())
}

// ── Journals ──

/// Destination for one stage's per-row outputs.
pub trait RowSink<T> {
    /// Persist one output; it must be flushed to the file before returning.
    fn append(&mut self, item: &T) -> Result<()>;
}

/// Append-only CSV journal. Each append is flushed before returning so the
/// checkpoint can be advanced right after.
pub struct CsvJournal<T> {
    path: PathBuf,
    writer: csv::Writer<File>,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned + Keyed> CsvJournal<T> {
    pub fn open(path: &Path) -> Result<Self> {
        ensure_parent(path)?;
        let existing = truncate_torn_record(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open journal {:?}", path))?;
        let writer = csv::WriterBuilder::new()
            .has_headers(!existing)
            .from_writer(file);
        Ok(CsvJournal {
            path: path.to_path_buf(),
            writer,
            _marker: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every journaled row, collapsing duplicates (last write wins).
    pub fn read_all(path: &Path) -> Result<BTreeMap<u64, T>> {
        let mut rows = BTreeMap::new();
        if !path.exists() {
            return Ok(rows);
        }
        for row in read_csv_rows_lenient::<T>(path)? {
            rows.insert(row.row_number(), row);
        }
        Ok(rows)
    }
}

impl<T: Serialize> RowSink<T> for CsvJournal<T> {
    fn append(&mut self, item: &T) -> Result<()> {
        self.writer.serialize(item)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Append-only JSON-lines journal, used for nested outputs.
pub struct JsonlJournal<T> {
    path: PathBuf,
    writer: BufWriter<File>,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned + Keyed> JsonlJournal<T> {
    pub fn open(path: &Path) -> Result<Self> {
        ensure_parent(path)?;
        truncate_torn_line(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open journal {:?}", path))?;
        Ok(JsonlJournal {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            _marker: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(path: &Path) -> Result<BTreeMap<u64, T>> {
        let mut rows = BTreeMap::new();
        if !path.exists() {
            return Ok(rows);
        }
        let reader = BufReader::new(File::open(path)?);
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(row) => {
                    rows.insert(row.row_number(), row);
                }
                // Only a hand-edited journal gets here; torn tails are cut on open.
                Err(e) => warn!("Skipping unreadable line {} in {:?}: {}", i + 1, path, e),
            }
        }
        Ok(rows)
    }
}

impl<T: Serialize> RowSink<T> for JsonlJournal<T> {
    fn append(&mut self, item: &T) -> Result<()> {
        serde_json::to_writer(&mut self.writer, item)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Journal path kept next to a stage output, e.g. `crawl.csv` → `crawl.journal.csv`.
pub fn journal_path(output: &Path, ext: &str) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".into());
    output.with_file_name(format!("{}.journal.{}", stem, ext))
}

/// Collapse the CSV journal into the stage's output snapshot, keeping only
/// rows in `done`. Later journal lines win over earlier ones.
pub fn finalize_records(journal: &Path, output: &Path, done: &HashSet<u64>) -> Result<RecordStore> {
    let rows = CsvJournal::<ChangeRecord>::read_all(journal)?;
    let store: RecordStore = rows
        .into_iter()
        .filter(|(row, _)| done.contains(row))
        .map(|(_, r)| r)
        .collect();
    store.save(output)?;
    info!("Wrote {} records to {:?}", store.len(), output);
    Ok(store)
}

/// Journaled documents whose row is in `done`, keyed by row. Later lines win.
pub fn completed_json<T: Serialize + DeserializeOwned + Keyed>(
    journal: &Path,
    done: &HashSet<u64>,
) -> Result<BTreeMap<u64, T>> {
    Ok(JsonlJournal::<T>::read_all(journal)?
        .into_iter()
        .filter(|(row, _)| done.contains(row))
        .collect())
}

/// Write documents as a pretty JSON array, replacing `output` atomically.
pub fn write_json<T: Serialize>(output: &Path, rows: &[T]) -> Result<()> {
    ensure_parent(output)?;
    let tmp = sibling(output, ".tmp");
    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut w, rows)?;
        w.flush()?;
    }
    fs::rename(&tmp, output).with_context(|| format!("Failed to replace {:?}", output))?;
    info!("Wrote {} documents to {:?}", rows.len(), output);
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }
    Ok(())
}
