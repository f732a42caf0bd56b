use crate::record::ChangeRecord;
use crate::store::RecordStore;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

const SAMPLE_SIZE: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterReport {
    pub input: usize,
    pub kept: usize,
    pub removed: usize,
    pub deprecated_in: usize,
    pub removed_in: usize,
    pub replaced_by: usize,
    /// A few dropped records, as `(row, api)`.
    pub removed_sample: Vec<(u64, String)>,
}

impl FilterReport {
    pub fn print(&self) {
        println!("\nFilter summary");
        println!("  Input records:   {}", self.input);
        println!("  Kept:            {}", self.kept);
        println!("  Removed:         {}", self.removed);
        println!("  Non-empty deprecated_in: {}", self.deprecated_in);
        println!("  Non-empty removed_in:    {}", self.removed_in);
        println!("  Non-empty replaced_by:   {}", self.replaced_by);
        if !self.removed_sample.is_empty() {
            println!("  Removed (sample):");
            for (row, api) in &self.removed_sample {
                println!("    row {}: {}", row, if api.is_empty() { "<no api>" } else { api });
            }
        }
    }
}

#[cfg(feature = "rayon")]
fn keep_mask(records: &[&ChangeRecord]) -> Vec<bool> {
    records.par_iter().map(|r| r.has_signal()).collect()
}

#[cfg(not(feature = "rayon"))]
fn keep_mask(records: &[&ChangeRecord]) -> Vec<bool> {
    records.iter().map(|r| r.has_signal()).collect()
}

/// Keep a record iff one of `deprecated_in`, `removed_in`, `replaced_by`
/// is non-empty after trimming. The input store is left untouched.
pub fn filter_records(store: &RecordStore) -> (RecordStore, FilterReport) {
    let records: Vec<&ChangeRecord> = store.iter().collect();
    let mask = keep_mask(&records);

    let mut report = FilterReport {
        input: records.len(),
        ..Default::default()
    };
    let mut kept = RecordStore::new();
    for (record, keep) in records.into_iter().zip(mask) {
        if keep {
            if !record.deprecated_in.trim().is_empty() {
                report.deprecated_in += 1;
            }
            if !record.removed_in.trim().is_empty() {
                report.removed_in += 1;
            }
            if !record.replaced_by.trim().is_empty() {
                report.replaced_by += 1;
            }
            kept.upsert(record.clone());
        } else if report.removed_sample.len() < SAMPLE_SIZE {
            report
                .removed_sample
                .push((record.original_row_number, record.api_identifier.clone()));
        }
    }
    report.kept = kept.len();
    report.removed = report.input - report.kept;
    (kept, report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(row: u64, deprecated: &str, removed: &str, replaced: &str) -> ChangeRecord {
        let mut r = ChangeRecord::new(row, &format!("https://x.dev/{}", row));
        r.api_identifier = format!("api{}", row);
        r.deprecated_in = deprecated.into();
        r.removed_in = removed.into();
        r.replaced_by = replaced.into();
        r
    }

    fn sample() -> RecordStore {
        vec![
            record(2, "1.0", "", ""),
            record(3, "", "", ""),
            record(4, "", "2.0", "b"),
            record(5, "  ", "\t", ""),
            record(6, "", "", "new_api"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn keeps_only_records_with_signal() {
        let (kept, report) = filter_records(&sample());
        assert_eq!(kept.row_numbers(), vec![2, 4, 6]);
        assert_eq!(report.input, 5);
        assert_eq!(report.kept, 3);
        assert_eq!(report.removed, 2);
        assert_eq!(report.deprecated_in, 1);
        assert_eq!(report.removed_in, 1);
        assert_eq!(report.replaced_by, 2);
        assert_eq!(report.removed_sample, vec![(3, "api3".to_string()), (5, "api5".to_string())]);
    }

    #[test]
    fn filtering_is_idempotent() {
        let (once, _) = filter_records(&sample());
        let (twice, report) = filter_records(&once);
        assert_eq!(once.row_numbers(), twice.row_numbers());
        assert_eq!(report.removed, 0);
        for row in once.row_numbers() {
            assert_eq!(once.get(row), twice.get(row));
        }
    }

    #[test]
    fn empty_store() {
        let (kept, report) = filter_records(&RecordStore::new());
        assert!(kept.is_empty());
        assert_eq!(report, FilterReport::default());
    }
}
