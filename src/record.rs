use serde::{Deserialize, Serialize};

/// Anything persisted per input row. The row number is the join key across stages.
pub trait Keyed {
    fn row_number(&self) -> u64;
}

/// One API change observation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(alias = "original_row_num")]
    pub original_row_number: u64,
    #[serde(alias = "url")]
    pub source_url: String,
    #[serde(default)]
    pub crawl_time: String,
    #[serde(rename = "api", alias = "api_identifier", default)]
    pub api_identifier: String,
    #[serde(rename = "package", alias = "package_name", default)]
    pub package_name: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub deprecated_in: String,
    #[serde(default)]
    pub removed_in: String,
    #[serde(default)]
    pub replaced_by: String,
    #[serde(default)]
    pub change_type: String,
    #[serde(default)]
    pub reason: String,
    #[serde(rename = "source", alias = "source_link", default)]
    pub source_link: String,
    #[serde(default)]
    pub extraction_method: String,
}

impl Keyed for ChangeRecord {
    fn row_number(&self) -> u64 {
        self.original_row_number
    }
}

impl ChangeRecord {
    pub fn new(original_row_number: u64, source_url: &str) -> Self {
        ChangeRecord {
            original_row_number,
            source_url: source_url.to_string(),
            source_link: source_url.to_string(),
            crawl_time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            ..Default::default()
        }
    }

    /// True when at least one of the version/replacement fields carries a value.
    pub fn has_signal(&self) -> bool {
        [&self.deprecated_in, &self.removed_in, &self.replaced_by]
            .iter()
            .any(|v| !v.trim().is_empty())
    }

    /// True when any field the model could still fill is empty.
    pub fn has_gaps(&self) -> bool {
        [
            &self.deprecated_in,
            &self.removed_in,
            &self.replaced_by,
            &self.change_type,
            &self.reason,
            &self.package_name,
            &self.language,
        ]
        .iter()
        .any(|v| v.trim().is_empty())
    }

    /// Fill every empty field from `other`. Non-empty fields are left alone,
    /// so a merge can never delete information.
    pub fn fill_from(&mut self, other: &ChangeRecord) {
        fill(&mut self.api_identifier, &other.api_identifier);
        fill(&mut self.package_name, &other.package_name);
        fill(&mut self.language, &other.language);
        fill(&mut self.deprecated_in, &other.deprecated_in);
        fill(&mut self.removed_in, &other.removed_in);
        fill(&mut self.replaced_by, &other.replaced_by);
        fill(&mut self.change_type, &other.change_type);
        fill(&mut self.reason, &other.reason);
        fill(&mut self.source_link, &other.source_link);
    }
}

fn fill(slot: &mut String, value: &str) {
    if slot.trim().is_empty() && !value.trim().is_empty() {
        *slot = value.trim().to_string();
    }
}

// ── change_type vocabulary ──

pub const API_DEPRECATION: &str = "API Deprecation";
pub const API_DOCUMENTATION: &str = "API Documentation";
pub const BEHAVIOR_CHANGE: &str = "Behavior Change";
pub const PARAMETER_CHANGE: &str = "Parameter Change";
pub const API_REMOVAL: &str = "API Removal";
pub const API_USAGE_DISCOURAGED: &str = "API Usage Discouraged";
pub const API_ADDITION: &str = "API Addition";

pub const KNOWN_CHANGE_TYPES: &[&str] = &[
    API_DEPRECATION,
    API_DOCUMENTATION,
    BEHAVIOR_CHANGE,
    PARAMETER_CHANGE,
    API_REMOVAL,
    API_USAGE_DISCOURAGED,
    "Method Deprecation",
    "Class Deprecation",
    "Interface Deprecation",
    "Package Deprecation",
    "Constructor Deprecation",
    "Function Deprecation",
    "Setting Deprecation",
    "Security Enhancement",
    "Security Deprecation",
    "Configuration Removal",
    API_ADDITION,
];

/// A `change_type` is recognized when every `/`-joined part is in the vocabulary.
/// Empty means "no change type" and counts as recognized.
pub fn is_recognized_change_type(value: &str) -> bool {
    let value = value.trim();
    if value.is_empty() {
        return true;
    }
    value.split('/').all(|part| {
        let part = part.trim();
        KNOWN_CHANGE_TYPES.iter().any(|k| k.eq_ignore_ascii_case(part))
    })
}

/// Join change types into the compound form, skipping duplicates.
pub fn compound_change_type(parts: &[&str]) -> String {
    let mut seen: Vec<&str> = Vec::new();
    for p in parts {
        if !p.is_empty() && !seen.contains(p) {
            seen.push(p);
        }
    }
    seen.join("/")
}

// ── Examples ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeExample {
    pub code: String,
    pub output: Option<String>,
    pub extraction_method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleEntry {
    pub code: String,
    pub output: String,
}

impl From<&CodeExample> for ExampleEntry {
    fn from(e: &CodeExample) -> Self {
        ExampleEntry {
            code: e.code.clone(),
            output: e.output.clone().unwrap_or_default(),
        }
    }
}

/// Final per-record document of the examples stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleDocument {
    pub original_row_number: u64,
    pub source_url: String,
    pub api: String,
    pub package: String,
    pub change_type: String,
    pub reason: String,
    pub has_examples: bool,
    pub examples: Vec<ExampleEntry>,
    pub examples_count: usize,
    pub extraction_method: String,
    #[serde(default)]
    pub total_blocks_found: usize,
    #[serde(default)]
    pub relevant_blocks_found: usize,
}

impl Keyed for ExampleDocument {
    fn row_number(&self) -> u64 {
        self.original_row_number
    }
}

impl ExampleDocument {
    pub fn new(record: &ChangeRecord, extraction_method: &str, examples: &[CodeExample]) -> Self {
        let entries: Vec<ExampleEntry> = examples.iter().map(ExampleEntry::from).collect();
        ExampleDocument {
            original_row_number: record.original_row_number,
            source_url: record.source_url.clone(),
            api: record.api_identifier.clone(),
            package: record.package_name.clone(),
            change_type: record.change_type.clone(),
            reason: record.reason.clone(),
            has_examples: !entries.is_empty(),
            examples_count: entries.len(),
            examples: entries,
            extraction_method: extraction_method.to_string(),
            total_blocks_found: 0,
            relevant_blocks_found: 0,
        }
    }
}
