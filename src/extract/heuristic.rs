use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use url::Url;

use super::{FieldExtractor, UrlContext};
use crate::errors::{ExtractionError, RowError};
use crate::page::Page;
use crate::record::{
    compound_change_type, ChangeRecord, API_ADDITION, API_DEPRECATION, API_REMOVAL,
    API_USAGE_DISCOURAGED, BEHAVIOR_CHANGE, PARAMETER_CHANGE,
};
use crate::resolve::{site_for, NameResolver};

const MAX_REASON_CHARS: usize = 300;

const NAME: &str = r"`?([A-Za-z_$][\w$]*(?:\.[A-Za-z_$][\w$]*)*(?:\(\))?)`?";

// ── Patterns ──

static DEPRECATED_IN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bdeprecated\s+(?:since|in|as\s+of|from)\s+(?:(?:version|release|v)\s*|[A-Za-z]+\s+)?(\d+(?:\.\d+)*)").unwrap()
});

static REMOVED_IN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:removed|dropped|deleted)\s+(?:in|since|as\s+of|from)\s+(?:(?:version|release|v)\s*|[A-Za-z]+\s+)?(\d+(?:\.\d+)*)").unwrap()
});

static REPLACEMENT_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        format!(r"(?i)\buse\s+{}\s+(?:instead|rather\s+than)\b", NAME),
        format!(r"(?i)\b(?:replaced|superseded)\s+(?:by|with)\s+{}", NAME),
        format!(r"(?i)\bin\s+favou?r\s+of\s+{}", NAME),
        format!(r"(?i)\busing\s+{}\s+is\s+(?:the\s+)?(?:preferred|recommended)", NAME),
        format!(r"(?i)\b{}\s+should\s+be\s+used\s+instead\b", NAME),
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static DISCOURAGED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:discouraged|not\s+recommended|should\s+not\s+be\s+used|avoid\s+using)\b").unwrap()
});
static DEPRECATED_WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:deprecated|deprecation|will\s+be\s+removed)\b").unwrap()
});
static REMOVED_WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:(?:has|have)\s+been\s+removed|(?:was|were)\s+removed|no\s+longer\s+(?:available|exists|supported))\b").unwrap()
});
static CHANGED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bchanged\s+in\s+(?:version\s+)?\d").unwrap());
static PARAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:parameter|argument|keyword|kwarg|option)s?\b").unwrap()
});
static ADDED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:new|added)\s+in\s+(?:version\s+)?\d").unwrap());

const STOPWORDS: &[&str] = &["the", "a", "an", "this", "that", "it", "its", "to", "them", "these"];

/// Change fields found in page text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSignals {
    pub deprecated_in: String,
    pub removed_in: String,
    pub replaced_by: String,
    pub change_type: String,
    pub reason: String,
}

impl ChangeSignals {
    fn is_empty(&self) -> bool {
        self.change_type.is_empty() && self.replaced_by.is_empty()
    }
}

#[derive(Default)]
struct Flags {
    deprecated: bool,
    discouraged: bool,
    removed: bool,
    changed: bool,
    parameter: bool,
    added: bool,
}

/// Scan text for change signals about `api`.
///
/// Sentences mentioning the API's last name segment (plus the sentence after
/// each) are scanned first; the whole text only when those carry nothing.
pub fn scan_signals(text: &str, api: &str) -> ChangeSignals {
    let all = sentences(text);
    let short = api.rsplit('.').next().unwrap_or(api).trim_end_matches("()");
    if !short.is_empty() {
        if let Ok(mention) = Regex::new(&format!(r"\b{}\b", regex::escape(short))) {
            let mut focused = Vec::new();
            for (i, s) in all.iter().enumerate() {
                if mention.is_match(s) {
                    for j in i..=(i + 1).min(all.len().saturating_sub(1)) {
                        if !focused.contains(&j) {
                            focused.push(j);
                        }
                    }
                }
            }
            let focused: Vec<&str> = focused.into_iter().map(|i| all[i]).collect();
            let signals = scan(&focused);
            if !signals.is_empty() {
                return signals;
            }
        }
    }
    scan(&all)
}

fn scan(sentences: &[&str]) -> ChangeSignals {
    let mut out = ChangeSignals::default();
    let mut flags = Flags::default();
    let mut reasons: Vec<&str> = Vec::new();

    for &sentence in sentences {
        let mut hit = false;

        if out.deprecated_in.is_empty() {
            if let Some(c) = DEPRECATED_IN_RE.captures(sentence) {
                out.deprecated_in = c[1].to_string();
                hit = true;
            }
        }
        if out.removed_in.is_empty() {
            if let Some(c) = REMOVED_IN_RE.captures(sentence) {
                out.removed_in = c[1].to_string();
                flags.removed = true;
                hit = true;
            }
        }
        if out.replaced_by.is_empty() {
            let found = REPLACEMENT_RES
                .iter()
                .filter_map(|re| re.captures(sentence))
                .map(|c| c[1].trim_end_matches('.').to_string())
                .find(|name| !STOPWORDS.contains(&name.to_ascii_lowercase().as_str()));
            if let Some(name) = found {
                out.replaced_by = name;
                hit = true;
            }
        }
        if DISCOURAGED_RE.is_match(sentence) {
            flags.discouraged = true;
            hit = true;
        }
        if DEPRECATED_WORD_RE.is_match(sentence) {
            flags.deprecated = true;
            hit = true;
        }
        if REMOVED_WORD_RE.is_match(sentence) {
            flags.removed = true;
            hit = true;
        }
        if CHANGED_RE.is_match(sentence) {
            flags.changed = true;
            flags.parameter |= PARAM_RE.is_match(sentence);
            hit = true;
        }
        if ADDED_RE.is_match(sentence) {
            flags.added = true;
            hit = true;
        }

        if hit && reasons.len() < 2 && !reasons.contains(&sentence) {
            reasons.push(sentence);
        }
    }

    out.change_type = change_type(&out, &flags);
    if !out.change_type.is_empty() || !out.replaced_by.is_empty() {
        out.reason = crate::prompts::truncate(&reasons.join(" "), MAX_REASON_CHARS);
    }
    out
}

/// An explicit deprecation version outranks "discouraged"; a bare
/// "deprecated" next to "discouraged" reads as a soft warning.
fn change_type(signals: &ChangeSignals, flags: &Flags) -> String {
    let deprecation =
        !signals.deprecated_in.is_empty() || (flags.deprecated && !flags.discouraged);
    let removal = !signals.removed_in.is_empty() || flags.removed;

    let mut types = Vec::new();
    if deprecation {
        types.push(API_DEPRECATION);
    }
    if removal {
        types.push(API_REMOVAL);
    }
    if types.is_empty() {
        if flags.discouraged || !signals.replaced_by.is_empty() {
            types.push(API_USAGE_DISCOURAGED);
        } else if flags.changed {
            types.push(if flags.parameter { PARAMETER_CHANGE } else { BEHAVIOR_CHANGE });
        } else if flags.added {
            types.push(API_ADDITION);
        }
    }
    compound_change_type(&types)
}

/// Split into sentences at `.`, `!` or `?` followed by whitespace. Lines are
/// never joined, so headings stay separate.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    for line in text.lines() {
        let mut start = 0;
        for (i, c) in line.char_indices() {
            if matches!(c, '.' | '!' | '?') {
                let next = line[i + 1..].chars().next();
                if next.map_or(true, char::is_whitespace) {
                    let s = line[start..=i].trim();
                    if !s.is_empty() {
                        out.push(s);
                    }
                    start = i + 1;
                }
            }
        }
        let rest = line[start..].trim();
        if !rest.is_empty() {
            out.push(rest);
        }
    }
    out
}

/// Best guess at the language of a page from its code blocks.
pub fn guess_language(page: &Page) -> &'static str {
    let code: String = page.code_blocks.iter().map(|b| b.code.as_str()).collect::<Vec<_>>().join("\n");
    if code.contains(">>>") || code.contains("import numpy") || code.contains("def ") {
        "Python"
    } else if code.contains("fn ") && code.contains("let ") {
        "Rust"
    } else if code.contains("func ") || code.contains(":=") {
        "Go"
    } else if code.contains("const ") || code.contains("=>") || code.contains("require(") {
        "JavaScript"
    } else {
        ""
    }
}

// ── Extractor ──

/// First-pass extractor: deterministic name resolution plus pattern scanning.
pub struct HeuristicExtractor {
    resolver: NameResolver,
}

impl Default for HeuristicExtractor {
    fn default() -> Self {
        HeuristicExtractor {
            resolver: NameResolver::with_title(),
        }
    }
}

impl HeuristicExtractor {
    pub fn extract_page(&self, page: &Page, ctx: &UrlContext<'_>) -> Result<ChangeRecord, ExtractionError> {
        if page.is_empty() {
            return Err(ExtractionError::EmptyContent);
        }
        let url = Url::parse(ctx.url).map_err(|e| ExtractionError::Malformed(format!("{}: {}", ctx.url, e)))?;
        let matched = self
            .resolver
            .resolve(&url, Some(page))
            .ok_or_else(|| ExtractionError::NoApiName(ctx.url.to_string()))?;

        let mut record = ChangeRecord::new(ctx.row_number, ctx.url);
        self.fill_signals(&mut record, page, &url, &matched.name);
        record.api_identifier = matched.name;
        record.extraction_method = format!("heuristic:{}", matched.method);
        Ok(record)
    }

    /// Fill package, language and change fields for a known API name.
    pub fn fill_signals(&self, record: &mut ChangeRecord, page: &Page, url: &Url, api: &str) {
        let mut found = ChangeRecord::default();
        match site_for(url) {
            Some(site) => {
                found.package_name = site.package.to_string();
                found.language = site.language.to_string();
            }
            None => found.language = guess_language(page).to_string(),
        }
        let signals = scan_signals(page.focus_text(), api);
        found.deprecated_in = signals.deprecated_in;
        found.removed_in = signals.removed_in;
        found.replaced_by = signals.replaced_by;
        found.change_type = signals.change_type;
        found.reason = signals.reason;
        record.fill_from(&found);
    }
}

#[async_trait]
impl FieldExtractor for HeuristicExtractor {
    async fn extract(&self, page: &Page, ctx: &UrlContext<'_>) -> Result<ChangeRecord, RowError> {
        Ok(self.extract_page(page, ctx)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discouraged_with_preferred_replacement() {
        let s = scan_signals(
            "ndarray.shape\nTuple of array dimensions.\nSetting arr.shape is discouraged and may be deprecated in the future. Using ndarray.reshape is the preferred approach.",
            "numpy.ndarray.shape",
        );
        assert_eq!(s.change_type, API_USAGE_DISCOURAGED);
        assert_eq!(s.replaced_by, "ndarray.reshape");
        assert!(s.deprecated_in.is_empty());
        assert!(s.reason.starts_with("Setting arr.shape is discouraged"));
        assert!(s.reason.contains("preferred approach"));
    }

    #[test]
    fn sphinx_deprecation_directive() {
        let s = scan_signals(
            "os.getcwdu()\nDeprecated since version 3.0: Use os.getcwd() instead.",
            "os.getcwdu",
        );
        assert_eq!(s.deprecated_in, "3.0");
        assert_eq!(s.replaced_by, "os.getcwd()");
        assert_eq!(s.change_type, API_DEPRECATION);
    }

    #[test]
    fn deprecation_and_removal_compound() {
        let s = scan_signals(
            "The foo function was deprecated in version 1.4 and will be removed in 2.0.",
            "pkg.foo",
        );
        assert_eq!(s.deprecated_in, "1.4");
        assert_eq!(s.removed_in, "2.0");
        assert_eq!(s.change_type, "API Deprecation/API Removal");
    }

    #[test]
    fn parameter_change() {
        let s = scan_signals("Changed in version 2.1: the axis parameter accepts tuples.", "pkg.sum");
        assert_eq!(s.change_type, PARAMETER_CHANGE);
        assert!(s.replaced_by.is_empty());
    }

    #[test]
    fn stopwords_are_not_replacements() {
        let s = scan_signals("This was superseded by the new module.", "x");
        assert!(s.replaced_by.is_empty());
    }

    #[test]
    fn quiet_page_has_no_signal() {
        let s = scan_signals("Return the sum of the array elements over a given axis.", "numpy.sum");
        assert_eq!(s, ChangeSignals::default());
    }

    #[test]
    fn unrelated_mentions_fall_back_to_whole_text() {
        let s = scan_signals(
            "chunk splits arrays.\nSee also: other helpers.\nDeprecated since 4.0.",
            "_.chunk",
        );
        assert_eq!(s.deprecated_in, "4.0");
    }

    #[test]
    fn extract_numpy_page() {
        let page = Page::parse(
            "https://numpy.org/doc/stable/reference/generated/numpy.ndarray.shape.html",
            "<html><body><p>Setting arr.shape is discouraged and may be deprecated in the future. Using ndarray.reshape is the preferred approach.</p></body></html>",
        );
        let ctx = UrlContext {
            row_number: 2,
            url: "https://numpy.org/doc/stable/reference/generated/numpy.ndarray.shape.html",
            existing: None,
        };
        let r = HeuristicExtractor::default().extract_page(&page, &ctx).unwrap();
        assert_eq!(r.api_identifier, "numpy.ndarray.shape");
        assert_eq!(r.package_name, "numpy");
        assert_eq!(r.language, "Python");
        assert_eq!(r.change_type, API_USAGE_DISCOURAGED);
        assert_eq!(r.extraction_method, "heuristic:path");
        assert!(r.has_signal());
    }

    #[test]
    fn empty_and_nameless_pages_fail() {
        let ex = HeuristicExtractor::default();
        let empty = Page::parse("https://x.dev/a", "<html><body></body></html>");
        let ctx = UrlContext { row_number: 2, url: "https://x.dev/a", existing: None };
        assert!(matches!(ex.extract_page(&empty, &ctx), Err(ExtractionError::EmptyContent)));

        let page = Page::parse("https://x.dev/", "<html><body><p>hello there</p></body></html>");
        let ctx = UrlContext { row_number: 3, url: "https://x.dev/", existing: None };
        assert!(matches!(ex.extract_page(&page, &ctx), Err(ExtractionError::NoApiName(_))));
    }
}
