use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t\u{a0}]+").unwrap());
static ANY_SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static TITLE_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").unwrap());
static BODY_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());
static HEADING_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1, h2, h3, h4, h5, h6").unwrap());
static ID_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("[id]").unwrap());
static PRE_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("pre").unwrap());

/// Elements whose text never counts as page content.
const SKIPPED: &[&str] = &[
    "script", "style", "nav", "footer", "header", "noscript", "svg", "button", "form",
];

const BLOCKS: &[&str] = &[
    "p", "div", "section", "article", "main", "li", "ul", "ol", "dl", "dt", "dd", "pre", "table",
    "tr", "td", "th", "h1", "h2", "h3", "h4", "h5", "h6", "br", "blockquote", "aside",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heading {
    pub level: u8,
    pub text: String,
    pub id: String,
}

/// A `<pre>` block with the nearest descriptive text before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub index: usize,
    pub code: String,
    pub description: String,
}

/// Owned view of a fetched documentation page.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub url: String,
    pub title: String,
    pub headings: Vec<Heading>,
    /// Visible text, one block per line.
    pub text: String,
    /// Text of the element the URL fragment points at, when it exists.
    pub anchor_text: Option<String>,
    pub code_blocks: Vec<CodeBlock>,
}

impl Page {
    /// Parse raw content. Anything that does not look like markup is kept as
    /// plain text.
    pub fn parse(url: &str, content: &str) -> Page {
        if !looks_like_html(content) {
            return Page {
                url: url.to_string(),
                text: normalize(content),
                ..Default::default()
            };
        }

        let doc = Html::parse_document(content);
        let fragment = url::Url::parse(url)
            .ok()
            .and_then(|u| u.fragment().map(|f| f.to_string()))
            .filter(|f| !f.is_empty());

        let title = doc
            .select(&TITLE_SEL)
            .next()
            .map(|t| collapse(&t.text().collect::<String>()))
            .unwrap_or_default();

        let headings = doc
            .select(&HEADING_SEL)
            .map(|h| Heading {
                level: heading_level(h.value().name()).unwrap_or(6),
                text: collapse(&h.text().collect::<String>()).trim_end_matches('¶').trim().to_string(),
                id: h.value().id().unwrap_or_default().to_string(),
            })
            .collect();

        let mut raw = String::new();
        match doc.select(&BODY_SEL).next() {
            Some(body) => collect_text(body, &mut raw),
            None => collect_text(doc.root_element(), &mut raw),
        }

        let anchor_text = fragment
            .as_deref()
            .and_then(|f| anchor_section(&doc, f))
            .filter(|t| !t.is_empty());

        Page {
            url: url.to_string(),
            title,
            headings,
            text: normalize(&raw),
            anchor_text,
            code_blocks: code_blocks(&doc),
        }
    }

    /// Text to analyze: the anchored section when present, else the whole page.
    pub fn focus_text(&self) -> &str {
        self.anchor_text.as_deref().unwrap_or(&self.text)
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

fn looks_like_html(content: &str) -> bool {
    let head: String = content.chars().take(2048).collect::<String>().to_ascii_lowercase();
    head.contains("<html") || head.contains("<!doctype") || head.contains("<body") || head.contains("<div")
        || head.contains("<p>") || head.contains("<pre")
}

fn heading_level(name: &str) -> Option<u8> {
    let rest = name.strip_prefix('h')?;
    rest.parse().ok().filter(|l| (1..=6).contains(l))
}

fn collect_text(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            // Source line breaks are not text breaks outside <pre>
            out.extend(text.chars().map(|c| if c == '\n' || c == '\r' { ' ' } else { c }));
        } else if let Some(child_el) = ElementRef::wrap(child) {
            let name = child_el.value().name();
            if SKIPPED.contains(&name) {
                continue;
            }
            if name == "pre" {
                out.push('\n');
                out.push_str(&child_el.text().collect::<String>());
                out.push('\n');
                continue;
            }
            let block = BLOCKS.contains(&name);
            if block {
                out.push('\n');
            }
            collect_text(child_el, out);
            if block {
                out.push('\n');
            }
        }
    }
}

fn collapse(s: &str) -> String {
    ANY_SPACE_RE.replace_all(s.trim(), " ").into_owned()
}

/// One trimmed, whitespace-collapsed line per block, blank lines dropped.
fn normalize(raw: &str) -> String {
    raw.lines()
        .map(|l| WHITESPACE_RE.replace_all(l.trim(), " ").into_owned())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Text belonging to the element with the given id.
///
/// Definition terms take their whole definition list. Headings take the
/// siblings up to the next heading of the same or higher rank.
fn anchor_section(doc: &Html, fragment: &str) -> Option<String> {
    let target = doc
        .select(&ID_SEL)
        .find(|el| el.value().id() == Some(fragment))?;

    let mut raw = String::new();
    let name = target.value().name();
    if name == "dt" {
        let parent = target.parent().and_then(ElementRef::wrap).unwrap_or(target);
        collect_text(parent, &mut raw);
    } else if let Some(level) = heading_level(name) {
        collect_text(target, &mut raw);
        raw.push('\n');
        for sibling in target.next_siblings() {
            if let Some(text) = sibling.value().as_text() {
                raw.push_str(&text.replace(['\n', '\r'], " "));
                continue;
            }
            let Some(el) = ElementRef::wrap(sibling) else {
                continue;
            };
            if heading_level(el.value().name()).is_some_and(|l| l <= level) {
                break;
            }
            if SKIPPED.contains(&el.value().name()) {
                continue;
            }
            collect_text(el, &mut raw);
            raw.push('\n');
        }
    } else {
        collect_text(target, &mut raw);
    }
    Some(normalize(&raw))
}

fn code_blocks(doc: &Html) -> Vec<CodeBlock> {
    doc.select(&PRE_SEL)
        .filter_map(|pre| {
            let code = pre.text().collect::<String>();
            let code = code.trim_matches('\n').trim_end();
            if code.trim().is_empty() {
                return None;
            }
            Some((code.to_string(), describe(pre)))
        })
        .enumerate()
        .map(|(index, (code, description))| CodeBlock {
            index,
            code,
            description,
        })
        .collect()
}

/// Nearest preceding prose for a code block, looking through up to two
/// wrapper levels (`div.highlight` and friends).
fn describe(pre: ElementRef<'_>) -> String {
    let mut node = pre;
    for _ in 0..3 {
        for sibling in node.prev_siblings().filter_map(ElementRef::wrap).take(5) {
            if sibling.value().name() == "pre" {
                continue;
            }
            let text = collapse(&sibling.text().collect::<String>());
            if text.len() > 10 && !text.starts_with("Example") && !text.starts_with("Code") {
                return text.chars().take(300).collect();
            }
        }
        match node.parent().and_then(ElementRef::wrap) {
            Some(parent) => node = parent,
            None => break,
        }
    }
    String::new()
}
