use crate::page::{CodeBlock, Page};
use crate::record::KNOWN_CHANGE_TYPES;

/// System prompt for classifying one documentation page.
pub fn classification_prompt() -> String {
    format!(
        "You analyze API documentation pages for deprecations, removals and \
         behavior changes. Reply with a single JSON object with these keys: \
         target_api, package, language, deprecated_in, removed_in, replaced_by, \
         change_type, reason, source, confidence, evidence.\n\
         Rules:\n\
         - target_api is the fully qualified name of the one API the page is about \
         (for example numpy.ndarray.shape or _.chunk).\n\
         - Use empty strings for anything the page does not state. Never guess versions.\n\
         - change_type is one of: {}; join several with '/'. Empty when nothing changed.\n\
         - reason quotes or closely paraphrases the sentence stating the change.\n\
         - confidence is between 0 and 1 and reflects how sure you are about target_api.\n\
         - evidence is the shortest excerpt that supports target_api.",
        KNOWN_CHANGE_TYPES.join(", ")
    )
}

/// User message for [`classification_prompt`].
pub fn classification_context(
    url: &str,
    hint: Option<&str>,
    page: &Page,
    max_chars: usize,
) -> String {
    let mut out = format!("URL: {}\n", url);
    if let Some(hint) = hint.filter(|h| !h.is_empty()) {
        out.push_str(&format!("Likely API: {}\n", hint));
    }
    if !page.title.is_empty() {
        out.push_str(&format!("Title: {}\n", page.title));
    }
    let headings: Vec<&str> = page.headings.iter().take(15).map(|h| h.text.as_str()).collect();
    if !headings.is_empty() {
        out.push_str(&format!("Headings: {}\n", headings.join(" | ")));
    }
    if let Some(anchor) = &page.anchor_text {
        out.push_str("\nTargeted section:\n");
        out.push_str(&truncate(anchor, max_chars / 2));
        out.push('\n');
    }
    out.push_str("\nPage text:\n");
    out.push_str(&truncate(&page.text, max_chars));
    out
}

/// System prompt for choosing which code blocks illustrate an API.
pub fn example_selection_prompt() -> &'static str {
    "You pick code examples from documentation. Given an API name and numbered \
     code blocks, reply with a JSON object \
     {\"relevant_examples\": [{\"block_index\": <int>, \"is_relevant\": <bool>, \
     \"confidence\": <0..1>}]}. A block is relevant only when it calls or \
     demonstrates the named API. Blocks that merely import modules are not relevant."
}

pub fn example_selection_context(api: &str, url: &str, blocks: &[CodeBlock], max_chars: usize) -> String {
    let mut out = format!("API: {}\nURL: {}\n", api, url);
    let per_block = (max_chars / blocks.len().max(1)).max(200);
    for block in blocks {
        out.push_str(&format!("\n[block {}]\n", block.index));
        if !block.description.is_empty() {
            out.push_str(&format!("Description: {}\n", truncate(&block.description, 200)));
        }
        out.push_str(&truncate(&block.code, per_block));
        out.push('\n');
    }
    out
}

/// System prompt for splitting the chosen blocks into standalone examples.
pub fn example_split_prompt() -> &'static str {
    "You split documentation code into standalone examples for one API. Reply \
     with a JSON object {\"examples\": [{\"code\": <string>, \"output\": <string>}]}. \
     Every example must use the named API and keep the original formatting; \
     include the imports it needs. output holds printed results, return values \
     or error messages, and is an empty string when there are none. Skip \
     snippets that only import modules."
}

pub fn example_split_context(api: &str, blocks: &[CodeBlock], max_chars: usize) -> String {
    let mut out = format!("API: {}\n", api);
    let per_block = (max_chars / blocks.len().max(1)).max(200);
    for block in blocks {
        out.push_str("\n```\n");
        out.push_str(&truncate(&block.code, per_block));
        out.push_str("\n```\n");
    }
    out
}

/// Cut to at most `max_chars` characters on a char boundary.
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
