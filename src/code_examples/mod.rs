//! Code examples attached to change records.

mod generic;
mod lodash;
mod report;

pub use generic::GenericBlockExtractor;
pub use lodash::LodashExtractor;
pub use report::{report_path, ExampleSample, ExamplesReport};

use regex::Regex;

use crate::page::CodeBlock;
use crate::record::{ChangeRecord, CodeExample};

pub const METHOD_HEURISTIC: &str = "heuristic";
pub const METHOD_LLM_ASSISTED: &str = "llm-assisted";
pub const METHOD_CRAWL_FAILED: &str = "crawl-failed";

/// Turns the relevant code blocks of a page into examples.
///
/// The iterator is lazy and finite; every call starts over from the blocks.
pub trait ExampleExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract_examples<'a>(
        &'a self,
        record: &'a ChangeRecord,
        blocks: &'a [CodeBlock],
    ) -> Box<dyn Iterator<Item = CodeExample> + 'a>;
}

/// Processor for a package; anything without a dedicated one gets the generic extractor.
pub fn extractor_for(package: &str) -> Box<dyn ExampleExtractor> {
    match package.trim().to_ascii_lowercase().as_str() {
        "lodash" | "lodash-es" => Box::new(LodashExtractor),
        _ => Box::new(GenericBlockExtractor),
    }
}

/// Last segment of an API name, without the lodash `_.` prefix or call parens.
pub fn short_name(api: &str) -> &str {
    let api = api.trim().trim_end_matches("()");
    let api = api.strip_prefix("_.").unwrap_or(api);
    api.rsplit('.').next().unwrap_or(api)
}

/// Blocks that call or mention the API, by keyword.
pub fn select_by_keywords(blocks: &[CodeBlock], api: &str) -> Vec<CodeBlock> {
    let short = short_name(api);
    if short.is_empty() {
        return Vec::new();
    }
    let escaped = regex::escape(short);
    let Ok(usage) = Regex::new(&format!(r"(?:\.{0}\b|\b{0}\s*\()", escaped)) else {
        return Vec::new();
    };
    let Ok(mention) = Regex::new(&format!(r"\b{}\b", escaped)) else {
        return Vec::new();
    };

    blocks
        .iter()
        .filter(|b| !is_import_only(&b.code))
        .filter(|b| b.code.contains(api) || usage.is_match(&b.code) || mention.is_match(&b.description))
        .cloned()
        .collect()
}

/// True when every statement only imports or requires modules.
pub fn is_import_only(code: &str) -> bool {
    let mut saw_line = false;
    for line in code.lines() {
        let line = line.trim().trim_start_matches(">>>").trim();
        if line.is_empty()
            || (line.starts_with('#') && !line.starts_with("#include"))
            || line.starts_with("//")
        {
            continue;
        }
        saw_line = true;
        let import = line.starts_with("import ")
            || line.starts_with("from ")
            || line.starts_with("#include")
            || line.starts_with("use ")
            || (line.contains("require(") && (line.starts_with("const ") || line.starts_with("var ") || line.starts_with("let ")));
        if !import {
            return false;
        }
    }
    saw_line
}

/// Split a block into blank-line separated snippets, taking `// =>` or `# =>`
/// comment lines as the snippet's output.
pub(crate) fn split_commented(code: &str) -> Vec<(String, Option<String>)> {
    let mut out = Vec::new();
    let mut code_lines: Vec<&str> = Vec::new();
    let mut output_lines: Vec<&str> = Vec::new();

    for line in code.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            flush(&mut out, &mut code_lines, &mut output_lines);
            continue;
        }
        if let Some(value) = output_comment(trimmed) {
            output_lines.push(value);
        } else {
            if !output_lines.is_empty() {
                flush(&mut out, &mut code_lines, &mut output_lines);
            }
            code_lines.push(line.trim_end());
        }
    }
    flush(&mut out, &mut code_lines, &mut output_lines);
    out
}

fn flush(out: &mut Vec<(String, Option<String>)>, code_lines: &mut Vec<&str>, output_lines: &mut Vec<&str>) {
    if !code_lines.is_empty() {
        let output = (!output_lines.is_empty()).then(|| output_lines.join("\n"));
        out.push((code_lines.join("\n"), output));
    }
    code_lines.clear();
    output_lines.clear();
}

fn output_comment(line: &str) -> Option<&str> {
    for marker in ["// =>", "# =>", "//=>", "#=>"] {
        if let Some(rest) = line.strip_prefix(marker) {
            return Some(rest.trim());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(index: usize, code: &str, description: &str) -> CodeBlock {
        CodeBlock { index, code: code.into(), description: description.into() }
    }

    #[test]
    fn short_names() {
        assert_eq!(short_name("_.chunk"), "chunk");
        assert_eq!(short_name("numpy.ndarray.shape"), "shape");
        assert_eq!(short_name("useEffect()"), "useEffect");
    }

    #[test]
    fn keyword_selection() {
        let blocks = vec![
            block(0, "import numpy as np", ""),
            block(1, ">>> x = np.zeros((2, 3))\n>>> x.shape\n(2, 3)", ""),
            block(2, ">>> np.reshape(x, 6)", ""),
            block(3, "y = x", "Changing the shape in place"),
        ];
        let picked: Vec<usize> = select_by_keywords(&blocks, "numpy.ndarray.shape")
            .iter()
            .map(|b| b.index)
            .collect();
        assert_eq!(picked, vec![1, 3]);
    }

    #[test]
    fn import_detection() {
        assert!(is_import_only("import numpy as np\nfrom os import path"));
        assert!(is_import_only("const _ = require('lodash');"));
        assert!(!is_import_only("import numpy as np\nnp.zeros(3)"));
        assert!(!is_import_only(""));
    }

    #[test]
    fn commented_output_split() {
        let parts = split_commented("_.chunk(['a', 'b'], 1);\n// => [['a'], ['b']]\n\n_.chunk([]);\n// => []");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0, "_.chunk(['a', 'b'], 1);");
        assert_eq!(parts[0].1.as_deref(), Some("[['a'], ['b']]"));
        assert_eq!(parts[1].1.as_deref(), Some("[]"));

        let parts = split_commented("let a = 1;\nlet b = 2;");
        assert_eq!(parts, vec![("let a = 1;\nlet b = 2;".to_string(), None)]);
    }

    #[test]
    fn registry_by_package() {
        assert_eq!(extractor_for("lodash").name(), "lodash");
        assert_eq!(extractor_for("numpy").name(), "generic");
    }
}
