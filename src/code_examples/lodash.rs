use regex::Regex;

use super::{is_import_only, short_name, split_commented, ExampleExtractor, METHOD_HEURISTIC};
use crate::page::CodeBlock;
use crate::record::{ChangeRecord, CodeExample};

const REQUIRE_LODASH: &str = "const _ = require('lodash');";

/// Lodash docs put several calls in one block, each followed by a
/// `// => result` comment. Every call becomes a runnable snippet.
pub struct LodashExtractor;

impl ExampleExtractor for LodashExtractor {
    fn name(&self) -> &'static str {
        "lodash"
    }

    fn extract_examples<'a>(
        &'a self,
        record: &'a ChangeRecord,
        blocks: &'a [CodeBlock],
    ) -> Box<dyn Iterator<Item = CodeExample> + 'a> {
        let short = short_name(&record.api_identifier);
        let call = Regex::new(&format!(r"(?:\b_|\blodash)\.{}\b", regex::escape(short))).ok();

        Box::new(
            blocks
                .iter()
                .flat_map(|block| split_commented(&block.code))
                .filter(|(code, _)| !is_import_only(code))
                .filter(move |(code, _)| match &call {
                    Some(re) if !short.is_empty() => re.is_match(code),
                    _ => true,
                })
                .map(|(code, output)| CodeExample {
                    code: with_require(&code),
                    output,
                    extraction_method: METHOD_HEURISTIC.to_string(),
                }),
        )
    }
}

fn with_require(code: &str) -> String {
    if code.contains("require(") || code.contains("import ") {
        code.to_string()
    } else {
        format!("{}\n{}", REQUIRE_LODASH, code)
    }
}
