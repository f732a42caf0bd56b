use super::{is_import_only, split_commented, ExampleExtractor, METHOD_HEURISTIC};
use crate::page::CodeBlock;
use crate::record::{ChangeRecord, CodeExample};

/// Default processor: interactive `>>>` sessions are split per prompt with the
/// printed result as output; other blocks split on `// =>` comments.
pub struct GenericBlockExtractor;

impl ExampleExtractor for GenericBlockExtractor {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn extract_examples<'a>(
        &'a self,
        _record: &'a ChangeRecord,
        blocks: &'a [CodeBlock],
    ) -> Box<dyn Iterator<Item = CodeExample> + 'a> {
        Box::new(
            blocks
                .iter()
                .flat_map(|block| {
                    if is_doctest(&block.code) {
                        split_doctest(&block.code)
                    } else {
                        split_commented(&block.code)
                    }
                })
                .filter(|(code, _)| !is_import_only(code))
                .map(|(code, output)| CodeExample {
                    code,
                    output,
                    extraction_method: METHOD_HEURISTIC.to_string(),
                }),
        )
    }
}

fn is_doctest(code: &str) -> bool {
    code.lines().any(|l| l.trim_start().starts_with(">>>"))
}

/// One example per `>>>` prompt; `...` lines continue it and unprompted
/// lines are its printed output.
fn split_doctest(code: &str) -> Vec<(String, Option<String>)> {
    let mut out = Vec::new();
    let mut current: Option<(Vec<String>, Vec<String>)> = None;

    for line in code.lines() {
        let trimmed = line.trim_start();
        if let Some(stmt) = prompt_body(trimmed, ">>>") {
            if let Some(done) = current.take() {
                out.push(finish(done));
            }
            current = Some((vec![stmt.to_string()], Vec::new()));
        } else if let Some(cont) = prompt_body(trimmed, "...") {
            if let Some((code, _)) = current.as_mut() {
                code.push(cont.to_string());
            }
        } else if let Some((_, output)) = current.as_mut() {
            if !line.trim().is_empty() {
                output.push(line.trim_end().to_string());
            }
        }
    }
    if let Some(done) = current.take() {
        out.push(finish(done));
    }
    out.retain(|(code, _)| !code.trim().is_empty());
    out
}

fn prompt_body<'a>(line: &'a str, prompt: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(prompt)?;
    if rest.is_empty() {
        return Some("");
    }
    rest.strip_prefix(' ')
}

fn finish((code, output): (Vec<String>, Vec<String>)) -> (String, Option<String>) {
    let output = (!output.is_empty()).then(|| output.join("\n"));
    (code.join("\n").trim_end().to_string(), output)
}
