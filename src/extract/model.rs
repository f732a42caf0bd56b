use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use super::{FieldExtractor, HeuristicExtractor, UrlContext};
use crate::errors::{ExtractionError, RowError};
use crate::llm::{Classification, Classifier};
use crate::page::Page;
use crate::prompts;
use crate::record::{is_recognized_change_type, ChangeRecord};
use crate::resolve::{ApiMatch, NameResolver};

/// Enrichment extractor: deterministic strategies first, the model only when
/// none of them is confident enough or the record still has gaps.
pub struct LlmExtractor {
    classifier: Arc<dyn Classifier>,
    resolver: NameResolver,
    heuristic: HeuristicExtractor,
    threshold: f64,
    max_content_chars: usize,
}

impl LlmExtractor {
    pub fn new(classifier: Arc<dyn Classifier>, threshold: f64, max_content_chars: usize) -> Self {
        LlmExtractor {
            classifier,
            resolver: NameResolver::with_title(),
            heuristic: HeuristicExtractor::default(),
            threshold,
            max_content_chars,
        }
    }

    async fn ask(&self, page: &Page, url: &str, hint: Option<&str>) -> Result<Classification, RowError> {
        let context = prompts::classification_context(url, hint, page, self.max_content_chars);
        let value = self
            .classifier
            .classify(&prompts::classification_prompt(), &context)
            .await?;
        Ok(Classification::from_value(value)?)
    }
}

#[async_trait]
impl FieldExtractor for LlmExtractor {
    async fn extract(&self, page: &Page, ctx: &UrlContext<'_>) -> Result<ChangeRecord, RowError> {
        if page.is_empty() {
            return Err(ExtractionError::EmptyContent.into());
        }
        let url = Url::parse(ctx.url)
            .map_err(|e| ExtractionError::Malformed(format!("{}: {}", ctx.url, e)))?;

        let mut record = match ctx.existing {
            Some(existing) => existing.clone(),
            None => ChangeRecord::new(ctx.row_number, ctx.url),
        };

        let best = self.resolver.resolve(&url, Some(page));
        let confident = self.resolver.resolve_confident(&url, Some(page), self.threshold);

        match confident {
            Some(ApiMatch { name, method, .. }) => {
                if record.api_identifier.trim().is_empty() {
                    record.api_identifier = name.clone();
                }
                self.heuristic.fill_signals(&mut record, page, &url, &name);
                let mut tag = method.to_string();
                if record.has_gaps() {
                    let c = self.ask(page, ctx.url, Some(&name)).await?;
                    record.fill_from(&as_record(&c));
                    tag.push_str("+model");
                }
                record.extraction_method = tag;
            }
            None => {
                let hint = best.as_ref().map(|m| m.name.as_str());
                let c = self.ask(page, ctx.url, hint).await?;
                let accepted = c.confidence >= self.threshold;
                debug!(
                    "Row {}: model named {:?} with confidence {:.2}",
                    ctx.row_number, c.target_api, c.confidence
                );
                if !c.target_api.is_empty() && (accepted || record.api_identifier.trim().is_empty()) {
                    record.api_identifier = c.target_api.clone();
                }
                if record.api_identifier.trim().is_empty() {
                    match best {
                        Some(m) => record.api_identifier = m.name,
                        None => return Err(ExtractionError::NoApiName(ctx.url.to_string()).into()),
                    }
                }
                record.fill_from(&as_record(&c));
                let api = record.api_identifier.clone();
                self.heuristic.fill_signals(&mut record, page, &url, &api);
                record.extraction_method = if accepted { "model" } else { "fallback" }.to_string();
            }
        }

        if !is_recognized_change_type(&record.change_type) {
            debug!(
                "Row {}: unrecognized change_type {:?}",
                ctx.row_number, record.change_type
            );
        }
        Ok(record)
    }
}

fn as_record(c: &Classification) -> ChangeRecord {
    ChangeRecord {
        api_identifier: c.target_api.clone(),
        package_name: c.package.clone(),
        language: c.language.clone(),
        deprecated_in: c.deprecated_in.clone(),
        removed_in: c.removed_in.clone(),
        replaced_by: c.replaced_by.clone(),
        change_type: c.change_type.clone(),
        reason: c.reason.clone(),
        source_link: if c.source.starts_with("http") { c.source.clone() } else { String::new() },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ServiceError;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Canned {
        reply: Result<Value, ServiceError>,
        calls: AtomicUsize,
    }

    impl Canned {
        fn new(reply: Result<Value, ServiceError>) -> Arc<Self> {
            Arc::new(Canned { reply, calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl Classifier for Canned {
        async fn classify(&self, _prompt: &str, _context: &str) -> Result<Value, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    fn page(url: &str, body: &str) -> Page {
        Page::parse(url, &format!("<html><head><title>Docs</title></head><body><p>{}</p></body></html>", body))
    }

    #[tokio::test]
    async fn confident_fragment_skips_model_when_complete() {
        let canned = Canned::new(Ok(json!({})));
        let ex = LlmExtractor::new(canned.clone(), 0.7, 4000);
        let url = "https://docs.python.org/3/library/os.html#os.getcwdu";
        let p = page(url, "Deprecated since version 3.0: Use os.getcwd() instead.");

        let mut existing = ChangeRecord::new(7, url);
        existing.package_name = "python".into();
        existing.language = "Python".into();
        existing.removed_in = "3.0".into();
        let ctx = UrlContext { row_number: 7, url, existing: Some(&existing) };

        let r = ex.extract(&p, &ctx).await.unwrap();
        assert_eq!(canned.calls.load(Ordering::SeqCst), 0);
        assert_eq!(r.api_identifier, "os.getcwdu");
        assert_eq!(r.deprecated_in, "3.0");
        assert_eq!(r.replaced_by, "os.getcwd()");
        assert_eq!(r.extraction_method, "fragment");
    }

    #[tokio::test]
    async fn low_confidence_url_asks_model() {
        let canned = Canned::new(Ok(json!({
            "target_api": "parse_url",
            "package": "urllib",
            "deprecated_in": "3.9",
            "confidence": 0.95
        })));
        let ex = LlmExtractor::new(canned.clone(), 0.7, 4000);
        let url = "https://example.com/docs/?function=parse_url";
        let p = page(url, "A helper for URLs.");
        let ctx = UrlContext { row_number: 3, url, existing: None };

        let r = ex.extract(&p, &ctx).await.unwrap();
        assert_eq!(canned.calls.load(Ordering::SeqCst), 1);
        assert_eq!(r.api_identifier, "parse_url");
        assert_eq!(r.deprecated_in, "3.9");
        assert_eq!(r.extraction_method, "model");
    }

    #[tokio::test]
    async fn unsure_model_is_fallback_and_never_clears() {
        let canned = Canned::new(Ok(json!({ "target_api": "maybe.this", "confidence": 0.2 })));
        let ex = LlmExtractor::new(canned, 0.7, 4000);
        let url = "https://example.com/docs/";
        let p = page(url, "Some text.");
        let mut existing = ChangeRecord::new(4, url);
        existing.api_identifier = "kept.name".into();
        existing.replaced_by = "other".into();
        let ctx = UrlContext { row_number: 4, url, existing: Some(&existing) };

        let r = ex.extract(&p, &ctx).await.unwrap();
        assert_eq!(r.api_identifier, "kept.name");
        assert_eq!(r.replaced_by, "other");
        assert_eq!(r.extraction_method, "fallback");
    }

    #[tokio::test]
    async fn service_errors_fail_the_row() {
        let canned = Canned::new(Err(ServiceError::Auth("401".into())));
        let ex = LlmExtractor::new(canned, 0.7, 4000);
        let url = "https://example.com/docs/";
        let p = page(url, "Some text.");
        let ctx = UrlContext { row_number: 5, url, existing: None };

        let err = ex.extract(&p, &ctx).await.unwrap_err();
        assert!(matches!(err, RowError::Service(ServiceError::Auth(_))));
    }
}
