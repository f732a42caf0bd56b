use std::path::Path;

use anyhow::{Context, Result};
use quick_xml::events::Event;
use regex::Regex;
use tracing::{info, warn};

use crate::fetcher::PageFetcher;

/// Nested sitemap indexes are followed this many levels deep.
const MAX_INDEX_DEPTH: usize = 2;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Sitemap {
    /// `<url><loc>` entries of a urlset.
    pub pages: Vec<String>,
    /// `<sitemap><loc>` entries of a sitemapindex.
    pub children: Vec<String>,
}

impl Sitemap {
    fn push(&mut self, page: bool, loc: &str) {
        if loc.is_empty() {
            return;
        }
        if page {
            self.pages.push(loc.to_string());
        } else {
            self.children.push(loc.to_string());
        }
    }
}

/// Parse a `urlset` or `sitemapindex` document.
pub fn parse_sitemap(xml: &str) -> Result<Sitemap> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut out = Sitemap::default();
    let mut in_url = false;
    let mut in_sitemap = false;
    let mut in_loc = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"url" => in_url = true,
                b"sitemap" => in_sitemap = true,
                b"loc" if in_url || in_sitemap => in_loc = true,
                _ => {}
            },
            Ok(Event::Text(e)) if in_loc => {
                out.push(in_url, e.unescape()?.trim());
            }
            Ok(Event::CData(e)) if in_loc => {
                out.push(in_url, String::from_utf8_lossy(&e).trim());
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"loc" => in_loc = false,
                b"url" => in_url = false,
                b"sitemap" => in_sitemap = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Fetch a sitemap (following indexes) and return page URLs matching `pattern`,
/// deduplicated in document order.
pub async fn collect_urls(
    fetcher: &dyn PageFetcher,
    sitemap_url: &str,
    pattern: Option<&str>,
) -> Result<Vec<String>> {
    let re = pattern.map(Regex::new).transpose().context("Invalid URL pattern")?;

    let mut queue = vec![(sitemap_url.to_string(), 0usize)];
    let mut all = Vec::new();
    while let Some((url, depth)) = queue.pop() {
        info!("Fetching sitemap: {}", url);
        let page = match fetcher.fetch(&url).await {
            Ok(p) => p,
            Err(e) if depth > 0 => {
                warn!("Skipping child sitemap: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let sitemap = parse_sitemap(&page.content)
            .with_context(|| format!("Failed to parse sitemap {}", url))?;
        all.extend(sitemap.pages);
        if depth < MAX_INDEX_DEPTH {
            // Reverse so children are visited in document order
            queue.extend(sitemap.children.into_iter().rev().map(|c| (c, depth + 1)));
        } else if !sitemap.children.is_empty() {
            warn!("Ignoring {} nested sitemaps below {}", sitemap.children.len(), url);
        }
    }
    info!("Total URLs in sitemap: {}", all.len());

    let filtered = filter_urls(all, re.as_ref());
    info!("URLs after filtering: {}", filtered.len());
    Ok(filtered)
}

fn filter_urls(urls: Vec<String>, re: Option<&Regex>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    urls.into_iter()
        .filter(|u| re.map_or(true, |re| re.is_match(u)))
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

/// Write a first-stage input file: a single `url` column.
pub fn write_input_csv(path: &Path, urls: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut w = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {:?}", path))?;
    w.write_record(["url"])?;
    for url in urls {
        w.write_record([url])?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{FetchError, FetchErrorKind};
    use crate::fetcher::FetchedPage;
    use crate::store::load_input_urls;
    use async_trait::async_trait;
    use std::collections::HashMap;

    const URLSET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://docs.x.dev/api/foo.html</loc><lastmod>2024-01-01</lastmod></url>
  <url><loc>https://docs.x.dev/guide/intro.html</loc></url>
  <url><loc>https://docs.x.dev/api/bar.html?a=1&amp;b=2</loc></url>
</urlset>"#;

    const INDEX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>https://docs.x.dev/sitemap-1.xml</loc></sitemap>
  <sitemap><loc>https://docs.x.dev/missing.xml</loc></sitemap>
</sitemapindex>"#;

    struct Pages(HashMap<&'static str, &'static str>);

    #[async_trait]
    impl PageFetcher for Pages {
        async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
            match self.0.get(url) {
                Some(body) => Ok(FetchedPage {
                    url: url.to_string(),
                    final_url: url.to_string(),
                    status: 200,
                    content: body.to_string(),
                    latency_ms: 1,
                }),
                None => Err(FetchError {
                    kind: FetchErrorKind::NotFound,
                    url: url.to_string(),
                    status: Some(404),
                    attempts: 1,
                    message: "not found".into(),
                }),
            }
        }
    }

    #[test]
    fn parses_urlset() {
        let s = parse_sitemap(URLSET).unwrap();
        assert_eq!(
            s.pages,
            vec![
                "https://docs.x.dev/api/foo.html",
                "https://docs.x.dev/guide/intro.html",
                "https://docs.x.dev/api/bar.html?a=1&b=2",
            ]
        );
        assert!(s.children.is_empty());
    }

    #[test]
    fn parses_index() {
        let s = parse_sitemap(INDEX).unwrap();
        assert!(s.pages.is_empty());
        assert_eq!(s.children.len(), 2);
    }

    #[tokio::test]
    async fn follows_index_and_filters() {
        let fetcher = Pages(HashMap::from([
            ("https://docs.x.dev/sitemap.xml", INDEX),
            ("https://docs.x.dev/sitemap-1.xml", URLSET),
        ]));
        let urls = collect_urls(&fetcher, "https://docs.x.dev/sitemap.xml", Some(r"/api/"))
            .await
            .unwrap();
        assert_eq!(
            urls,
            vec!["https://docs.x.dev/api/foo.html", "https://docs.x.dev/api/bar.html?a=1&b=2"]
        );
    }

    #[tokio::test]
    async fn missing_root_sitemap_is_an_error() {
        let fetcher = Pages(HashMap::new());
        assert!(collect_urls(&fetcher, "https://docs.x.dev/sitemap.xml", None).await.is_err());
    }

    #[test]
    fn written_csv_loads_as_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed/input.csv");
        let urls = vec!["https://a.dev/x".to_string(), "https://a.dev/y".to_string()];
        write_input_csv(&path, &urls).unwrap();

        let load = load_input_urls(&path).unwrap();
        assert_eq!(load.rows.len(), 2);
        assert_eq!(load.rows[0].row_number, 2);
        assert_eq!(load.rows[1].url, "https://a.dev/y");
    }
}
