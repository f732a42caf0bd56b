use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::page::Page;

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_$][\w$]*(?:\.[A-Za-z_$][\w$]*)*$").unwrap());
static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v?\d+(?:\.\d+)*(?:\.x)?$").unwrap());
static HOOK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\buse[A-Z]\w*").unwrap());
static LODASH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b_\.\w+").unwrap());
static DOTTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z_]\w*(?:\.[A-Za-z_]\w*)+\b").unwrap());

/// Path segments that never name an API.
const GENERIC_SEGMENTS: &[&str] = &[
    "docs", "doc", "api", "apis", "reference", "ref", "generated", "stable", "latest", "dev",
    "en", "en-us", "library", "libraries", "manual", "guide", "guides", "learn", "hooks",
    "components", "index", "main", "master", "current", "html", "pages", "web", "javascript",
    "python", "modules", "module", "packages", "package", "functions", "classes",
];

/// Anchors that point at page sections rather than API members.
const GENERIC_ANCHORS: &[&str] = &[
    "top", "content", "main", "main-content", "notes", "note", "examples", "example",
    "parameters", "returns", "description", "overview", "see-also", "usage", "syntax",
    "introduction", "summary", "reference", "caveats", "troubleshooting", "deprecation",
    "deprecated", "changelog", "history", "specifications", "browser-compatibility",
];

const QUERY_KEYS: &[&str] = &["api", "function", "method", "func", "name", "symbol"];

// ── Matches ──

#[derive(Debug, Clone, PartialEq)]
pub struct ApiMatch {
    pub name: String,
    pub confidence: f64,
    pub method: &'static str,
}

/// One way of naming the API a URL points at.
pub trait ApiNameStrategy: Send + Sync {
    fn method(&self) -> &'static str;
    fn confidence(&self) -> f64;
    fn candidate(&self, url: &Url, page: Option<&Page>) -> Option<String>;

    fn resolve(&self, url: &Url, page: Option<&Page>) -> Option<ApiMatch> {
        let name = self.candidate(url, page)?;
        Some(ApiMatch {
            name,
            confidence: self.confidence(),
            method: self.method(),
        })
    }
}

pub struct FragmentStrategy;
pub struct PathStrategy;
pub struct QueryStrategy;
pub struct TitleStrategy;

impl ApiNameStrategy for FragmentStrategy {
    fn method(&self) -> &'static str {
        "fragment"
    }

    fn confidence(&self) -> f64 {
        0.9
    }

    fn candidate(&self, url: &Url, _page: Option<&Page>) -> Option<String> {
        let raw = url.fragment()?;
        let decoded = percent_decode(raw);
        let frag = decoded
            .trim()
            .trim_start_matches("module-")
            .trim_start_matches("method-")
            .trim_start_matches("function-");
        if GENERIC_ANCHORS.contains(&frag.to_ascii_lowercase().as_str()) {
            return None;
        }
        let frag = frag.trim_end_matches("()");
        identifier(frag)
    }
}

impl ApiNameStrategy for PathStrategy {
    fn method(&self) -> &'static str {
        "path"
    }

    fn confidence(&self) -> f64 {
        0.8
    }

    fn candidate(&self, url: &Url, _page: Option<&Page>) -> Option<String> {
        let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
        let last = segments
            .iter()
            .rev()
            .map(|s| strip_extension(s))
            .find(|s| {
                let lower = s.to_ascii_lowercase();
                !GENERIC_SEGMENTS.contains(&lower.as_str()) && !VERSION_RE.is_match(s)
            })?;
        let decoded = percent_decode(last);
        if decoded.len() < 2 {
            return None;
        }
        identifier(&decoded)
    }
}

impl ApiNameStrategy for QueryStrategy {
    fn method(&self) -> &'static str {
        "query"
    }

    fn confidence(&self) -> f64 {
        0.6
    }

    fn candidate(&self, url: &Url, _page: Option<&Page>) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| QUERY_KEYS.contains(&k.to_ascii_lowercase().as_str()))
            .and_then(|(_, v)| identifier(v.trim()))
    }
}

impl ApiNameStrategy for TitleStrategy {
    fn method(&self) -> &'static str {
        "title"
    }

    fn confidence(&self) -> f64 {
        0.5
    }

    fn candidate(&self, _url: &Url, page: Option<&Page>) -> Option<String> {
        let page = page?;
        let title = if page.title.is_empty() {
            page.headings.first().map(|h| h.text.as_str())?
        } else {
            page.title.as_str()
        };
        let head = title
            .split([' ', '|', '·', '—', '–'])
            .find(|s| !s.is_empty())
            .unwrap_or(title)
            .trim_end_matches("()");
        if let Some(name) = identifier(head) {
            return Some(name);
        }
        [&*LODASH_RE, &*HOOK_RE, &*DOTTED_RE]
            .iter()
            .find_map(|re| re.find(title).map(|m| m.as_str().to_string()))
    }
}

/// Ordered strategies; the first that matches wins.
pub struct NameResolver {
    strategies: Vec<Box<dyn ApiNameStrategy>>,
}

impl NameResolver {
    /// URL-only strategies, highest confidence first.
    pub fn url_only() -> Self {
        NameResolver {
            strategies: vec![
                Box::new(FragmentStrategy),
                Box::new(PathStrategy),
                Box::new(QueryStrategy),
            ],
        }
    }

    /// URL strategies followed by the page-title fallback.
    pub fn with_title() -> Self {
        let mut resolver = Self::url_only();
        resolver.strategies.push(Box::new(TitleStrategy));
        resolver
    }

    pub fn resolve(&self, url: &Url, page: Option<&Page>) -> Option<ApiMatch> {
        self.strategies
            .iter()
            .find_map(|s| s.resolve(url, page))
            .map(|m| qualify(m, url))
    }

    /// First match whose confidence reaches `threshold`.
    pub fn resolve_confident(&self, url: &Url, page: Option<&Page>, threshold: f64) -> Option<ApiMatch> {
        self.strategies
            .iter()
            .filter_map(|s| s.resolve(url, page))
            .find(|m| m.confidence >= threshold)
            .map(|m| qualify(m, url))
    }
}

fn identifier(s: &str) -> Option<String> {
    let s = s.trim();
    IDENT_RE.is_match(s).then(|| s.to_string())
}

fn strip_extension(segment: &str) -> &str {
    for ext in [".html", ".htm", ".php", ".md", ".aspx", ".shtml"] {
        if let Some(stem) = segment.strip_suffix(ext) {
            return stem;
        }
    }
    segment
}

fn percent_decode(s: &str) -> String {
    url::form_urlencoded::parse(format!("x={}", s).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| s.to_string())
}

// ── Known documentation sites ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualify {
    /// Prefix bare names with `package.`.
    Dotted,
    /// Normalize to `_.name`.
    Lodash,
    Verbatim,
}

#[derive(Debug, Clone, Copy)]
pub struct SiteProfile {
    pub host: &'static str,
    pub package: &'static str,
    pub language: &'static str,
    pub qualify: Qualify,
}

const SITES: &[SiteProfile] = &[
    SiteProfile { host: "numpy.org", package: "numpy", language: "Python", qualify: Qualify::Dotted },
    SiteProfile { host: "pandas.pydata.org", package: "pandas", language: "Python", qualify: Qualify::Dotted },
    SiteProfile { host: "docs.scipy.org", package: "scipy", language: "Python", qualify: Qualify::Dotted },
    SiteProfile { host: "matplotlib.org", package: "matplotlib", language: "Python", qualify: Qualify::Dotted },
    SiteProfile { host: "pytorch.org", package: "torch", language: "Python", qualify: Qualify::Dotted },
    SiteProfile { host: "tensorflow.org", package: "tensorflow", language: "Python", qualify: Qualify::Dotted },
    SiteProfile { host: "scikit-learn.org", package: "sklearn", language: "Python", qualify: Qualify::Dotted },
    SiteProfile { host: "docs.python.org", package: "python", language: "Python", qualify: Qualify::Verbatim },
    SiteProfile { host: "docs.djangoproject.com", package: "django", language: "Python", qualify: Qualify::Verbatim },
    SiteProfile { host: "lodash.com", package: "lodash", language: "JavaScript", qualify: Qualify::Lodash },
    SiteProfile { host: "react.dev", package: "react", language: "JavaScript", qualify: Qualify::Verbatim },
    SiteProfile { host: "reactjs.org", package: "react", language: "JavaScript", qualify: Qualify::Verbatim },
    SiteProfile { host: "nodejs.org", package: "node", language: "JavaScript", qualify: Qualify::Verbatim },
    SiteProfile { host: "developer.mozilla.org", package: "", language: "JavaScript", qualify: Qualify::Verbatim },
    SiteProfile { host: "gin-gonic.com", package: "gin", language: "Go", qualify: Qualify::Verbatim },
    SiteProfile { host: "pkg.go.dev", package: "", language: "Go", qualify: Qualify::Verbatim },
    SiteProfile { host: "docs.rs", package: "", language: "Rust", qualify: Qualify::Verbatim },
];

pub fn site_for(url: &Url) -> Option<&'static SiteProfile> {
    let host = url.host_str()?.to_ascii_lowercase();
    SITES
        .iter()
        .find(|s| host == s.host || host.ends_with(&format!(".{}", s.host)))
}

fn qualify(mut m: ApiMatch, url: &Url) -> ApiMatch {
    let Some(site) = site_for(url) else {
        return m;
    };
    m.name = match site.qualify {
        Qualify::Dotted => {
            let prefix = format!("{}.", site.package);
            if m.name == site.package || m.name.starts_with(&prefix) {
                m.name
            } else {
                format!("{}{}", prefix, m.name)
            }
        }
        Qualify::Lodash => {
            let bare = m.name.trim_start_matches("_.").trim_start_matches('_');
            format!("_.{}", bare)
        }
        Qualify::Verbatim => m.name,
    };
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(url: &str) -> Option<ApiMatch> {
        NameResolver::url_only().resolve(&Url::parse(url).unwrap(), None)
    }

    #[test]
    fn fragment_wins_over_path() {
        let m = resolve("https://docs.python.org/3/library/os.html#os.getcwdu").unwrap();
        assert_eq!(m.name, "os.getcwdu");
        assert_eq!(m.method, "fragment");
        assert!((m.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn sphinx_generated_path() {
        let m = resolve("https://numpy.org/doc/stable/reference/generated/numpy.ndarray.shape.html")
            .unwrap();
        assert_eq!(m.name, "numpy.ndarray.shape");
        assert_eq!(m.method, "path");
        assert!((m.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn bare_names_get_package_prefix() {
        let m = resolve("https://numpy.org/doc/stable/reference/arrays.html#ndarray.flat").unwrap();
        assert_eq!(m.name, "numpy.ndarray.flat");
    }

    #[test]
    fn lodash_anchor() {
        let m = resolve("https://lodash.com/docs/4.17.15#chunk").unwrap();
        assert_eq!(m.name, "_.chunk");
        assert_eq!(m.method, "fragment");
    }

    #[test]
    fn lodash_without_anchor_has_no_name() {
        assert!(resolve("https://lodash.com/docs/4.17.15").is_none());
    }

    #[test]
    fn react_reference_path() {
        let m = resolve("https://react.dev/reference/react/useEffect").unwrap();
        assert_eq!(m.name, "useEffect");
        assert_eq!(m.method, "path");
    }

    #[test]
    fn generic_anchor_falls_through() {
        let m = resolve("https://react.dev/reference/react/Component#caveats").unwrap();
        assert_eq!(m.name, "Component");
        assert_eq!(m.method, "path");
    }

    #[test]
    fn query_parameter() {
        let m = resolve("https://example.com/docs/?function=parse_url").unwrap();
        assert_eq!(m.name, "parse_url");
        assert!((m.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn title_fallback_needs_page() {
        let url = Url::parse("https://example.com/docs/").unwrap();
        assert!(NameResolver::with_title().resolve(&url, None).is_none());

        let page = Page {
            title: "useMemo – React".to_string(),
            ..Default::default()
        };
        let m = NameResolver::with_title().resolve(&url, Some(&page)).unwrap();
        assert_eq!(m.name, "useMemo");
        assert_eq!(m.method, "title");
    }

    #[test]
    fn hyphenated_slugs_are_not_identifiers() {
        assert!(resolve("https://example.com/blog/what-changed-in-2024").is_none());
    }
}
