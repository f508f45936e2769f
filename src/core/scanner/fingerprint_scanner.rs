// src/core/scanner/fingerprint_scanner.rs

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderMap;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::models::{Fingerprint, ResponseSnapshot, Technology};

/// How a check compares its input.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Case-insensitive substring.
    Contains(String),
    /// Regex; the first capture group, if any, is taken as the version.
    Pattern(Regex),
}

impl Matcher {
    pub fn contains(needle: &str) -> Self {
        Matcher::Contains(needle.to_ascii_lowercase())
    }

    pub fn pattern(re: &str) -> Result<Self, regex::Error> {
        Regex::new(re).map(Matcher::Pattern)
    }

    /// `Some(version)` on a match (`version` may itself be `None`), `None` otherwise.
    fn apply(&self, text: &str) -> Option<Option<String>> {
        match self {
            Matcher::Contains(needle) => text.to_ascii_lowercase().contains(needle.as_str()).then_some(None),
            Matcher::Pattern(re) => re.captures(text).map(|caps| {
                caps.get(1)
                    .map(|m| m.as_str().to_string())
                    .filter(|s| !s.is_empty())
            }),
        }
    }
}

/// Defines the different types of checks that can be performed to identify a technology.
#[derive(Debug, Clone)]
pub enum Check {
    /// A specific HTTP header (all values joined).
    Header(String, Matcher),
    /// The `set-cookie` headers.
    Cookie(Matcher),
    /// The content of a named meta tag.
    MetaTag(String, Matcher),
    /// The raw body.
    Body(Matcher),
    /// The `src` attribute of `<script>` tags.
    ScriptSrc(Matcher),
    /// The `href` attribute of `<link>` tags.
    LinkHref(Matcher),
    /// The page `<title>`.
    Title(Matcher),
    /// Exact SHA-256 (hex) of the body.
    BodyHash(String),
}

/// A rule that defines how to detect a specific technology.
#[derive(Debug, Clone)]
pub struct Signature {
    pub tech_name: String,
    pub category: String,
    pub check: Check,
}

impl Signature {
    pub fn new(tech_name: &str, category: &str, check: Check) -> Self {
        Self {
            tech_name: tech_name.to_string(),
            category: category.to_string(),
            check,
        }
    }
}

// Statically compiled regexes for the built-in rules.
static RE_NGINX: Lazy<Regex> = Lazy::new(|| Regex::new(r"nginx/([\d\.]+)").unwrap());
static RE_NGINX_ERROR: Lazy<Regex> = Lazy::new(|| Regex::new(r"<hr><center>nginx(?:/([\d\.]+))?</center>").unwrap());
static RE_APACHE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Apache/([\d\.]+)").unwrap());
static RE_APACHE_ERROR: Lazy<Regex> = Lazy::new(|| Regex::new(r"Apache(?:/([\d\.]+))? Server at").unwrap());
static RE_IIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"Microsoft-IIS/([\d\.]+)").unwrap());
static RE_TOMCAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"Apache Tomcat/([\d\.]+)").unwrap());
static RE_WORDPRESS: Lazy<Regex> = Lazy::new(|| Regex::new(r"WordPress ?([\d\.]+)?").unwrap());
static RE_WP_EMBED: Lazy<Regex> = Lazy::new(|| Regex::new(r"/wp-content/|/wp-includes/").unwrap());
static RE_JOOMLA: Lazy<Regex> = Lazy::new(|| Regex::new(r"Joomla!").unwrap());
static RE_DRUPAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"Drupal ?([\d\.]+)?").unwrap());
static RE_PHP: Lazy<Regex> = Lazy::new(|| Regex::new(r"PHP/([\d\.]+)").unwrap());
static RE_VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"([\d\.]+)").unwrap());
static RE_NEXTJS: Lazy<Regex> = Lazy::new(|| Regex::new(r"Next\.js ?([\d\.]+)?").unwrap());
static RE_NEXTJS_SCRIPT: Lazy<Regex> = Lazy::new(|| Regex::new(r"/_next/static/").unwrap());
static RE_NUXTJS: Lazy<Regex> = Lazy::new(|| Regex::new(r"__NUXT__|window\._nuxt").unwrap());
static RE_ANGULAR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"ng-version="([\d\.]+)""#).unwrap());
static RE_SVELTE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"class=["']svelte-"#).unwrap());
static RE_GATSBY: Lazy<Regex> = Lazy::new(|| Regex::new(r#"id=["']___gatsby["']"#).unwrap());
static RE_ASTRO: Lazy<Regex> = Lazy::new(|| Regex::new(r"Astro v([\d\.]+)").unwrap());
static RE_JQUERY: Lazy<Regex> = Lazy::new(|| Regex::new(r"jquery[-.]?(\d+\.\d+(?:\.\d+)?)?(?:\.min|\.slim)?\.js").unwrap());
static RE_REACT: Lazy<Regex> = Lazy::new(|| Regex::new(r"react-dom|data-reactroot|react\.development").unwrap());
static RE_VUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"data-v-app|__VUE_").unwrap());
static RE_BOOTSTRAP: Lazy<Regex> = Lazy::new(|| Regex::new(r"bootstrap(?:@|-)?([\d\.]+)?(?:/dist/css/|\.min\.css)").unwrap());
static RE_GOOGLE_ANALYTICS: Lazy<Regex> = Lazy::new(|| Regex::new(r"google-analytics\.com/|googletagmanager\.com/").unwrap());

/// Body of the stock Apache httpd `index.html`.
const APACHE_DEFAULT_PAGE_SHA256: &str = "f2dcc96deec8bca2facba9ad0db55c89f3c4937cd6d2d28e5c4869216ffa81cf";

fn header(name: &str, matcher: Matcher) -> Check {
    Check::Header(name.to_string(), matcher)
}

fn re(pattern: &Lazy<Regex>) -> Matcher {
    Matcher::Pattern(Regex::clone(pattern))
}

/// The built-in rule list.
fn builtin_signatures() -> Vec<Signature> {
    vec![
        Signature::new("Nginx", "Web Server", header("server", re(&RE_NGINX))),
        Signature::new("Nginx", "Web Server", header("server", Matcher::contains("nginx"))),
        Signature::new("Nginx", "Web Server", Check::Body(re(&RE_NGINX_ERROR))),
        Signature::new("Apache", "Web Server", header("server", re(&RE_APACHE))),
        Signature::new("Apache", "Web Server", header("server", Matcher::contains("apache"))),
        Signature::new("Apache", "Web Server", Check::Body(re(&RE_APACHE_ERROR))),
        Signature::new("Apache", "Web Server", Check::BodyHash(APACHE_DEFAULT_PAGE_SHA256.to_string())),
        Signature::new("Microsoft IIS", "Web Server", header("server", re(&RE_IIS))),
        Signature::new("Caddy", "Web Server", header("server", Matcher::contains("caddy"))),
        Signature::new("LiteSpeed", "Web Server", header("server", Matcher::contains("litespeed"))),
        Signature::new("Apache Tomcat", "Web Server", Check::Body(re(&RE_TOMCAT))),
        Signature::new("Cloudflare", "CDN / WAF", header("server", Matcher::contains("cloudflare"))),
        Signature::new("Cloudflare", "CDN / WAF", header("cf-ray", Matcher::contains(""))),
        Signature::new("Varnish", "Cache", header("via", Matcher::contains("varnish"))),
        Signature::new("Amazon CloudFront", "CDN / WAF", header("x-amz-cf-id", Matcher::contains(""))),
        Signature::new("WordPress", "CMS", Check::MetaTag("generator".to_string(), re(&RE_WORDPRESS))),
        Signature::new("WordPress", "CMS", Check::Body(re(&RE_WP_EMBED))),
        Signature::new("Joomla", "CMS", Check::MetaTag("generator".to_string(), re(&RE_JOOMLA))),
        Signature::new("Drupal", "CMS", Check::MetaTag("generator".to_string(), re(&RE_DRUPAL))),
        Signature::new("Drupal", "CMS", header("x-drupal-cache", Matcher::contains(""))),
        Signature::new("Shopify", "E-commerce", header("x-shopid", Matcher::contains(""))),
        Signature::new("Magento", "E-commerce", Check::Cookie(Matcher::contains("magento"))),
        Signature::new("PHP", "Language", header("x-powered-by", re(&RE_PHP))),
        Signature::new("PHP", "Language", Check::Cookie(Matcher::contains("phpsessid"))),
        Signature::new("ASP.NET", "Framework", header("x-aspnet-version", re(&RE_VERSION))),
        Signature::new("ASP.NET", "Framework", header("x-powered-by", Matcher::contains("asp.net"))),
        Signature::new("Express", "Framework", header("x-powered-by", Matcher::contains("express"))),
        Signature::new("Java", "Language", Check::Cookie(Matcher::contains("jsessionid"))),
        Signature::new("Python/Django", "Framework", Check::Cookie(Matcher::contains("csrftoken"))),
        Signature::new("Laravel", "Framework", Check::Cookie(Matcher::contains("laravel_session"))),
        Signature::new("Ruby on Rails", "Framework", Check::Cookie(Matcher::contains("_rails_session"))),
        Signature::new("Next.js", "JS Framework", header("x-powered-by", re(&RE_NEXTJS))),
        Signature::new("Next.js", "JS Framework", Check::ScriptSrc(re(&RE_NEXTJS_SCRIPT))),
        Signature::new("Nuxt.js", "JS Framework", Check::Body(re(&RE_NUXTJS))),
        Signature::new("Angular", "JS Framework", Check::Body(re(&RE_ANGULAR))),
        Signature::new("Svelte", "JS Framework", Check::Body(re(&RE_SVELTE))),
        Signature::new("Gatsby", "JS Framework", Check::Body(re(&RE_GATSBY))),
        Signature::new("Astro", "JS Framework", Check::MetaTag("generator".to_string(), re(&RE_ASTRO))),
        Signature::new("React", "JS Library", Check::Body(re(&RE_REACT))),
        Signature::new("Vue.js", "JS Library", Check::Body(re(&RE_VUE))),
        Signature::new("jQuery", "JS Library", Check::ScriptSrc(re(&RE_JQUERY))),
        Signature::new("Bootstrap", "UI Framework", Check::LinkHref(re(&RE_BOOTSTRAP))),
        Signature::new("Google Analytics", "Analytics", Check::ScriptSrc(re(&RE_GOOGLE_ANALYTICS))),
        Signature::new("Grafana", "Monitoring", Check::Title(Matcher::contains("grafana"))),
        Signature::new("Grafana", "Monitoring", Check::Cookie(Matcher::contains("grafana_session"))),
        Signature::new("Kibana", "Monitoring", header("kbn-name", Matcher::contains(""))),
        Signature::new("Jenkins", "CI/CD", header("x-jenkins", re(&RE_VERSION))),
        Signature::new("Jenkins", "CI/CD", Check::Title(Matcher::contains("jenkins"))),
        Signature::new("Directory Listing", "Misconfiguration", Check::Title(Matcher::contains("index of /"))),
    ]
}

/// The signatures a `FingerprintEngine` matches against.
#[derive(Debug, Clone)]
pub struct SignatureSet {
    rules: Vec<Signature>,
}

impl SignatureSet {
    pub fn builtin() -> Self {
        Self {
            rules: builtin_signatures(),
        }
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule(mut self, rule: Signature) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Which parts of a fingerprint the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintRequest {
    pub technologies: bool,
    pub hashes: bool,
}

/// Classifies response content. Stateless: the same snapshot always yields
/// the same fingerprint.
#[derive(Debug, Clone)]
pub struct FingerprintEngine {
    signatures: SignatureSet,
}

impl Default for FingerprintEngine {
    fn default() -> Self {
        Self::new(SignatureSet::builtin())
    }
}

impl FingerprintEngine {
    pub fn new(signatures: SignatureSet) -> Self {
        Self { signatures }
    }

    pub fn analyze(&self, snapshot: &ResponseSnapshot, request: FingerprintRequest) -> Fingerprint {
        let body_hash = sha256_hex(&snapshot.body);
        let technologies = if request.technologies {
            self.detect(snapshot, &body_hash)
        } else {
            Vec::new()
        };

        let (body_hash, header_hash) = if request.hashes {
            (Some(body_hash), Some(header_hash(&snapshot.headers)))
        } else {
            (None, None)
        };

        Fingerprint {
            technologies,
            body_hash,
            header_hash,
        }
    }

    fn detect(&self, snapshot: &ResponseSnapshot, body_hash: &str) -> Vec<Technology> {
        let headers = &snapshot.headers;
        let cookies = joined(headers, "set-cookie", "; ");
        let body = String::from_utf8_lossy(&snapshot.body);
        let document = Html::parse_document(&body);
        let title = page_title(&document);

        let mut found_techs: BTreeMap<String, Technology> = BTreeMap::new();

        debug!(total_rules = %self.signatures.len(), "Applying fingerprinting rules.");
        for rule in &self.signatures.rules {
            let version = match &rule.check {
                Check::Header(name, m) => joined(headers, name, ", ").and_then(|v| m.apply(&v)),
                Check::Cookie(m) => cookies.as_deref().and_then(|c| m.apply(c)),
                Check::MetaTag(name, m) => check_meta_tag(&document, name, m),
                Check::Body(m) => m.apply(&body),
                Check::ScriptSrc(m) => check_attribute(&document, "script[src]", "src", m),
                Check::LinkHref(m) => check_attribute(&document, "link[href]", "href", m),
                Check::Title(m) => title.as_deref().and_then(|t| m.apply(t)),
                Check::BodyHash(expected) => expected.eq_ignore_ascii_case(body_hash).then_some(None),
            };

            if let Some(v) = version {
                debug!(tech = %rule.tech_name, version = ?v, "Rule matched.");
                match found_techs.get_mut(&rule.tech_name) {
                    // Already detected: a later rule may only fill in a missing version.
                    Some(existing) => {
                        if existing.version.is_none() && v.is_some() {
                            existing.version = v;
                        }
                    }
                    None => {
                        found_techs.insert(
                            rule.tech_name.clone(),
                            Technology {
                                name: rule.tech_name.clone(),
                                category: rule.category.clone(),
                                version: v,
                            },
                        );
                    }
                }
            }
        }

        found_techs.into_values().collect()
    }
}

/// Text of the first non-empty `<title>`, whitespace collapsed.
pub fn page_title(document: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    document
        .select(&selector)
        .map(|el| el.text().collect::<Vec<_>>().join(" "))
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .find(|t| !t.is_empty())
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hash over the set of header names, independent of order, case and values.
fn header_hash(headers: &HeaderMap) -> String {
    let names: BTreeSet<String> = headers.keys().map(|k| k.as_str().to_ascii_lowercase()).collect();
    let canonical = names.into_iter().collect::<Vec<_>>().join("\n");
    sha256_hex(canonical.as_bytes())
}

fn joined(headers: &HeaderMap, name: &str, separator: &str) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    (!values.is_empty()).then(|| values.join(separator))
}

/// Searches the parsed HTML for a named meta tag and checks its content.
fn check_meta_tag(doc: &Html, name: &str, m: &Matcher) -> Option<Option<String>> {
    let selector = Selector::parse(&format!("meta[name='{}']", name)).ok()?;
    doc.select(&selector)
        .filter_map(|el| el.value().attr("content"))
        .find_map(|content| m.apply(content))
}

/// Checks an attribute of every element matching `selector`; first match wins.
fn check_attribute(doc: &Html, selector: &str, attr: &str, m: &Matcher) -> Option<Option<String>> {
    let selector = Selector::parse(selector).ok()?;
    doc.select(&selector)
        .filter_map(|el| el.value().attr(attr))
        .find_map(|value| m.apply(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn snapshot(headers: &[(&str, &str)], body: &str) -> ResponseSnapshot {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        ResponseSnapshot {
            status: 200,
            headers: map,
            body: body.as_bytes().to_vec(),
            body_truncated: false,
            remote_ip: None,
        }
    }

    const ALL: FingerprintRequest = FingerprintRequest {
        technologies: true,
        hashes: true,
    };

    fn names(fp: &Fingerprint) -> Vec<&str> {
        fp.technologies.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn test_multiple_technologies_match() {
        let body = r#"<html><head>
            <meta name="generator" content="WordPress 6.4.2">
            <script src="/wp-includes/js/jquery/jquery-3.7.1.min.js"></script>
            </head><body></body></html>"#;
        let snap = snapshot(
            &[("Server", "nginx/1.25.3"), ("X-Powered-By", "PHP/8.2.1"), ("Set-Cookie", "PHPSESSID=abc")],
            body,
        );
        let fp = FingerprintEngine::default().analyze(&snap, ALL);

        assert_eq!(names(&fp), vec!["Nginx", "PHP", "WordPress", "jQuery"]);
        let version = |n: &str| fp.technologies.iter().find(|t| t.name == n).unwrap().version.clone();
        assert_eq!(version("Nginx").as_deref(), Some("1.25.3"));
        assert_eq!(version("PHP").as_deref(), Some("8.2.1"));
        assert_eq!(version("WordPress").as_deref(), Some("6.4.2"));
        assert_eq!(version("jQuery").as_deref(), Some("3.7.1"));
    }

    #[test]
    fn test_version_filled_by_later_rule() {
        // The bare "nginx" header rule matches without a version; the error page supplies one.
        let snap = snapshot(&[("Server", "nginx")], "<hr><center>nginx/1.18.0</center>");
        let fp = FingerprintEngine::default().analyze(&snap, ALL);
        assert_eq!(fp.technologies.len(), 1);
        assert_eq!(fp.technologies[0].version.as_deref(), Some("1.18.0"));
    }

    #[test]
    fn test_hash_rule_matches_apache_default_page() {
        let snap = snapshot(&[], "<html><body><h1>It works!</h1></body></html>\n");
        let fp = FingerprintEngine::default().analyze(&snap, ALL);
        assert_eq!(names(&fp), vec!["Apache"]);
        assert_eq!(fp.body_hash.as_deref(), Some(APACHE_DEFAULT_PAGE_SHA256));
    }

    #[test]
    fn test_custom_signature_set() {
        let set = SignatureSet::empty()
            .with_rule(Signature::new("Acme", "Appliance", Check::Title(Matcher::contains("acme login"))))
            .with_rule(Signature::new(
                "Acme",
                "Appliance",
                header("x-acme", Matcher::pattern(r"v(\d+)").unwrap()),
            ));
        let snap = snapshot(&[("X-Acme", "v7")], "<title>ACME Login</title>");
        let fp = FingerprintEngine::new(set).analyze(&snap, ALL);
        assert_eq!(fp.technologies.len(), 1);
        assert_eq!(fp.technologies[0].version.as_deref(), Some("7"));
    }

    #[test]
    fn test_request_flags_gate_output() {
        let snap = snapshot(&[("Server", "cloudflare")], "hello");
        let engine = FingerprintEngine::default();

        let labels_only = engine.analyze(&snap, FingerprintRequest { technologies: true, hashes: false });
        assert_eq!(names(&labels_only), vec!["Cloudflare"]);
        assert!(labels_only.body_hash.is_none() && labels_only.header_hash.is_none());

        let hashes_only = engine.analyze(&snap, FingerprintRequest { technologies: false, hashes: true });
        assert!(hashes_only.technologies.is_empty());
        assert_eq!(hashes_only.body_hash.as_deref(), Some(sha256_hex(b"hello").as_str()));
    }

    #[test]
    fn test_deterministic_and_header_order_independent() {
        let a = snapshot(&[("Server", "Apache/2.4.58"), ("X-Frame-Options", "DENY")], "<p>x</p>");
        let b = snapshot(&[("x-frame-options", "SAMEORIGIN"), ("server", "Apache/2.4.58")], "<p>x</p>");
        let engine = FingerprintEngine::default();
        let fa = engine.analyze(&a, ALL);
        assert_eq!(fa, engine.analyze(&a, ALL));
        assert_eq!(fa.header_hash, engine.analyze(&b, ALL).header_hash);
    }

    #[test]
    fn test_no_match_yields_no_labels() {
        let snap = snapshot(&[("Content-Type", "text/plain")], "plain text");
        let fp = FingerprintEngine::default().analyze(&snap, ALL);
        assert!(fp.technologies.is_empty());
    }

    #[test]
    fn test_page_title() {
        let doc = Html::parse_document("<html><head><title>\n  Index of /pub \n</title></head></html>");
        assert_eq!(page_title(&doc).as_deref(), Some("Index of /pub"));
        assert_eq!(page_title(&Html::parse_document("<p>none</p>")), None);
    }
}
