use regex::Regex;
use scraper::{Html, Selector};
use std::collections::BTreeSet;
use std::sync::LazyLock;
use tracing::{debug, warn};
use url::Url;

static RAW_CSV_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)https?://[^\s"'<>()\\]+?\.csv\b"#).expect("static pattern")
});

fn path_is_csv(href: &str) -> bool {
    let path = href.split(['?', '#']).next().unwrap_or(href);
    path.to_ascii_lowercase().ends_with(".csv")
}

// ── Pass (a): anchors ────────────────────────────────────────────────────────

/// `href`s ending in `.csv`, relative ones resolved against `base`.
pub fn extract_anchor_links(html: &str, base: &Url) -> Vec<String> {
    let doc = Html::parse_document(html);
    let Ok(a_sel) = Selector::parse("a[href]") else {
        return vec![];
    };

    let mut out = Vec::new();
    for a in doc.select(&a_sel) {
        let Some(href) = a.value().attr("href") else { continue };
        let href = href.trim();
        if !path_is_csv(href) {
            continue;
        }
        match base.join(href) {
            Ok(u) => out.push(u.to_string()),
            Err(e) => warn!("Unresolvable CSV link {:?}: {}", href, e),
        }
    }
    out
}

// ── Pass (b): raw scan ───────────────────────────────────────────────────────

/// Absolute CSV URLs anywhere in the body, including script blocks.
/// JSON-escaped slashes (`https:\/\/host\/x.csv`) are unescaped first.
pub fn scan_raw_links(body: &str) -> Vec<String> {
    let body = body.replace(r"\/", "/");
    RAW_CSV_URL
        .find_iter(&body)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Union of both passes.
pub fn extract_csv_urls(html: &str, base: &Url) -> BTreeSet<String> {
    let anchors = extract_anchor_links(html, base);
    let raw = scan_raw_links(html);
    debug!("{} anchor links, {} raw matches", anchors.len(), raw.len());
    anchors.into_iter().chain(raw).collect()
}
