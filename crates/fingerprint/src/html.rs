use std::collections::HashSet;

use scraper::{Html, Selector};
use url::Url;

use asherah_core::types::{ExtractedLink, LinkKind, PageMetadata};

use crate::onion::extract_all_onions;
use crate::url::{classify_link, link_onion, normalize_url};

const MAX_TEXT_BYTES: usize = 50 * 1024;
const MAX_TITLE_CHARS: usize = 500;
const MAX_DESCRIPTION_BYTES: usize = 1024;
const MAX_H1_COUNT: usize = 10;

/// Everything the crawler wants from one HTML body.
pub struct PageExtract {
    pub links: Vec<ExtractedLink>,
    /// Onion addresses mentioned only in raw text (comments, code blocks),
    /// not by any element edge. Enqueued as root URLs at higher priority.
    pub text_onions: Vec<String>,
    pub metadata: PageMetadata,
}

/// Element selectors that produce edges, with the source kind recorded for
/// later weighting. Order fixes the ordinal positions.
static EDGE_SOURCES: &[(&str, &str, LinkKind)] = &[
    ("a[href]", "href", LinkKind::Anchor),
    ("img[src]", "src", LinkKind::Image),
    ("script[src]", "src", LinkKind::Script),
    ("link[href]", "href", LinkKind::Stylesheet),
    ("iframe[src]", "src", LinkKind::Frame),
    ("frame[src]", "src", LinkKind::Frame),
    ("form[action]", "action", LinkKind::Form),
    ("video[src]", "src", LinkKind::Media),
    ("audio[src]", "src", LinkKind::Media),
    ("source[src]", "src", LinkKind::Source),
    ("object[data]", "data", LinkKind::Object),
    ("embed[src]", "src", LinkKind::Embed),
    ("base[href]", "href", LinkKind::Base),
];

/// Parse an HTML body (error pages included) into edges, text-mentioned
/// onion addresses, and page metadata.
pub fn parse_page(html: &str, base: &Url) -> PageExtract {
    let document = Html::parse_document(html);

    let mut links = Vec::new();
    let mut position = 0i32;
    for (sel_str, attr, kind) in EDGE_SOURCES {
        let Some(sel) = selector(sel_str) else { continue };
        for el in document.select(&sel) {
            let Some(raw) = el.value().attr(attr) else { continue };
            let Some(resolved) = normalize_url(base, raw) else { continue };
            let anchor_text = if *kind == LinkKind::Anchor {
                let t = el.text().collect::<String>().trim().to_string();
                (!t.is_empty()).then_some(t)
            } else {
                None
            };
            links.push(ExtractedLink {
                onion: link_onion(&resolved),
                scope: classify_link(base, &resolved),
                url: resolved.into(),
                anchor_text,
                kind: *kind,
                position,
            });
            position += 1;
        }
    }

    if let Some(target) = meta_refresh_target(&document) {
        if let Some(resolved) = normalize_url(base, &target) {
            links.push(ExtractedLink {
                onion: link_onion(&resolved),
                scope: classify_link(base, &resolved),
                url: resolved.into(),
                anchor_text: None,
                kind: LinkKind::MetaRefresh,
                position,
            });
        }
    }

    // Addresses only mentioned in text become root-URL discoveries.
    let linked: HashSet<&str> = links
        .iter()
        .filter_map(|l| l.onion.as_deref())
        .collect();
    let own_host = base.host_str().unwrap_or("");
    let text_onions = extract_all_onions(html)
        .into_iter()
        .filter(|addr| addr != own_host && !linked.contains(addr.as_str()))
        .collect();

    PageExtract {
        links,
        text_onions,
        metadata: extract_metadata(&document),
    }
}

fn selector(s: &str) -> Option<Selector> {
    Selector::parse(s).ok()
}

/// `<meta http-equiv="refresh" content="5; url=/new">` → `/new`.
fn meta_refresh_target(document: &Html) -> Option<String> {
    let sel = selector("meta[http-equiv]")?;
    for el in document.select(&sel) {
        let equiv = el.value().attr("http-equiv").unwrap_or("");
        if !equiv.eq_ignore_ascii_case("refresh") {
            continue;
        }
        let content = el.value().attr("content")?;
        let lower = content.to_ascii_lowercase();
        if let Some(idx) = lower.find("url=") {
            let target = content[idx + 4..].trim().trim_matches(['\'', '"']);
            if !target.is_empty() {
                return Some(target.to_string());
            }
        }
    }
    None
}

pub fn extract_metadata(document: &Html) -> PageMetadata {
    let title = selector("title")
        .and_then(|s| document.select(&s).next())
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
        .map(|t| cap_chars(t, MAX_TITLE_CHARS));

    let description = selector("meta[name='description'], meta[name='Description']")
        .and_then(|s| document.select(&s).next())
        .and_then(|el| el.value().attr("content"))
        .map(|d| cap_bytes(d.trim().to_string(), MAX_DESCRIPTION_BYTES))
        .filter(|d| !d.is_empty());

    let language = selector("html")
        .and_then(|s| document.select(&s).next())
        .and_then(|el| el.value().attr("lang").map(|s| s.to_string()));

    let h1 = selector("h1")
        .map(|s| {
            document
                .select(&s)
                .map(|el| el.text().collect::<String>().trim().to_string())
                .filter(|t| !t.is_empty())
                .take(MAX_H1_COUNT)
                .collect()
        })
        .unwrap_or_default();

    PageMetadata {
        title,
        description,
        language,
        h1,
    }
}

/// Visible page text: boilerplate and ad containers stripped, whitespace
/// collapsed, capped at 50 KiB.
pub fn extract_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut raw = String::new();
    let mut stack = vec![document.tree.root()];
    while let Some(node) = stack.pop() {
        if let Some(el) = node.value().as_element() {
            match el.name() {
                "script" | "style" | "nav" | "footer" | "header" | "aside" => continue,
                _ => {}
            }
            if el.classes().any(|c| c == "ad" || c == "advertisement") {
                continue;
            }
        }
        if let Some(text) = node.value().as_text() {
            raw.push_str(text);
            raw.push(' ');
        }
        // Reverse keeps document order on the stack.
        let children: Vec<_> = node.children().collect();
        stack.extend(children.into_iter().rev());
    }
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    cap_bytes(collapsed, MAX_TEXT_BYTES)
}

fn cap_chars(mut s: String, max: usize) -> String {
    if let Some((idx, _)) = s.char_indices().nth(max) {
        s.truncate(idx);
    }
    s
}

fn cap_bytes(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut idx = max;
        while !s.is_char_boundary(idx) {
            idx -= 1;
        }
        s.truncate(idx);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use asherah_core::types::LinkScope;

    const HOST: &str = "zqktlwiuavvvqqt4ybvgvi7tyo4hjl5xgfuvpdf6otjiycgwqbym2qad.onion";
    const OTHER: &str = "ciadotgov4sjwlzihbbgxnqg3xiyrg7so2r2o3lt5wz5ypk4sxyjstad.onion";
    const MENTIONED: &str = "dreadytofatroptsdj6io7l3xptbet6onoyno2yv7jicoxknyazubrad.onion";

    fn base() -> Url {
        Url::parse(&format!("http://{HOST}/")).unwrap()
    }

    #[test]
    fn extracts_edges_with_kinds() {
        let html = format!(
            r#"<html><body>
            <a href="/wiki">wiki</a>
            <img src="/logo.png">
            <script src="http://{OTHER}/t.js"></script>
            <form action="/search"></form>
            <iframe src="/frame"></iframe>
            </body></html>"#
        );
        let page = parse_page(&html, &base());
        let kinds: Vec<LinkKind> = page.links.iter().map(|l| l.kind).collect();
        assert_eq!(
            kinds,
            vec![
                LinkKind::Anchor,
                LinkKind::Image,
                LinkKind::Script,
                LinkKind::Frame,
                LinkKind::Form,
            ]
        );
        assert_eq!(page.links[0].anchor_text.as_deref(), Some("wiki"));
        assert_eq!(page.links[2].scope, LinkScope::Onion);
        assert_eq!(page.links[2].onion.as_deref(), Some(OTHER));
        // Positions are ordinal across the whole page.
        let positions: Vec<i32> = page.links.iter().map(|l| l.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn meta_refresh_is_an_edge() {
        let html = r#"<head><meta http-equiv="refresh" content="0; url=/moved"></head>"#;
        let page = parse_page(html, &base());
        assert_eq!(page.links.len(), 1);
        assert_eq!(page.links[0].kind, LinkKind::MetaRefresh);
        assert!(page.links[0].url.ends_with("/moved"));
    }

    #[test]
    fn text_only_mentions_are_separate() {
        let html = format!(
            r#"<body><a href="http://{OTHER}/">linked</a>
            <!-- hidden mirror: {MENTIONED} -->
            <code>backup at {MENTIONED}</code></body>"#
        );
        let page = parse_page(&html, &base());
        assert_eq!(page.text_onions, vec![MENTIONED.to_string()]);
    }

    #[test]
    fn own_host_is_not_a_text_discovery() {
        let html = format!("<body>welcome to {HOST}</body>");
        let page = parse_page(&html, &base());
        assert!(page.text_onions.is_empty());
    }

    #[test]
    fn error_pages_still_yield_links() {
        let html = format!(r#"<h1>404 Not Found</h1><a href="http://{OTHER}/">x</a>"#);
        let page = parse_page(&html, &base());
        assert_eq!(page.links.len(), 1);
        assert_eq!(page.links[0].onion.as_deref(), Some(OTHER));
    }

    #[test]
    fn metadata_extraction() {
        let html = r#"<html lang="en"><head><title> Hidden Wiki </title>
            <meta name="description" content="an index of services"></head>
            <body><h1>Main</h1><h1>Secondary</h1></body></html>"#;
        let meta = extract_metadata(&Html::parse_document(html));
        assert_eq!(meta.title.as_deref(), Some("Hidden Wiki"));
        assert_eq!(meta.description.as_deref(), Some("an index of services"));
        assert_eq!(meta.language.as_deref(), Some("en"));
        assert_eq!(meta.h1, vec!["Main", "Secondary"]);
    }

    #[test]
    fn text_strips_boilerplate_and_ads() {
        let html = r#"<body><nav>menu</nav><script>var x;</script>
            <div class="ad">buy now</div><p>real   content
            here</p><footer>foot</footer></body>"#;
        let text = extract_text(html);
        assert_eq!(text, "real content here");
    }

    #[test]
    fn text_is_capped() {
        let html = format!("<body>{}</body>", "word ".repeat(20_000));
        assert!(extract_text(&html).len() <= MAX_TEXT_BYTES);
    }
}
