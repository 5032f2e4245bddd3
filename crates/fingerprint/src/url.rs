use asherah_core::types::LinkScope;
use url::Url;

use crate::onion;

/// Resolve a raw href against its page and return a canonical absolute URL,
/// or None when the href is not crawlable. Hosts are lowercased (onion
/// labels are defined lowercase); path casing is preserved.
pub fn normalize_url(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let lower = href.to_ascii_lowercase();
    if lower.starts_with("javascript:")
        || lower.starts_with("mailto:")
        || lower.starts_with("tel:")
        || lower.starts_with("data:")
    {
        return None;
    }

    // Url::join handles protocol-relative (//host/..), absolute-path (/foo)
    // and bare-path forms in one place.
    let mut resolved = match Url::parse(href) {
        Ok(abs) => abs,
        Err(url::ParseError::RelativeUrlWithoutBase) => base.join(href).ok()?,
        Err(_) => return None,
    };

    if resolved.scheme() != "http" && resolved.scheme() != "https" {
        return None;
    }
    resolved.set_fragment(None);
    resolved.host_str()?;

    // Url::parse already lowercases the host for http(s) URLs, which is the
    // casing the onion validator requires; path casing is left alone.
    Some(resolved)
}

/// Whether the URL points at the root of its service.
pub fn is_root_path(url: &Url) -> bool {
    matches!(url.path(), "" | "/")
}

/// Root URL for an onion address.
pub fn root_url(onion_address: &str) -> String {
    format!("http://{onion_address}/")
}

/// Classify a resolved edge relative to the page that sourced it.
pub fn classify_link(base: &Url, resolved: &Url) -> LinkScope {
    let base_host = base.host_str().unwrap_or("");
    let host = resolved.host_str().unwrap_or("");
    if host == base_host {
        LinkScope::Internal
    } else if host.ends_with(".onion") {
        LinkScope::Onion
    } else {
        LinkScope::External
    }
}

/// The onion address an edge points at, when it points at one at all.
pub fn link_onion(resolved: &Url) -> Option<String> {
    let host = resolved.host_str()?;
    onion::is_valid_onion(host).then(|| host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "zqktlwiuavvvqqt4ybvgvi7tyo4hjl5xgfuvpdf6otjiycgwqbym2qad.onion";
    const OTHER: &str = "ciadotgov4sjwlzihbbgxnqg3xiyrg7so2r2o3lt5wz5ypk4sxyjstad.onion";

    fn base() -> Url {
        Url::parse(&format!("http://{HOST}/wiki/index.html")).unwrap()
    }

    #[test]
    fn rejects_non_crawlable_schemes() {
        let base = base();
        for href in [
            "",
            "#top",
            "#",
            "mailto:admin@example.com",
            "javascript:void(0)",
            "data:text/plain;base64,aGk=",
            "tel:+15551234",
        ] {
            assert_eq!(normalize_url(&base, href), None, "href {href:?}");
        }
    }

    #[test]
    fn resolves_relative_forms() {
        let base = base();
        assert_eq!(
            normalize_url(&base, "/login").unwrap().as_str(),
            format!("http://{HOST}/login")
        );
        assert_eq!(
            normalize_url(&base, "page2.html").unwrap().as_str(),
            format!("http://{HOST}/wiki/page2.html")
        );
        assert_eq!(
            normalize_url(&base, &format!("//{OTHER}/x")).unwrap().as_str(),
            format!("http://{OTHER}/x")
        );
    }

    #[test]
    fn strips_fragment_keeps_query() {
        let base = base();
        assert_eq!(
            normalize_url(&base, "/p?q=1#section").unwrap().as_str(),
            format!("http://{HOST}/p?q=1")
        );
    }

    #[test]
    fn lowercases_host_preserves_path() {
        let base = base();
        let href = format!("http://{}/Admin/Login", HOST.to_uppercase());
        let url = normalize_url(&base, &href).unwrap();
        assert_eq!(url.host_str(), Some(HOST));
        assert_eq!(url.path(), "/Admin/Login");
    }

    #[test]
    fn normalization_is_idempotent() {
        let base = base();
        for href in ["/a/b?x=1", "rel", &format!("//{OTHER}/"), "/p#frag"] {
            let once = normalize_url(&base, href).unwrap();
            let twice = normalize_url(&base, once.as_str()).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn classifies_edges() {
        let base = base();
        let internal = normalize_url(&base, "/x").unwrap();
        let onion = normalize_url(&base, &format!("http://{OTHER}/")).unwrap();
        let external = normalize_url(&base, "https://example.com/").unwrap();
        assert_eq!(classify_link(&base, &internal), LinkScope::Internal);
        assert_eq!(classify_link(&base, &onion), LinkScope::Onion);
        assert_eq!(classify_link(&base, &external), LinkScope::External);
        assert_eq!(link_onion(&onion).as_deref(), Some(OTHER));
        assert_eq!(link_onion(&external), None);
    }

    #[test]
    fn root_path_detection() {
        assert!(is_root_path(&Url::parse(&root_url(HOST)).unwrap()));
        assert!(!is_root_path(&base()));
    }

    #[test]
    fn non_http_schemes_are_rejected() {
        let base = base();
        assert_eq!(normalize_url(&base, "ftp://example.com/file"), None);
        assert_eq!(normalize_url(&base, "irc://example.com/chan"), None);
    }

    #[test]
    fn https_is_kept() {
        let url = normalize_url(&base(), &format!("https://{OTHER}/")).unwrap();
        assert_eq!(url.scheme(), "https");
    }

    #[test]
    fn whitespace_is_trimmed() {
        let url = normalize_url(&base(), "  /padded  ").unwrap();
        assert_eq!(url.path(), "/padded");
    }
}
