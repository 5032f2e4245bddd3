use once_cell::sync::Lazy;
use regex::Regex;

/// v3 onion address: 56 base32 chars + ".onion".
static ONION_EXACT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z2-7]{56}\.onion$").unwrap());

static ONION_ANYWHERE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-z2-7]{56}\.onion").unwrap());

/// Validate a full string as a v3 onion address.
pub fn is_valid_onion(s: &str) -> bool {
    ONION_EXACT.is_match(s)
}

/// Extract the first v3 onion address occurring anywhere in arbitrary text.
pub fn extract_onion(text: &str) -> Option<&str> {
    ONION_ANYWHERE.find(text).map(|m| m.as_str())
}

/// Extract every v3 onion address mentioned in text, deduplicated,
/// in document order.
pub fn extract_all_onions(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ONION_ANYWHERE
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .filter(|addr| seen.insert(addr.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "zqktlwiuavvvqqt4ybvgvi7tyo4hjl5xgfuvpdf6otjiycgwqbym2qad.onion";

    #[test]
    fn accepts_v3_address() {
        assert!(is_valid_onion(VALID));
    }

    #[test]
    fn rejects_v2_and_malformed() {
        assert!(!is_valid_onion("expyuzz4wqqyqhjn.onion")); // v2, 16 chars
        assert!(!is_valid_onion("example.com"));
        assert!(!is_valid_onion(&VALID.to_uppercase()));
        assert!(!is_valid_onion(&format!("{VALID}x")));
        // base32 excludes 0, 1, 8, 9
        assert!(!is_valid_onion(
            "0qktlwiuavvvqqt4ybvgvi7tyo4hjl5xgfuvpdf6otjiycgwqbym2qad.onion"
        ));
    }

    #[test]
    fn extracts_from_surrounding_text() {
        let text = format!("find me at http://{VALID}/market soon");
        assert_eq!(extract_onion(&text), Some(VALID));
    }

    #[test]
    fn extractor_and_validator_agree() {
        let text = format!("a {VALID} b {VALID} c");
        for addr in extract_all_onions(&text) {
            assert!(is_valid_onion(&addr));
        }
        assert_eq!(extract_all_onions(&text).len(), 1);
    }

    #[test]
    fn extract_returns_none_on_plain_text() {
        assert_eq!(extract_onion("nothing hidden here"), None);
    }
}
