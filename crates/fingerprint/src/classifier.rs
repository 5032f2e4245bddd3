use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use asherah_core::types::InterestCategory;

/// Snippet cap for baseline storage and body comparison.
pub const SNIPPET_BYTES: usize = 512;

const SOFT_404_LENGTH_TOLERANCE: f64 = 0.10;
const SOFT_404_JACCARD: f64 = 0.85;

/// Reference response from a provably non-existent path, used to recognize
/// custom error pages that answer 200.
#[derive(Debug, Clone)]
pub struct Baseline {
    pub status: u16,
    pub content_length: i64,
    pub snippet: String,
}

impl Baseline {
    pub fn new(status: u16, content_length: i64, body: &str) -> Self {
        Self {
            status,
            content_length,
            snippet: snippet_of(body),
        }
    }
}

/// One brute-forced path response, as seen by the classifier.
#[derive(Debug)]
pub struct ProbeResponse<'a> {
    pub path: &'a str,
    pub status: u16,
    pub content_length: i64,
    pub body: &'a str,
    pub redirect_url: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub interesting: bool,
    pub category: Option<InterestCategory>,
}

impl Verdict {
    fn boring() -> Self {
        Self {
            interesting: false,
            category: None,
        }
    }

    fn hit(category: InterestCategory) -> Self {
        Self {
            interesting: true,
            category: Some(category),
        }
    }
}

pub fn snippet_of(body: &str) -> String {
    let mut idx = SNIPPET_BYTES.min(body.len());
    while !body.is_char_boundary(idx) {
        idx -= 1;
    }
    body[..idx].to_string()
}

static DOTFILE_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"/\.[^/]+/?$").unwrap());

static ADMIN_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)/(admin|administrator|adminer|manage|management|panel|dashboard|phpmyadmin|pma|cpanel|wp-admin|backend|console)([/.]|$)",
    )
    .unwrap()
});

static LOGIN_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(login|log-in|signin|sign-in|auth|session)").unwrap());

/// Phrases that mark a 200 response as a disguised error page.
static NOT_FOUND_PHRASES: &[&str] = &[
    "not found",
    "page not found",
    "file not found",
    "404",
    "error 404",
    "does not exist",
    "doesn't exist",
    "no longer available",
    "cannot be found",
    "could not be found",
    "no such file",
    "no such page",
    "nothing found",
    "page is missing",
    "page you requested",
];

/// (path pattern, body pattern) → category. Both must match.
static CONTENT_SIGNATURES: Lazy<Vec<(Regex, Regex, InterestCategory)>> = Lazy::new(|| {
    let entry = |path: &str, body: &str, cat: InterestCategory| {
        (Regex::new(path).unwrap(), Regex::new(body).unwrap(), cat)
    };
    vec![
        entry(
            r"\.env(\.|$)",
            r"(?m)^[A-Z][A-Z0-9_]*=\S",
            InterestCategory::CredentialsFile,
        ),
        entry(
            r"\.htpasswd$",
            r"(?m)^[^:\s]+:",
            InterestCategory::CredentialsFile,
        ),
        entry(
            r"id_(rsa|dsa|ecdsa|ed25519)$",
            r"BEGIN (RSA |OPENSSH |EC |DSA )?PRIVATE KEY",
            InterestCategory::CredentialsFile,
        ),
        entry(
            r"\.git/config$",
            r"\[core\]",
            InterestCategory::SourceControl,
        ),
        entry(
            r"\.git/HEAD$",
            r"^ref: refs/",
            InterestCategory::SourceControl,
        ),
        entry(
            r"robots\.txt$",
            r"(?mi)^(user-agent|disallow|allow|sitemap):",
            InterestCategory::RobotsSitemap,
        ),
        entry(
            r"sitemap[^/]*\.xml$",
            r"<(urlset|sitemapindex)",
            InterestCategory::RobotsSitemap,
        ),
        entry(
            r"(phpinfo|info)\.php$",
            r"(phpinfo\(\)|PHP Version)",
            InterestCategory::ServerInfo,
        ),
        entry(
            r"server-(status|info)$",
            r"(?i)(apache|server) (status|information)",
            InterestCategory::ServerInfo,
        ),
        entry(
            r"\.sql(\.|$)",
            r"(?i)(insert into|create table|mysqldump|pg_dump)",
            InterestCategory::DatabaseFile,
        ),
        entry(
            r"\.log$",
            r"\[?\d{4}[-/]\d{2}[-/]\d{2}",
            InterestCategory::LogFile,
        ),
        entry(
            r"(wp-config|config|configuration|settings)\.php(\.(bak|old|save|txt))?$",
            r"(?i)(define\s*\(|db_password|\$config)",
            InterestCategory::ConfigurationFile,
        ),
        entry(
            r"\.(ya?ml|ini|toml|conf)$",
            r"(?mi)^\s*[\w.-]+\s*[:=]",
            InterestCategory::ConfigurationFile,
        ),
    ]
});

/// Path-only category derivation, used for 401s and as the sensitive-path
/// fallback on 200s.
static PATH_CATEGORIES: Lazy<Vec<(Regex, InterestCategory)>> = Lazy::new(|| {
    let entry = |path: &str, cat: InterestCategory| (Regex::new(path).unwrap(), cat);
    vec![
        entry(
            r"(?i)(\.env|credentials|\.htpasswd|secrets?([/.]|$)|id_rsa|\.git-credentials)",
            InterestCategory::CredentialsFile,
        ),
        entry(
            r"(?i)(\.(bak|old|orig|save|swp)$|backups?([/.]|$)|\.(zip|tar|tar\.gz|tgz|rar|7z)$|dump([/.]|$))",
            InterestCategory::BackupFile,
        ),
        entry(r"(?i)(\.git|\.svn|\.hg)([/.]|$)", InterestCategory::SourceControl),
        entry(
            r"(?i)/(server-status|server-info|phpinfo\.php|info\.php)$",
            InterestCategory::ServerInfo,
        ),
        entry(
            r"(?i)\.(sql|db|sqlite3?|mdb)$|(?i)database([/.]|$)",
            InterestCategory::DatabaseFile,
        ),
        entry(r"(?i)(\.log$|/logs?([/.]|$)|_log$)", InterestCategory::LogFile),
        entry(
            r"(?i)(web\.config|\.htaccess|wp-config|config(uration)?\.(php|ya?ml|ini|js|json)|settings\.(py|php|json)|\.(ya?ml|ini|toml|conf)$)",
            InterestCategory::ConfigurationFile,
        ),
        entry(r"(?i)(robots\.txt|sitemap[^/]*\.xml)$", InterestCategory::RobotsSitemap),
        entry(
            r"(?i)/(private|\.ssh|tmp|temp|internal|hidden)([/.]|$)",
            InterestCategory::SensitiveDirectory,
        ),
    ]
});

fn is_dotfile_path(path: &str) -> bool {
    DOTFILE_PATH.is_match(path)
}

fn is_admin_path(path: &str) -> bool {
    ADMIN_PATH.is_match(path)
}

fn path_category(path: &str) -> Option<InterestCategory> {
    if is_admin_path(path) {
        return Some(InterestCategory::AdminPanel);
    }
    PATH_CATEGORIES
        .iter()
        .find(|(re, _)| re.is_match(path))
        .map(|(_, cat)| *cat)
}

/// Token-set Jaccard similarity between two body snippets.
fn jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<&str> = a.split_whitespace().collect();
    let set_b: HashSet<&str> = b.split_whitespace().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.len() + set_b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// A plain HTML page that mostly navigates somewhere else; used to veto the
/// sensitive-path fallback so custom index pages don't light up.
fn is_navigational_html(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    let looks_html = lower.contains("<html") || lower.contains("<!doctype");
    looks_html && lower.matches("<a ").count() >= 5
}

fn matches_not_found_phrase(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    NOT_FOUND_PHRASES.iter().any(|p| lower.contains(p))
}

fn is_soft_404(probe: &ProbeResponse<'_>, baseline: &Baseline) -> bool {
    if baseline.status != 200 {
        return false;
    }
    let tolerance = (baseline.content_length as f64 * SOFT_404_LENGTH_TOLERANCE).abs();
    if (probe.content_length - baseline.content_length).abs() as f64 <= tolerance {
        return true;
    }
    jaccard(&snippet_of(probe.body), &baseline.snippet) > SOFT_404_JACCARD
}

/// Apply the interest rules to one probed path.
pub fn classify(probe: &ProbeResponse<'_>, baseline: Option<&Baseline>) -> Verdict {
    match probe.status {
        404 | 410 => Verdict::boring(),
        s if s >= 500 => Verdict::boring(),

        403 => {
            if is_dotfile_path(probe.path) {
                // Server-wide deny rule for dotfiles, not a finding.
                Verdict::boring()
            } else if is_admin_path(probe.path) {
                Verdict::hit(InterestCategory::AdminPanel)
            } else {
                Verdict::boring()
            }
        }

        401 => Verdict::hit(path_category(probe.path).unwrap_or(InterestCategory::Other)),

        301 | 302 => {
            let to_login = probe
                .redirect_url
                .map(|u| LOGIN_URL.is_match(u))
                .unwrap_or(false);
            if is_admin_path(probe.path) && to_login {
                Verdict::hit(InterestCategory::AdminPanel)
            } else {
                Verdict::boring()
            }
        }

        200 => {
            if let Some(baseline) = baseline {
                if is_soft_404(probe, baseline) {
                    return Verdict::boring();
                }
            }
            if matches_not_found_phrase(probe.body) {
                return Verdict::boring();
            }
            for (path_re, body_re, category) in CONTENT_SIGNATURES.iter() {
                if path_re.is_match(probe.path) && body_re.is_match(probe.body) {
                    return Verdict::hit(*category);
                }
            }
            match path_category(probe.path) {
                Some(category) if !is_navigational_html(probe.body) => Verdict::hit(category),
                _ => Verdict::boring(),
            }
        }

        _ => Verdict::boring(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe<'a>(path: &'a str, status: u16, body: &'a str) -> ProbeResponse<'a> {
        ProbeResponse {
            path,
            status,
            content_length: body.len() as i64,
            body,
            redirect_url: None,
        }
    }

    #[test]
    fn hard_errors_are_boring() {
        for status in [404, 410, 500, 502, 503] {
            assert!(!classify(&probe("/admin", status, "x"), None).interesting);
        }
    }

    #[test]
    fn dotfile_403_is_policy_noise() {
        assert!(!classify(&probe("/.env", 403, ""), None).interesting);
        assert!(!classify(&probe("/.git", 403, ""), None).interesting);
    }

    #[test]
    fn admin_403_is_a_panel() {
        let verdict = classify(&probe("/admin", 403, ""), None);
        assert!(verdict.interesting);
        assert_eq!(verdict.category, Some(InterestCategory::AdminPanel));
    }

    #[test]
    fn any_401_is_interesting() {
        let verdict = classify(&probe("/backup.zip", 401, ""), None);
        assert!(verdict.interesting);
        assert_eq!(verdict.category, Some(InterestCategory::BackupFile));

        let verdict = classify(&probe("/whatever", 401, ""), None);
        assert_eq!(verdict.category, Some(InterestCategory::Other));
    }

    #[test]
    fn admin_redirect_to_login() {
        let response = ProbeResponse {
            path: "/admin",
            status: 302,
            content_length: 0,
            body: "",
            redirect_url: Some("/login?next=/admin"),
        };
        let verdict = classify(&response, None);
        assert!(verdict.interesting);
        assert_eq!(verdict.category, Some(InterestCategory::AdminPanel));

        let elsewhere = ProbeResponse {
            redirect_url: Some("/home"),
            ..response
        };
        assert!(!classify(&elsewhere, None).interesting);
    }

    #[test]
    fn soft_404_by_length() {
        let baseline = Baseline::new(200, 4200, "Welcome");
        let response = ProbeResponse {
            path: "/admin",
            status: 200,
            content_length: 4180,
            body: "Welcome",
            redirect_url: None,
        };
        assert!(!classify(&response, Some(&baseline)).interesting);
    }

    #[test]
    fn env_file_with_credentials() {
        let baseline = Baseline::new(200, 4200, "Welcome");
        let response = ProbeResponse {
            path: "/.env",
            status: 200,
            content_length: 420,
            body: "DB_PASSWORD=secret",
            redirect_url: None,
        };
        let verdict = classify(&response, Some(&baseline));
        assert!(verdict.interesting);
        assert_eq!(verdict.category, Some(InterestCategory::CredentialsFile));
    }

    #[test]
    fn soft_404_by_similarity() {
        let page = "Sorry, we could not locate that resource on this server anywhere";
        let baseline = Baseline::new(200, 10_000, page);
        let response = ProbeResponse {
            path: "/secret",
            status: 200,
            content_length: 64,
            body: page,
            redirect_url: None,
        };
        assert!(!classify(&response, Some(&baseline)).interesting);
    }

    #[test]
    fn not_found_phrase_kills_interest() {
        let response = probe("/backup.zip", 200, "<h1>Page Not Found</h1>");
        assert!(!classify(&response, None).interesting);
    }

    #[test]
    fn git_config_detected_by_content() {
        let body = "[core]\n\trepositoryformatversion = 0";
        let verdict = classify(&probe("/.git/config", 200, body), None);
        assert!(verdict.interesting);
        assert_eq!(verdict.category, Some(InterestCategory::SourceControl));
    }

    #[test]
    fn sensitive_path_fallback_vetoed_by_navigational_html() {
        let nav = r#"<html><body><a href=1></a><a href=2></a><a href=3></a>
            <a href=4></a><a href=5></a></body></html>"#;
        assert!(!classify(&probe("/backup", 200, nav), None).interesting);

        let verdict = classify(&probe("/backup.tar.gz", 200, "PK binary"), None);
        assert!(verdict.interesting);
        assert_eq!(verdict.category, Some(InterestCategory::BackupFile));
    }

    #[test]
    fn sql_dump_by_content() {
        let verdict = classify(
            &probe("/dump.sql", 200, "-- MySQL dump\nCREATE TABLE users (id int);"),
            None,
        );
        assert!(verdict.interesting);
        assert_eq!(verdict.category, Some(InterestCategory::DatabaseFile));
    }

    #[test]
    fn plain_200_with_no_signal_is_boring() {
        assert!(!classify(&probe("/about", 200, "<p>hello</p>"), None).interesting);
    }

    #[test]
    fn jaccard_bounds() {
        assert_eq!(jaccard("a b c", "a b c"), 1.0);
        assert_eq!(jaccard("a b", "c d"), 0.0);
        let half = jaccard("a b c", "a b d");
        assert!(half > 0.0 && half < 1.0);
    }

    #[test]
    fn plain_403_is_boring() {
        assert!(!classify(&probe("/uploads", 403, ""), None).interesting);
    }

    #[test]
    fn error_baseline_disables_soft_404_checks() {
        // Server 404s properly, so a 200 with matching length is a real page.
        let baseline = Baseline::new(404, 180, "not found");
        let verdict = classify(&probe("/.env", 200, "API_KEY=abc123"), Some(&baseline));
        assert!(verdict.interesting);
        assert_eq!(verdict.category, Some(InterestCategory::CredentialsFile));
    }

    #[test]
    fn robots_txt_by_content() {
        let verdict = classify(
            &probe("/robots.txt", 200, "User-agent: *\nDisallow: /private\n"),
            None,
        );
        assert!(verdict.interesting);
        assert_eq!(verdict.category, Some(InterestCategory::RobotsSitemap));
    }

    #[test]
    fn htpasswd_by_content() {
        let verdict = classify(&probe("/.htpasswd", 200, "admin:$apr1$xyz"), None);
        assert!(verdict.interesting);
        assert_eq!(verdict.category, Some(InterestCategory::CredentialsFile));
    }

    #[test]
    fn log_file_by_content() {
        let body = "[2024-03-01 12:00:01] production.ERROR: boom";
        let verdict = classify(&probe("/debug.log", 200, body), None);
        assert!(verdict.interesting);
        assert_eq!(verdict.category, Some(InterestCategory::LogFile));
    }

    #[test]
    fn admin_401_stays_admin_panel() {
        let verdict = classify(&probe("/admin", 401, ""), None);
        assert!(verdict.interesting);
        assert_eq!(verdict.category, Some(InterestCategory::AdminPanel));
    }

    #[test]
    fn snippet_respects_utf8_boundaries() {
        let body = "é".repeat(600);
        let snippet = snippet_of(&body);
        assert!(snippet.len() <= SNIPPET_BYTES);
        assert!(snippet.chars().all(|c| c == 'é'));
    }
}
