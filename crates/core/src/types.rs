use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Result of probing one TCP port through the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortState {
    Open,
    Closed,
    Filtered,
    Timeout,
}

impl PortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::Open => "open",
            PortState::Closed => "closed",
            PortState::Filtered => "filtered",
            PortState::Timeout => "timeout",
        }
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Port-selection profile for the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanProfile {
    Quick,
    #[default]
    Standard,
    Full,
    Crypto,
}

impl ScanProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanProfile::Quick => "quick",
            ScanProfile::Standard => "standard",
            ScanProfile::Full => "full",
            ScanProfile::Crypto => "crypto",
        }
    }

    /// Default port list for the profile.
    pub fn ports(&self) -> &'static [u16] {
        match self {
            ScanProfile::Quick => QUICK_PORTS,
            ScanProfile::Standard => STANDARD_PORTS,
            ScanProfile::Full => FULL_PORTS,
            ScanProfile::Crypto => CRYPTO_PORTS,
        }
    }
}

impl FromStr for ScanProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(ScanProfile::Quick),
            "standard" => Ok(ScanProfile::Standard),
            "full" => Ok(ScanProfile::Full),
            "crypto" => Ok(ScanProfile::Crypto),
            other => Err(format!("unknown scan profile: {other}")),
        }
    }
}

const QUICK_PORTS: &[u16] = &[21, 22, 80, 443, 8080];

const STANDARD_PORTS: &[u16] = &[
    21, 22, 23, 25, 53, 80, 110, 143, 443, 465, 587, 993, 995, 1080, 3306, 5432, 6379, 8000, 8080,
    8443, 9000, 9050, 9051, 9090, 27017,
];

const FULL_PORTS: &[u16] = &[
    20, 21, 22, 23, 25, 37, 43, 53, 69, 70, 79, 80, 88, 102, 110, 111, 113, 119, 123, 135, 137,
    138, 139, 143, 161, 179, 194, 389, 443, 444, 445, 465, 500, 512, 513, 514, 515, 520, 546, 547,
    554, 587, 631, 636, 646, 873, 902, 989, 990, 993, 995, 1025, 1080, 1194, 1433, 1434, 1521,
    1723, 1883, 2049, 2082, 2083, 2181, 2375, 2376, 3000, 3128, 3268, 3306, 3389, 4369, 4443,
    4444, 5000, 5060, 5222, 5269, 5432, 5555, 5672, 5900, 5984, 6000, 6379, 6666, 6667, 6697,
    7000, 7001, 8000, 8008, 8080, 8081, 8088, 8118, 8333, 8443, 8888, 9000, 9001, 9050, 9051,
    9090, 9100, 9200, 9300, 9418, 9735, 10000, 11211, 27017, 50000,
];

const CRYPTO_PORTS: &[u16] = &[
    3333, 4444, 8232, 8233, 8332, 8333, 8545, 8546, 9332, 9333, 9735, 9998, 9999, 10009, 18080,
    18081, 18082, 18083, 18089, 18332, 18333, 19332, 22555, 22556, 30303, 50001, 50002, 51235,
    52521, 52523,
];

/// Wordlist profile for the directory scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirscanProfile {
    Quick,
    #[default]
    Standard,
    Full,
}

impl DirscanProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirscanProfile::Quick => "quick",
            DirscanProfile::Standard => "standard",
            DirscanProfile::Full => "full",
        }
    }
}

impl FromStr for DirscanProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(DirscanProfile::Quick),
            "standard" => Ok(DirscanProfile::Standard),
            "full" => Ok(DirscanProfile::Full),
            other => Err(format!("unknown dirscan profile: {other}")),
        }
    }
}

/// Which HTML element sourced an edge. Recorded for later weighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Anchor,
    Image,
    Script,
    Stylesheet,
    Frame,
    Form,
    Media,
    Source,
    Object,
    Embed,
    Base,
    MetaRefresh,
}

impl LinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkKind::Anchor => "a",
            LinkKind::Image => "img",
            LinkKind::Script => "script",
            LinkKind::Stylesheet => "link",
            LinkKind::Frame => "frame",
            LinkKind::Form => "form",
            LinkKind::Media => "media",
            LinkKind::Source => "source",
            LinkKind::Object => "object",
            LinkKind::Embed => "embed",
            LinkKind::Base => "base",
            LinkKind::MetaRefresh => "meta_refresh",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkScope {
    Internal,
    External,
    Onion,
}

impl LinkScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkScope::Internal => "internal",
            LinkScope::External => "external",
            LinkScope::Onion => "onion",
        }
    }
}

/// One outgoing edge extracted from a page.
#[derive(Debug, Clone)]
pub struct ExtractedLink {
    pub url: String,
    /// Target onion address when the edge points at a hidden service.
    pub onion: Option<String>,
    pub anchor_text: Option<String>,
    pub scope: LinkScope,
    pub kind: LinkKind,
    /// Ordinal position within the page.
    pub position: i32,
}

#[derive(Debug, Clone, Default)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    pub h1: Vec<String>,
}

/// What the crawler persists for one fetched URL.
#[derive(Debug, Clone)]
pub struct PageDocument {
    pub url: String,
    pub onion_address: String,
    pub path: String,
    pub status: i32,
    pub content_size: i64,
    pub body_text: String,
    /// Raw HTML, kept only for HTML responses.
    pub body_html: Option<String>,
    pub metadata: PageMetadata,
    pub headers: HashMap<String, String>,
    pub links: Vec<ExtractedLink>,
    pub fetched_at: chrono::DateTime<chrono::Utc>,
}

/// HTTP response as returned by the transport. Error statuses are data,
/// not failures.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: url::Url,
    pub status: u16,
    /// Header names normalized to lowercase.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub truncated: bool,
    pub content_type: Option<String>,
    pub response_time_ms: u64,
}

impl FetchedResponse {
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.contains("text/html") || ct.contains("application/xhtml"))
            .unwrap_or(true)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Leased crawl-queue row.
#[derive(Debug, Clone)]
pub struct CrawlItem {
    pub id: i64,
    pub url: String,
    pub onion_address: String,
    pub priority: i32,
    pub attempts: i32,
}

/// Leased scan-queue row.
#[derive(Debug, Clone)]
pub struct ScanItem {
    pub id: i64,
    pub onion_address: String,
    pub profile: ScanProfile,
    /// Explicit port list overriding the profile, when present.
    pub ports: Option<Vec<u16>>,
    pub attempts: i32,
}

/// Leased dirscan-queue row.
#[derive(Debug, Clone)]
pub struct DirscanItem {
    pub id: i64,
    pub onion_address: String,
    pub profile: DirscanProfile,
    pub attempts: i32,
}

#[derive(Debug, Clone)]
pub struct PortObservation {
    pub port: u16,
    pub state: PortState,
    pub response_time_ms: u64,
    /// First 4 KiB read after connect, when anything arrived.
    pub banner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedService {
    pub port: u16,
    pub service: String,
    pub version: Option<String>,
    /// 0..=100.
    pub confidence: u8,
    pub banner: String,
}

/// Category assigned to an interesting dirscan hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestCategory {
    CredentialsFile,
    BackupFile,
    SourceControl,
    AdminPanel,
    ServerInfo,
    SensitiveDirectory,
    ConfigurationFile,
    LogFile,
    DatabaseFile,
    RobotsSitemap,
    Other,
}

impl InterestCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterestCategory::CredentialsFile => "credentials_file",
            InterestCategory::BackupFile => "backup_file",
            InterestCategory::SourceControl => "source_control",
            InterestCategory::AdminPanel => "admin_panel",
            InterestCategory::ServerInfo => "server_info",
            InterestCategory::SensitiveDirectory => "sensitive_directory",
            InterestCategory::ConfigurationFile => "configuration_file",
            InterestCategory::LogFile => "log_file",
            InterestCategory::DatabaseFile => "database_file",
            InterestCategory::RobotsSitemap => "robots_sitemap",
            InterestCategory::Other => "other",
        }
    }
}

/// One probed path, as persisted by the dirscanner.
#[derive(Debug, Clone)]
pub struct DirObservation {
    pub path: String,
    pub status: i32,
    pub content_length: i64,
    pub content_type: Option<String>,
    pub response_time_ms: u64,
    pub server_header: Option<String>,
    pub redirect_url: Option<String>,
    /// At most 512 bytes of body.
    pub body_snippet: String,
    pub interesting: bool,
    pub category: Option<InterestCategory>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_port_counts() {
        assert_eq!(ScanProfile::Quick.ports().len(), 5);
        assert_eq!(ScanProfile::Standard.ports().len(), 25);
        assert!(ScanProfile::Full.ports().len() >= 100);
        assert_eq!(ScanProfile::Crypto.ports().len(), 30);
    }

    #[test]
    fn profiles_parse_round_trip() {
        for p in [
            ScanProfile::Quick,
            ScanProfile::Standard,
            ScanProfile::Full,
            ScanProfile::Crypto,
        ] {
            assert_eq!(p.as_str().parse::<ScanProfile>().unwrap(), p);
        }
        assert!("aggressive".parse::<ScanProfile>().is_err());
        assert_eq!(
            "standard".parse::<DirscanProfile>().unwrap(),
            DirscanProfile::Standard
        );
    }

    #[test]
    fn html_detection_defaults_to_true_without_content_type() {
        let resp = FetchedResponse {
            final_url: url::Url::parse("http://example.onion/").unwrap(),
            status: 200,
            headers: HashMap::new(),
            body: Vec::new(),
            truncated: false,
            content_type: None,
            response_time_ms: 0,
        };
        assert!(resp.is_html());
    }
}
