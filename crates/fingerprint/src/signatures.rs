use once_cell::sync::Lazy;
use regex::Regex;

use asherah_core::types::DetectedService;

const SCORE_PORT: u8 = 30;
const SCORE_PATTERN: u8 = 40;
const SCORE_VERSION: u8 = 20;
const MIN_CONFIDENCE: u8 = 30;

const WEB_PORTS: &[u16] = &[80, 443, 3000, 5000, 8000, 8008, 8080, 8081, 8118, 8443, 8888, 9000];

const HTTP_PROBE: &[u8] = b"GET / HTTP/1.0\r\n\r\n";
const REDIS_PROBE: &[u8] = b"PING\r\n";

struct Signature {
    service: &'static str,
    /// First matching pattern wins; patterns do not stack.
    patterns: Vec<Regex>,
    ports: &'static [u16],
    version: Option<Regex>,
    /// Written to the socket before the banner read.
    probe: Option<&'static [u8]>,
}

fn sig(
    service: &'static str,
    patterns: &[&str],
    ports: &'static [u16],
    version: Option<&str>,
    probe: Option<&'static [u8]>,
) -> Signature {
    Signature {
        service,
        patterns: patterns.iter().map(|p| Regex::new(p).unwrap()).collect(),
        ports,
        version: version.map(|v| Regex::new(v).unwrap()),
        probe,
    }
}

/// Declaration order is the tie-break: more specific services come first.
static SIGNATURES: Lazy<Vec<Signature>> = Lazy::new(|| {
    vec![
        sig(
            "ssh",
            &["(?i)^SSH-"],
            &[22, 2222],
            Some(r"SSH-[\d.]+-(\S+)"),
            None,
        ),
        sig(
            "ftp",
            &["(?i)^220[ -].*ftp", "(?i)vsftpd", "(?i)proftpd", "(?i)pure-ftpd"],
            &[21, 2121],
            Some(r"(?i)(?:vsFTPd|ProFTPD)[ /]?([\d.]+[a-z]?)"),
            None,
        ),
        sig(
            "smtp",
            &["(?i)^220[ -].*(?:smtp|esmtp)", "(?i)postfix", "(?i)exim"],
            &[25, 465, 587],
            Some(r"(?i)ESMTP\s+(\S+)"),
            None,
        ),
        sig("pop3", &[r"(?i)^\+OK.*pop", "(?i)dovecot.*pop"], &[110, 995], None, None),
        sig(
            "imap",
            &[r"(?i)^\* OK.*imap", "(?i)dovecot"],
            &[143, 993],
            None,
            None,
        ),
        sig(
            "redis",
            &[r"^\+PONG", "(?i)-NOAUTH", "(?i)redis_version"],
            &[6379],
            Some(r"redis_version:([\d.]+)"),
            Some(REDIS_PROBE),
        ),
        sig(
            "mysql",
            &["(?i)mysql", "(?i)mariadb"],
            &[3306],
            Some(r"(\d+\.\d+\.\d+(?:-MariaDB)?)"),
            None,
        ),
        sig(
            "postgresql",
            &["(?i)postgres", "SCRAM-SHA-256"],
            &[5432],
            None,
            None,
        ),
        sig(
            "mongodb",
            &["(?i)mongodb", "(?i)trying to access MongoDB"],
            &[27017, 27018],
            None,
            None,
        ),
        sig("vnc", &["^RFB "], &[5900, 5901], Some(r"^RFB (\d{3}\.\d{3})"), None),
        sig("telnet", &["(?i)login:", "(?i)telnet"], &[23], None, None),
        sig(
            "irc",
            &[r"(?i)^:\S+ NOTICE", "(?i)ircd", "(?i)looking up your hostname"],
            &[6666, 6667, 6697, 7000],
            None,
            None,
        ),
        sig(
            "xmpp",
            &["(?i)<stream:stream", "(?i)jabber"],
            &[5222, 5269],
            None,
            None,
        ),
        sig(
            "bitcoin",
            &["(?i)satoshi", "(?i)bitcoin"],
            &[8332, 8333, 18332, 18333],
            Some(r"(?i)Satoshi:([\d.]+)"),
            None,
        ),
        sig("monero", &["(?i)monero"], &[18080, 18081, 18089], None, None),
        sig(
            "tor-control",
            &["(?i)514 authentication required"],
            &[9051],
            None,
            None,
        ),
        sig(
            "nginx",
            &["(?i)nginx"],
            WEB_PORTS,
            Some(r"(?i)nginx/([\d.]+)"),
            None,
        ),
        sig(
            "apache",
            &["(?i)apache"],
            WEB_PORTS,
            Some(r"(?i)Apache/([\d.]+)"),
            None,
        ),
        sig(
            "lighttpd",
            &["(?i)lighttpd"],
            WEB_PORTS,
            Some(r"(?i)lighttpd/([\d.]+)"),
            None,
        ),
        sig(
            "http",
            &["(?i)^HTTP/", "(?i)<html", "(?i)<!doctype"],
            WEB_PORTS,
            Some(r"(?i)Server:\s*([^\r\n]+)"),
            Some(HTTP_PROBE),
        ),
    ]
});

/// What to write to a freshly-connected socket before reading the banner.
/// HTTP-ish ports get a bare GET, Redis gets PING; silent protocols get
/// nothing and rely on the server talking first.
pub fn probe_string(port: u16) -> Option<&'static [u8]> {
    SIGNATURES
        .iter()
        .find(|s| s.probe.is_some() && s.ports.contains(&port))
        .and_then(|s| s.probe)
}

/// Match a banner against the signature table. Deterministic: the highest
/// score wins, ties go to the earliest declared signature, and nothing
/// below confidence 30 is reported. No banner, no detection.
pub fn detect_service(port: u16, banner: Option<&str>) -> Option<DetectedService> {
    let banner = banner?;
    if banner.is_empty() {
        return None;
    }

    let mut best: Option<DetectedService> = None;
    for signature in SIGNATURES.iter() {
        let mut confidence = 0u8;
        if signature.ports.contains(&port) {
            confidence += SCORE_PORT;
        }
        if signature.patterns.iter().any(|p| p.is_match(banner)) {
            confidence += SCORE_PATTERN;
        }
        let version = signature.version.as_ref().and_then(|re| {
            re.captures(banner)
                .and_then(|c| c.get(1).or_else(|| c.get(0)))
                .map(|m| m.as_str().trim().to_string())
        });
        if version.is_some() {
            confidence += SCORE_VERSION;
        }
        let confidence = confidence.min(100);
        if confidence < MIN_CONFIDENCE {
            continue;
        }
        if best.as_ref().map_or(true, |b| confidence > b.confidence) {
            best = Some(DetectedService {
                port,
                service: signature.service.to_string(),
                version,
                confidence,
                banner: banner.to_string(),
            });
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_banner_scores_ninety() {
        let detected = detect_service(22, Some("SSH-2.0-OpenSSH_8.9p1")).unwrap();
        assert_eq!(detected.service, "ssh");
        assert_eq!(detected.version.as_deref(), Some("OpenSSH_8.9p1"));
        assert_eq!(detected.confidence, 90);
    }

    #[test]
    fn no_banner_no_detection() {
        assert_eq!(detect_service(22, None), None);
        assert_eq!(detect_service(22, Some("")), None);
    }

    #[test]
    fn pattern_alone_beats_threshold_off_port() {
        let detected = detect_service(2200, Some("SSH-2.0-dropbear")).unwrap();
        assert_eq!(detected.service, "ssh");
        assert_eq!(detected.confidence, 60); // pattern + version, no port
    }

    #[test]
    fn unknown_banner_on_known_port_is_port_only() {
        let detected = detect_service(6379, Some("garbage noise")).unwrap();
        assert_eq!(detected.service, "redis");
        assert_eq!(detected.confidence, 30);
    }

    #[test]
    fn redis_pong() {
        let detected = detect_service(6379, Some("+PONG\r\n")).unwrap();
        assert_eq!(detected.service, "redis");
        assert_eq!(detected.confidence, 70);
    }

    #[test]
    fn specific_server_beats_generic_http() {
        let banner = "HTTP/1.1 200 OK\r\nServer: nginx/1.18.0\r\n\r\n<html>";
        let detected = detect_service(80, Some(banner)).unwrap();
        assert_eq!(detected.service, "nginx");
        assert_eq!(detected.version.as_deref(), Some("1.18.0"));
        assert_eq!(detected.confidence, 90);
    }

    #[test]
    fn confidence_is_bounded() {
        for (port, banner) in [
            (22u16, "SSH-2.0-OpenSSH_9.6"),
            (80, "HTTP/1.0 200 OK\r\nServer: Apache/2.4.57"),
            (3306, "5.7.42-MariaDB mysql native password"),
        ] {
            let d = detect_service(port, Some(banner)).unwrap();
            assert!(d.confidence <= 100);
            assert!(d.confidence >= MIN_CONFIDENCE);
        }
    }

    #[test]
    fn detection_is_deterministic() {
        let a = detect_service(80, Some("HTTP/1.1 404 Not Found"));
        let b = detect_service(80, Some("HTTP/1.1 404 Not Found"));
        assert_eq!(a, b);
    }

    #[test]
    fn probe_strings() {
        assert_eq!(probe_string(80), Some(HTTP_PROBE));
        assert_eq!(probe_string(8080), Some(HTTP_PROBE));
        assert_eq!(probe_string(6379), Some(REDIS_PROBE));
        assert_eq!(probe_string(22), None);
    }

    #[test]
    fn ftp_banner() {
        let detected = detect_service(21, Some("220 (vsFTPd 3.0.5)")).unwrap();
        assert_eq!(detected.service, "ftp");
        assert_eq!(detected.version.as_deref(), Some("3.0.5"));
        assert_eq!(detected.confidence, 90);
    }

    #[test]
    fn vnc_banner() {
        let detected = detect_service(5900, Some("RFB 003.008\n")).unwrap();
        assert_eq!(detected.service, "vnc");
        assert_eq!(detected.version.as_deref(), Some("003.008"));
    }

    #[test]
    fn bitcoin_user_agent() {
        let detected = detect_service(8333, Some("/Satoshi:25.1.0/")).unwrap();
        assert_eq!(detected.service, "bitcoin");
        assert_eq!(detected.version.as_deref(), Some("25.1.0"));
        assert_eq!(detected.confidence, 90);
    }

    #[test]
    fn equal_scores_go_to_earliest_declaration() {
        // Both nginx and apache match the pattern on a web port; neither
        // version regex fires. nginx is declared first.
        let detected = detect_service(80, Some("mixed nginx apache stack")).unwrap();
        assert_eq!(detected.service, "nginx");
        assert_eq!(detected.confidence, 70);
    }

    #[test]
    fn score_below_threshold_is_dropped() {
        // No port hit, no pattern: nothing to report.
        assert_eq!(detect_service(12345, Some("hello world")), None);
    }
}
