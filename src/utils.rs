use std::time::Duration;
use url::Url;

/// Compact elapsed time for log lines: `350ms`, `4.2s`, `3m 7s`, `1h 2m 3s`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match (secs / 3600, secs % 3600 / 60, secs % 60) {
        (0, 0, 0) => format!("{}ms", duration.subsec_millis()),
        (0, 0, s) => format!("{s}.{}s", duration.subsec_millis() / 100),
        (0, m, s) => format!("{m}m {s}s"),
        (h, m, s) => format!("{h}h {m}m {s}s"),
    }
}

/// Key used for per-host connection accounting: `host:port`, with the
/// scheme's default port filled in.
pub fn host_key(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    match parsed.scheme() {
        "http" | "https" => {}
        _ => return None,
    }

    let host = parsed.host_str()?;
    let port = parsed.port_or_known_default()?;
    Some(format!("{host}:{port}"))
}

/// Bytes per second over `elapsed`, counting partial seconds as a whole one.
pub fn throughput(bytes: usize, elapsed: Duration) -> usize {
    bytes / (elapsed.as_secs() as usize + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_millis(4250)), "4.2s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m 5s");
    }

    #[test]
    fn test_host_key() {
        assert_eq!(host_key("https://example.com/a.jpg"), Some("example.com:443".to_string()));
        assert_eq!(host_key("http://example.com/a.jpg"), Some("example.com:80".to_string()));
        assert_eq!(host_key("http://127.0.0.1:8091/1x1.jpeg"), Some("127.0.0.1:8091".to_string()));
        assert_eq!(host_key("ftp://example.com/a.jpg"), None);
        assert_eq!(host_key("not a url"), None);
    }

    #[test]
    fn test_throughput() {
        assert_eq!(throughput(1000, Duration::from_millis(300)), 1000);
        assert_eq!(throughput(1000, Duration::from_secs(1)), 500);
    }
}
