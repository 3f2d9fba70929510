use regex::Regex;
use serde::{Deserialize, Serialize};

/// Marker prefixed to lines produced by our `--progress-template`.
pub const PROGRESS_PREFIX: &str = "[progress]";

/// Value for yt-dlp's `--progress-template`. Fields are `|`-separated
/// because the speed string may itself contain spaces ("Unknown B/s").
pub fn progress_template() -> String {
    format!(
        "download:{}|%(progress._percent_str)s|%(progress._speed_str)s|%(progress._eta_str)s",
        PROGRESS_PREFIX
    )
}

/// One progress reading taken from the tool's standard output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub percent: f32,
    /// Bytes per second.
    pub speed: Option<u64>,
    /// Seconds remaining.
    pub eta: Option<u64>,
}

/// Parses progress lines, preferring our template and falling back to
/// the stock `[download]` line.
pub struct ProgressParser {
    standard_re: Option<Regex>,
    percent_re: Option<Regex>,
    size_re: Option<Regex>,
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressParser {
    pub fn new() -> Self {
        Self {
            // [download]  50.5% of ~100.00MiB at 1.50MiB/s ETA 00:30
            standard_re: Regex::new(
                r"\[download\]\s+(\d+(?:\.\d+)?)%\s+of\s+~?\s*\S+\s+at\s+(.+?)\s+ETA\s+(\S+)",
            )
            .ok(),
            percent_re: Regex::new(r"\[download\]\s+(\d+(?:\.\d+)?)%").ok(),
            size_re: Regex::new(r"^([\d.]+)\s*([KMGT]?i?B)(?:/s)?$").ok(),
        }
    }

    pub fn parse_line(&self, line: &str) -> Option<ProgressSample> {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix(PROGRESS_PREFIX) {
            let mut fields = rest.trim_start_matches('|').split('|');
            let percent = parse_percent(fields.next()?)?;
            let speed = fields.next().and_then(|s| self.parse_speed(s));
            let eta = fields.next().and_then(parse_eta);
            return Some(ProgressSample { percent, speed, eta });
        }

        if let Some(caps) = self.standard_re.as_ref().and_then(|re| re.captures(line)) {
            let percent = caps.get(1).and_then(|m| parse_percent(m.as_str()))?;
            let speed = caps.get(2).and_then(|m| self.parse_speed(m.as_str()));
            let eta = caps.get(3).and_then(|m| parse_eta(m.as_str()));
            return Some(ProgressSample { percent, speed, eta });
        }

        let caps = self.percent_re.as_ref()?.captures(line)?;
        let percent = caps.get(1).and_then(|m| parse_percent(m.as_str()))?;
        Some(ProgressSample {
            percent,
            speed: None,
            eta: None,
        })
    }

    /// "1.50MiB/s" -> bytes per second.
    pub fn parse_speed(&self, s: &str) -> Option<u64> {
        let s = s.trim();
        if s.is_empty() || s.starts_with("N/A") || s.starts_with("Unknown") {
            return None;
        }

        let caps = self.size_re.as_ref()?.captures(s)?;
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        let multiplier = match caps.get(2)?.as_str() {
            "B" => 1.0,
            "KiB" => 1024.0,
            "MiB" => 1024.0 * 1024.0,
            "GiB" => 1024.0 * 1024.0 * 1024.0,
            "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
            "KB" => 1000.0,
            "MB" => 1_000_000.0,
            "GB" => 1_000_000_000.0,
            "TB" => 1_000_000_000_000.0,
            _ => return None,
        };
        Some((value * multiplier) as u64)
    }
}

fn parse_percent(s: &str) -> Option<f32> {
    let value: f32 = s.trim().trim_end_matches('%').trim().parse().ok()?;
    if value.is_finite() {
        Some(value.clamp(0.0, 100.0))
    } else {
        None
    }
}

/// "SS", "MM:SS" or "HH:MM:SS" -> seconds.
pub fn parse_eta(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() || s == "N/A" || s.eq_ignore_ascii_case("unknown") {
        return None;
    }

    s.split(':').try_fold(0u64, |total, part| {
        let part: u64 = part.trim().parse().ok()?;
        total.checked_mul(60)?.checked_add(part)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_template_line() {
        let parser = ProgressParser::new();
        let sample = parser
            .parse_line("[progress]|  42.5%|1.50MiB/s|00:30")
            .unwrap();
        assert_eq!(sample.percent, 42.5);
        assert_eq!(sample.speed, Some(1_572_864));
        assert_eq!(sample.eta, Some(30));
    }

    #[test]
    fn template_tolerates_unknown_fields() {
        let parser = ProgressParser::new();
        let sample = parser
            .parse_line("[progress]|   0.0%|Unknown B/s|Unknown")
            .unwrap();
        assert_eq!(sample.percent, 0.0);
        assert_eq!(sample.speed, None);
        assert_eq!(sample.eta, None);
    }

    #[test]
    fn parses_stock_download_line() {
        let parser = ProgressParser::new();
        let sample = parser
            .parse_line("[download]  50.0% of ~ 10.00MiB at  512.00KiB/s ETA 01:02:03")
            .unwrap();
        assert_eq!(sample.percent, 50.0);
        assert_eq!(sample.speed, Some(524_288));
        assert_eq!(sample.eta, Some(3723));
    }

    #[test]
    fn parses_bare_percentage() {
        let parser = ProgressParser::new();
        let sample = parser
            .parse_line("[download] 100% of 10.00MiB in 00:00:03")
            .unwrap();
        assert_eq!(sample.percent, 100.0);
    }

    #[test]
    fn ignores_unrelated_lines() {
        let parser = ProgressParser::new();
        assert!(parser.parse_line("[youtube] abc: Downloading webpage").is_none());
        assert!(parser.parse_line("[download] Destination: x.mp4").is_none());
        assert!(parser.parse_line("").is_none());
    }

    #[test]
    fn eta_formats() {
        assert_eq!(parse_eta("45"), Some(45));
        assert_eq!(parse_eta("02:05"), Some(125));
        assert_eq!(parse_eta("N/A"), None);
        assert_eq!(parse_eta("soon"), None);
    }

    #[test]
    fn oversized_eta_is_dropped() {
        assert_eq!(parse_eta("999999999999999999:00"), None);
        assert_eq!(parse_eta("99999999999999999999"), None);

        let parser = ProgressParser::new();
        let sample = parser
            .parse_line("[progress]|  1.0%|1.00MiB/s|999999999999999999:00")
            .unwrap();
        assert_eq!(sample.percent, 1.0);
        assert_eq!(sample.speed, Some(1_048_576));
        assert_eq!(sample.eta, None);
    }

    #[test]
    fn template_mentions_prefix() {
        assert!(progress_template().starts_with("download:[progress]|"));
    }
}
