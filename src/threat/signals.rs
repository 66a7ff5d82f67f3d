//! Scoring rules for each threat signal. Pure functions over already-collected observations.

use super::{SignalScore, ThreatLevel};
use crate::classifier::{EndpointCategory, RequestDescriptor};

/// Browser headers whose absence suggests automation.
const BROWSER_HEADERS: [&str; 3] = ["accept", "accept-language", "accept-encoding"];

/// User-agent fragments (lowercase) and their bot likelihood; the strongest match wins.
const USER_AGENT_PATTERNS: &[(&str, f64)] = &[
    ("sqlmap", 0.9),
    ("nikto", 0.9),
    ("masscan", 0.9),
    ("zgrab", 0.9),
    ("nmap", 0.9),
    ("headless", 0.8),
    ("phantomjs", 0.8),
    ("selenium", 0.8),
    ("puppeteer", 0.8),
    ("playwright", 0.8),
    ("scrapy", 0.8),
    ("crawler", 0.7),
    ("spider", 0.7),
    ("bot", 0.7),
    ("python-requests", 0.6),
    ("python-urllib", 0.6),
    ("go-http-client", 0.6),
    ("curl", 0.6),
    ("wget", 0.6),
    ("okhttp", 0.5),
    ("java/", 0.5),
    ("libwww", 0.5),
    ("httpclient", 0.5),
];

/// `1 - Π(1 - s)` over the given sub-scores.
pub fn union(scores: &[f64]) -> f64 {
    1.0 - scores.iter().fold(1.0, |acc, s| acc * (1.0 - s.clamp(0.0, 1.0)))
}

/// Requests from one IP in the last minute against the flood threshold.
pub fn flood(count: u64, threshold: u64) -> SignalScore {
    let ratio = count as f64 / threshold.max(1) as f64;
    let level = if ratio >= 1.0 {
        ThreatLevel::Critical
    } else if ratio >= 0.8 {
        ThreatLevel::High
    } else if ratio >= 0.6 {
        ThreatLevel::Medium
    } else {
        ThreatLevel::None
    };
    SignalScore::new(level, ratio)
}

/// Platform-wide requests this minute against the distributed threshold.
pub fn distributed(count: u64, threshold: u64) -> SignalScore {
    let ratio = count as f64 / threshold.max(1) as f64;
    let level = if ratio >= 1.0 {
        ThreatLevel::High
    } else if ratio >= 0.8 {
        ThreatLevel::Medium
    } else {
        ThreatLevel::None
    };
    SignalScore::new(level, ratio)
}

/// Strongest user-agent pattern; an empty or absent agent scores 0.7.
pub fn user_agent(ua: Option<&str>) -> f64 {
    let ua = ua.map(str::trim).unwrap_or_default();
    if ua.is_empty() {
        return 0.7;
    }
    let ua = ua.to_ascii_lowercase();
    USER_AGENT_PATTERNS
        .iter()
        .filter(|(pattern, _)| ua.contains(pattern))
        .map(|(_, score)| *score)
        .fold(0.0, f64::max)
}

/// More than one standard browser header missing.
pub fn missing_headers(req: &RequestDescriptor) -> f64 {
    let missing = BROWSER_HEADERS.iter().filter(|h| req.header(h).is_none()).count();
    if missing > 1 {
        0.6
    } else {
        0.0
    }
}

/// Machine-regular spacing across recent request timestamps (oldest first).
pub fn regular_intervals(timestamps_ms: &[u64]) -> f64 {
    if timestamps_ms.len() < 5 {
        return 0.0;
    }
    let intervals: Vec<f64> =
        timestamps_ms.windows(2).map(|w| w[1].saturating_sub(w[0]) as f64).collect();
    let n = intervals.len() as f64;
    let mean = intervals.iter().sum::<f64>() / n;
    let variance = intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / n;
    let cv = if mean > 0.0 { variance.sqrt() / mean } else { 0.0 };
    if cv >= 0.1 {
        0.0
    } else if mean < 500.0 {
        0.8
    } else if mean < 2_000.0 {
        0.6
    } else {
        0.0
    }
}

/// API calls without a client fingerprint header.
pub fn missing_fingerprint(req: &RequestDescriptor, category: EndpointCategory) -> f64 {
    if category == EndpointCategory::Api && req.header("x-client-fingerprint").is_none() {
        0.4
    } else {
        0.0
    }
}

/// Bot verdict from the combined score.
pub fn bot(score: f64) -> SignalScore {
    let level = if score >= 0.9 {
        ThreatLevel::High
    } else if score >= 0.7 {
        ThreatLevel::Medium
    } else if score >= 0.5 {
        ThreatLevel::Low
    } else {
        ThreatLevel::None
    };
    SignalScore::new(level, score)
}

/// Share of distinct paths among recent ones; only judged with at least ten paths.
pub fn path_diversity(paths: &[String]) -> f64 {
    if paths.len() < 10 {
        return 0.0;
    }
    let mut unique: Vec<&str> = paths.iter().map(String::as_str).collect();
    unique.sort_unstable();
    unique.dedup();
    let ratio = unique.len() as f64 / paths.len() as f64;
    if ratio > 0.8 {
        0.7
    } else if ratio > 0.6 {
        0.5
    } else {
        0.0
    }
}

/// Bulk export or download endpoints.
pub fn export_path(path: &str) -> f64 {
    let lower = path.to_ascii_lowercase();
    if lower.split('/').any(|seg| seg.starts_with("export") || seg.starts_with("download")) {
        0.6
    } else {
        0.0
    }
}

/// Deep paths (three or more segments) reached without a referer.
pub fn missing_referer(req: &RequestDescriptor) -> f64 {
    let depth = req.path_only().split('/').filter(|s| !s.is_empty()).count();
    if depth >= 3 && req.header("referer").is_none() {
        0.4
    } else {
        0.0
    }
}

/// Scraping verdict from the combined score.
pub fn scraping(score: f64) -> SignalScore {
    let level = if score >= 0.8 {
        ThreatLevel::High
    } else if score >= 0.6 {
        ThreatLevel::Medium
    } else if score >= 0.4 {
        ThreatLevel::Low
    } else {
        ThreatLevel::None
    };
    SignalScore::new(level, score)
}

/// Failed authentications from one IP in the brute-force window.
pub fn brute_force(failures: u64) -> SignalScore {
    let level = if failures > 20 {
        ThreatLevel::Critical
    } else if failures > 10 {
        ThreatLevel::High
    } else if failures > 5 {
        ThreatLevel::Medium
    } else {
        ThreatLevel::None
    };
    SignalScore::new(level, failures as f64)
}

/// Anomaly verdict from the largest feature z-score.
pub fn anomaly(z: f64) -> SignalScore {
    let level = if z >= 3.0 {
        ThreatLevel::High
    } else if z >= 2.0 {
        ThreatLevel::Medium
    } else if z >= 1.5 {
        ThreatLevel::Low
    } else {
        ThreatLevel::None
    };
    SignalScore::new(level, z)
}

/// Reputation verdict from a 0-100 score.
pub fn reputation(score: u8) -> SignalScore {
    let level = match score {
        90..=u8::MAX => ThreatLevel::High,
        75..=89 => ThreatLevel::Medium,
        50..=74 => ThreatLevel::Low,
        _ => ThreatLevel::None,
    };
    SignalScore::new(level, f64::from(score))
}
