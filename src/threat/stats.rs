//! Online per-feature statistics for anomaly scoring.

use std::time::Duration;

use crate::classifier::RequestDescriptor;
use crate::clock::CalendarTime;
use crate::error::StoreError;
use crate::store::AtomicStore;

/// Numeric view of one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestFeatures {
    /// Path length including the query string.
    pub url_length: f64,
    /// Number of headers.
    pub header_count: f64,
    /// Number of query parameters.
    pub query_params: f64,
    /// Body size in bytes.
    pub payload_size: f64,
    /// UTC hour of day.
    pub hour: f64,
    /// Day of week, Monday = 0.
    pub weekday: f64,
}

impl RequestFeatures {
    /// Extract features from `req` observed at `now_ms`.
    pub fn extract(req: &RequestDescriptor, now_ms: u64) -> Self {
        let cal = CalendarTime::from_millis(now_ms);
        Self {
            url_length: req.path.len() as f64,
            header_count: req.headers.len() as f64,
            query_params: req.query_param_count() as f64,
            payload_size: req.payload_size as f64,
            hour: f64::from(cal.hour),
            weekday: f64::from(cal.weekday),
        }
    }

    /// `(name, value)` pairs.
    pub fn named(&self) -> [(&'static str, f64); 6] {
        [
            ("url_length", self.url_length),
            ("header_count", self.header_count),
            ("query_params", self.query_params),
            ("payload_size", self.payload_size),
            ("hour", self.hour),
            ("weekday", self.weekday),
        ]
    }
}

/// Shared accumulators keyed `stat:{feature}`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatisticsSettings {
    /// Samples required before a feature is scored.
    pub min_samples: u64,
    /// Absolute floor on the standard deviation.
    pub min_stddev: f64,
    /// Floor on the standard deviation as a fraction of the mean.
    pub min_relative_stddev: f64,
    /// Accumulator TTL, refreshed on write.
    pub ttl: Duration,
}

/// Largest score a feature with a flat history may report: enough for a medium verdict, never a
/// blocking one.
pub const FLAT_HISTORY_MAX_Z: f64 = 2.0;

/// `|value - mean|` over `max(stddev, min_relative_stddev * |mean|, min_stddev)`. A history whose
/// spread is below `min_stddev` is flat and capped at [`FLAT_HISTORY_MAX_Z`].
pub fn z_score(value: f64, mean: f64, stddev: f64, settings: &StatisticsSettings) -> f64 {
    let floor = (mean.abs() * settings.min_relative_stddev).max(settings.min_stddev);
    let z = (value - mean).abs() / stddev.max(floor);
    if stddev < settings.min_stddev {
        z.min(FLAT_HISTORY_MAX_Z)
    } else {
        z
    }
}

/// Reads and updates feature accumulators in the shared store.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureStatistics;

impl FeatureStatistics {
    fn key(name: &str) -> String {
        format!("stat:{name}")
    }

    /// Largest z-score across features with enough history, and the feature that produced it.
    pub async fn max_z(
        &self,
        store: &dyn AtomicStore,
        features: &RequestFeatures,
        settings: &StatisticsSettings,
    ) -> Result<Option<(&'static str, f64)>, StoreError> {
        let mut best: Option<(&'static str, f64)> = None;
        for (name, value) in features.named() {
            let Some(stat) = store.stat_get(&Self::key(name)).await? else {
                continue;
            };
            if stat.count < settings.min_samples {
                continue;
            }
            let z = z_score(value, stat.mean(), stat.stddev(), settings);
            if best.map_or(true, |(_, b)| z > b) {
                best = Some((name, z));
            }
        }
        Ok(best)
    }

    /// Fold the current request into every accumulator.
    pub async fn update(
        &self,
        store: &dyn AtomicStore,
        features: &RequestFeatures,
        settings: &StatisticsSettings,
    ) -> Result<(), StoreError> {
        for (name, value) in features.named() {
            store.stat_add(&Self::key(name), value, settings.ttl).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn settings() -> StatisticsSettings {
        StatisticsSettings {
            min_samples: 10,
            min_stddev: 1.0,
            min_relative_stddev: 0.5,
            ttl: Duration::from_secs(86_400),
        }
    }

    fn features(url_length: f64) -> RequestFeatures {
        RequestFeatures {
            url_length,
            header_count: 8.0,
            query_params: 0.0,
            payload_size: 0.0,
            hour: 10.0,
            weekday: 1.0,
        }
    }

    #[test]
    fn extracts_from_descriptor() {
        let req = RequestDescriptor::new("GET", "/api/items?a=1&b=2").with_header("accept", "*/*");
        // Monday 10:30 UTC.
        let f = RequestFeatures::extract(&req, 1_704_105_000_000);
        assert_eq!(f.url_length, 18.0);
        assert_eq!(f.header_count, 1.0);
        assert_eq!(f.query_params, 2.0);
        assert_eq!(f.hour, 10.0);
        assert_eq!(f.weekday, 0.0);
    }

    #[tokio::test]
    async fn needs_min_samples_before_scoring() {
        let store = MemoryStore::with_clock(Arc::new(ManualClock::new(0)));
        let stats = FeatureStatistics;
        for _ in 0..9 {
            stats.update(&store, &features(20.0), &settings()).await.unwrap();
        }
        assert_eq!(stats.max_z(&store, &features(500.0), &settings()).await.unwrap(), None);
        stats.update(&store, &features(20.0), &settings()).await.unwrap();
        let (name, z) = stats.max_z(&store, &features(500.0), &settings()).await.unwrap().unwrap();
        assert_eq!(name, "url_length");
        // Constant history: flagged, but capped below a blocking score.
        assert_eq!(z, FLAT_HISTORY_MAX_Z);
    }

    #[test]
    fn floor_scales_with_the_mean() {
        let s = settings();
        // A path 8 characters longer than a constant 10-character history.
        assert!(z_score(18.0, 10.0, 0.0, &s) < 2.0);
        // First body on a platform that has only seen empty payloads.
        assert_eq!(z_score(4_096.0, 0.0, 0.0, &s), FLAT_HISTORY_MAX_Z);
        // Slight spread around a larger mean still uses the relative floor.
        assert!((z_score(18.0, 10.0, 1.2, &s) - 1.6).abs() < 1e-9);
        // Real spread still flags outliers.
        assert!(z_score(200.0, 20.0, 4.0, &s) >= 3.0);
        assert!(z_score(60.0, 20.0, 12.0, &s) >= 3.0);
    }
}
