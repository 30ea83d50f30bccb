use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Pseudo-bucket name meaning "no time restriction".
pub const IMMEDIATE_BUCKET: &str = "immediate";

/// Shortest window handed to the backend. Two seconds still leaves a non-empty range
/// after both edges are rounded inward to whole seconds.
pub const MIN_WINDOW: Duration = Duration::from_secs(2);

/// A named window of data ages, `[now - age_max, now - age_min]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBucket {
    pub name: String,
    #[serde(with = "humantime_serde")]
    pub age_min: Duration,
    #[serde(with = "humantime_serde")]
    pub age_max: Duration,
}

impl TimeBucket {
    pub fn new(name: impl Into<String>, age_min: Duration, age_max: Duration) -> Self {
        Self {
            name: name.into(),
            age_min,
            age_max,
        }
    }

    /// Width of the bucket (`age_max - age_min`).
    pub fn width(&self) -> Duration {
        self.age_max.saturating_sub(self.age_min)
    }

    /// A bucket can only hold data from this run once the run is at least `age_max` old.
    pub fn is_eligible(&self, elapsed_since_start: Duration) -> bool {
        self.age_max <= elapsed_since_start
    }

    /// Largest jitter that still leaves [`MIN_WINDOW`] of the bucket.
    pub fn jitter_limit(&self) -> Duration {
        self.width().saturating_sub(MIN_WINDOW)
    }

    /// Window for this bucket at `now`, with `jitter` trimmed off the recent edge.
    ///
    /// `jitter` is clamped to [`TimeBucket::jitter_limit`], so the resulting window always
    /// lies inside `[now - age_max, now - age_min]` and keeps at least [`MIN_WINDOW`] when
    /// the bucket is that wide.
    pub fn window_at(&self, now: DateTime<Utc>, jitter: Duration) -> TimeWindow {
        let jitter = jitter.min(self.jitter_limit());
        TimeWindow {
            start: shift_back(now, self.age_max),
            end: shift_back(now, self.age_min + jitter),
        }
    }
}

fn shift_back(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Concrete `[start, end]` time range attached to a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// How a planned bucket resolved at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Eligible bucket with a concrete window.
    Window {
        bucket: Arc<TimeBucket>,
        window: TimeWindow,
    },
    /// The plan asked for the `immediate` pseudo-bucket.
    Immediate,
    /// The bucket exists but cannot contain data from this run yet.
    Ineligible { bucket: Arc<TimeBucket> },
}

/// Immutable set of time buckets, keyed by name.
#[derive(Debug, Clone)]
pub struct BucketRegistry {
    buckets: HashMap<String, Arc<TimeBucket>>,
    jitter_ratio: f64,
}

impl BucketRegistry {
    /// Builds a registry. `jitter_ratio` is the fraction of a bucket's width that may be
    /// trimmed from the recent edge of each resolved window; it is clamped to `[0, 1]`.
    pub fn new(buckets: impl IntoIterator<Item = TimeBucket>, jitter_ratio: f64) -> Self {
        let buckets = buckets
            .into_iter()
            .map(|b| (b.name.clone(), Arc::new(b)))
            .collect();
        let jitter_ratio = if jitter_ratio.is_finite() {
            jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            buckets,
            jitter_ratio,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TimeBucket>> {
        self.buckets.get(name)
    }

    /// True for the `immediate` sentinel and for every registered bucket.
    pub fn contains(&self, name: &str) -> bool {
        name == IMMEDIATE_BUCKET || self.buckets.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Eligibility by name. `immediate` is always eligible; unknown names never are.
    pub fn is_eligible(&self, name: &str, elapsed_since_start: Duration) -> bool {
        if name == IMMEDIATE_BUCKET {
            return true;
        }
        self.buckets
            .get(name)
            .is_some_and(|b| b.is_eligible(elapsed_since_start))
    }

    /// Upper bound for the jitter applied to `bucket`.
    pub fn max_jitter(&self, bucket: &TimeBucket) -> Duration {
        bucket
            .width()
            .mul_f64(self.jitter_ratio)
            .min(bucket.jitter_limit())
    }

    /// Resolves a planned bucket name into a dispatch window.
    ///
    /// Jitter is drawn once per call, uniformly from `[0, max_jitter]`. Unknown names
    /// resolve to `Immediate`; plans are validated against the registry at startup, so
    /// this only happens for the sentinel.
    pub fn resolve<R: Rng + ?Sized>(
        &self,
        name: &str,
        elapsed_since_start: Duration,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Resolution {
        let Some(bucket) = self.buckets.get(name) else {
            return Resolution::Immediate;
        };
        if !bucket.is_eligible(elapsed_since_start) {
            return Resolution::Ineligible {
                bucket: Arc::clone(bucket),
            };
        }

        let max_jitter = self.max_jitter(bucket);
        let jitter = if max_jitter.is_zero() {
            Duration::ZERO
        } else {
            let nanos = u64::try_from(max_jitter.as_nanos()).unwrap_or(u64::MAX);
            Duration::from_nanos(rng.gen_range(0..=nanos))
        };

        Resolution::Window {
            bucket: Arc::clone(bucket),
            window: bucket.window_at(now, jitter),
        }
    }
}
