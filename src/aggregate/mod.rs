//! Time-bucketed aggregation over the hit and failure log.
//!
//! Buckets are aligned to multiples of their width counted from the Unix
//! epoch, never to the requested start, so overlapping queries with the same
//! group share boundaries. Events are assigned with floor division, the
//! bucket count uses ceiling division, and every bucket in the window is
//! emitted even when empty. Aggregation only reads the log.

mod group;

pub use group::*;

use crate::db::{DbError, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hard cap on the size of one bucket series.
pub const MAX_BUCKETS: i64 = 10_000;

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// Aggregation error types.
#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("invalid group {0:?}")]
    InvalidGroup(String),
    #[error("window start {start} is after end {end}")]
    InvertedWindow { start: DateTime<Utc>, end: DateTime<Utc> },
    #[error("window needs {0} buckets, more than the limit of 10000")]
    TooManyBuckets(i64),
    #[error(transparent)]
    Storage(#[from] DbError),
}

/// Which series to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesKind {
    /// Full response latency of hits
    Hits,
    /// Time to first response of hits
    Ping,
    /// Failure counts
    Failures,
}

/// One aggregation slot. Latency fields are `None` for empty buckets and failure series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub count: u64,
    pub avg_ns: Option<f64>,
    pub min_ns: Option<i64>,
    pub max_ns: Option<i64>,
}

impl Bucket {
    fn empty(start: DateTime<Utc>) -> Self {
        Self {
            start,
            count: 0,
            avg_ns: None,
            min_ns: None,
            max_ns: None,
        }
    }
}

/// Epoch-aligned layout of buckets covering a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketPlan {
    /// First boundary, unix seconds, a multiple of `width`
    aligned_start: i64,
    /// Bucket width in seconds
    width: i64,
    count: usize,
}

impl BucketPlan {
    /// Lay out buckets of `width` seconds covering `[start, end)`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, width: i64) -> Result<Self, AggregateError> {
        if start > end {
            return Err(AggregateError::InvertedWindow { start, end });
        }
        if width <= 0 {
            return Err(AggregateError::InvalidGroup(format!("{}s", width)));
        }

        let aligned_start = start.timestamp().div_euclid(width) * width;

        // ceil((end - aligned_start) / width), at nanosecond precision for `end`
        let span = i128::from(end.timestamp() - aligned_start) * NANOS_PER_SEC
            + i128::from(end.timestamp_subsec_nanos());
        let width_ns = i128::from(width) * NANOS_PER_SEC;
        let count = (span + width_ns - 1).div_euclid(width_ns);

        if count > i128::from(MAX_BUCKETS) {
            return Err(AggregateError::TooManyBuckets(
                i64::try_from(count).unwrap_or(i64::MAX),
            ));
        }

        Ok(Self {
            aligned_start,
            width,
            count: count as usize,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Start of bucket `index`.
    pub fn bucket_start(&self, index: usize) -> DateTime<Utc> {
        let secs = self.aligned_start + index as i64 * self.width;
        DateTime::from_timestamp(secs, 0).unwrap_or_default()
    }

    /// Bucket holding `t`, if it lies inside the plan.
    pub fn index_of(&self, t: DateTime<Utc>) -> Option<usize> {
        let offset = t.timestamp() - self.aligned_start;
        if offset < 0 {
            return None;
        }
        let index = (offset / self.width) as usize;
        (index < self.count).then_some(index)
    }
}

#[derive(Default)]
struct Accumulator {
    count: u64,
    samples: u64,
    sum: f64,
    min: Option<i64>,
    max: Option<i64>,
}

impl Accumulator {
    fn add(&mut self, value: Option<i64>) {
        self.count += 1;
        if let Some(v) = value {
            self.samples += 1;
            self.sum += v as f64;
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }

    fn finish(self, start: DateTime<Utc>) -> Bucket {
        Bucket {
            start,
            count: self.count,
            avg_ns: (self.samples > 0).then(|| self.sum / self.samples as f64),
            min_ns: self.min,
            max_ns: self.max,
        }
    }
}

/// Fold time-ordered samples into the plan's buckets in one pass.
///
/// A sample is `(time, latency)`; failures carry no latency. Samples outside
/// the plan are ignored. Every bucket is returned, empty ones included.
pub fn summarize<I>(plan: &BucketPlan, samples: I) -> Vec<Bucket>
where
    I: IntoIterator<Item = (DateTime<Utc>, Option<i64>)>,
{
    let mut slots: Vec<Accumulator> = (0..plan.len()).map(|_| Accumulator::default()).collect();

    for (time, value) in samples {
        if let Some(index) = plan.index_of(time) {
            slots[index].add(value);
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(i, acc)| acc.finish(plan.bucket_start(i)))
        .collect()
}

/// Resolve the bucket width for a query.
pub fn resolve_width(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    group: Option<&str>,
) -> Result<i64, AggregateError> {
    match group.map(str::trim).filter(|g| !g.is_empty()) {
        Some(g) => parse_group(g),
        None => Ok(default_width((end - start).num_seconds())),
    }
}

/// Build a bucket series for one service over `[start, end)`.
pub fn aggregate(
    store: &Store,
    service_id: i64,
    kind: SeriesKind,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    group: Option<&str>,
) -> Result<Vec<Bucket>, AggregateError> {
    if start > end {
        return Err(AggregateError::InvertedWindow { start, end });
    }

    let width = resolve_width(start, end, group)?;
    let plan = BucketPlan::new(start, end, width)?;

    let buckets = match kind {
        SeriesKind::Hits => {
            let hits = store.get_hits_in_range(service_id, start, end)?;
            summarize(&plan, hits.iter().map(|h| (h.time, Some(h.latency_ns))))
        }
        SeriesKind::Ping => {
            let hits = store.get_hits_in_range(service_id, start, end)?;
            summarize(&plan, hits.iter().map(|h| (h.time, Some(h.ping_ns))))
        }
        SeriesKind::Failures => {
            let failures = store.get_failures_in_range(service_id, start, end)?;
            summarize(&plan, failures.iter().map(|f| (f.time, None)))
        }
    };

    tracing::debug!(
        "Aggregated {:?} for service {}: {} buckets of {}s",
        kind,
        service_id,
        buckets.len(),
        width
    );

    Ok(buckets)
}

/// Share of successful probes in a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Uptime {
    pub hits: i64,
    pub failures: i64,
    /// `None` when nothing was probed in the window
    pub percent: Option<f64>,
}

/// Compute uptime for one service over `[start, end)`.
pub fn uptime(
    store: &Store,
    service_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Uptime, AggregateError> {
    if start > end {
        return Err(AggregateError::InvertedWindow { start, end });
    }

    let stats = store.count_events_in_range(service_id, start, end)?;
    let total = stats.hits + stats.failures;
    Ok(Uptime {
        hits: stats.hits,
        failures: stats.failures,
        percent: (total > 0).then(|| stats.hits as f64 * 100.0 / total as f64),
    })
}

/// Default look-back when a caller omits `start`. `None` when `end` is too
/// close to the earliest representable time.
pub fn default_window_start(end: DateTime<Utc>) -> Option<DateTime<Utc>> {
    end.checked_sub_signed(ChronoDuration::hours(24))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{sample_service, temp_store};
    use crate::db::{Failure, FailureKind, Hit};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    /// Independent reference: ceil((end - floor(start/d)*d) / d) in whole seconds.
    fn expected_count(start: i64, end: i64, d: i64) -> i64 {
        let aligned = start.div_euclid(d) * d;
        let span = end - aligned;
        (span + d - 1).div_euclid(d)
    }

    #[test]
    fn test_plan_aligned_window() {
        // 31 hours starting on a quarter hour in 15 minute buckets
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 6, 15, 0).unwrap();
        let end = start + ChronoDuration::hours(31);
        let plan = BucketPlan::new(start, end, 900).unwrap();
        assert_eq!(plan.len(), 124);
        assert_eq!(plan.len() as i64, (31 * 3600 + 899) / 900);
        assert_eq!(plan.bucket_start(0), start);
    }

    #[test]
    fn test_plan_unaligned_start_adds_leading_bucket() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 6, 20, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 7, 0, 0).unwrap();
        let plan = BucketPlan::new(start, end, 900).unwrap();
        assert_eq!(plan.bucket_start(0), Utc.with_ymd_and_hms(2024, 3, 1, 6, 15, 0).unwrap());
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn test_plan_subsecond_end_rounds_up() {
        let start = at(0);
        let end = at(3600) + ChronoDuration::milliseconds(1);
        assert_eq!(BucketPlan::new(start, end, 3600).unwrap().len(), 2);
    }

    #[test]
    fn test_plan_degenerate_windows() {
        assert!(BucketPlan::new(at(900), at(900), 900).unwrap().is_empty());
        assert_eq!(BucketPlan::new(at(901), at(901), 900).unwrap().len(), 1);
        assert!(matches!(
            BucketPlan::new(at(1000), at(10), 60),
            Err(AggregateError::InvertedWindow { .. })
        ));
        assert!(matches!(
            BucketPlan::new(at(0), at(86400 * 365), 60),
            Err(AggregateError::TooManyBuckets(_))
        ));
    }

    #[test]
    fn test_index_of_bounds() {
        let plan = BucketPlan::new(at(0), at(3600), 900).unwrap();
        assert_eq!(plan.index_of(at(0)), Some(0));
        assert_eq!(plan.index_of(at(899)), Some(0));
        assert_eq!(plan.index_of(at(900)), Some(1));
        assert_eq!(plan.index_of(at(3599)), Some(3));
        assert_eq!(plan.index_of(at(3600)), None);
        assert_eq!(plan.index_of(at(-1)), None);
    }

    #[test]
    fn test_summarize_stats_and_zero_fill() {
        let plan = BucketPlan::new(at(0), at(3600), 900).unwrap();
        let samples = vec![
            (at(10), Some(100)),
            (at(20), Some(300)),
            (at(1900), Some(50)),
        ];
        let buckets = summarize(&plan, samples);
        assert_eq!(buckets.len(), 4);

        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[0].avg_ns, Some(200.0));
        assert_eq!(buckets[0].min_ns, Some(100));
        assert_eq!(buckets[0].max_ns, Some(300));

        assert_eq!(buckets[1], Bucket::empty(at(900)));
        assert_eq!(buckets[2].count, 1);
        assert_eq!(buckets[3].count, 0);
    }

    #[test]
    fn test_aggregate_from_store() {
        let (_tmp, store) = temp_store();
        let id = store.add_service(&mut sample_service("svc")).unwrap();
        let other = store.add_service(&mut sample_service("other")).unwrap();
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        for (offset, latency) in [(60, 10), (120, 30), (1000, 20)] {
            store
                .record_hit(&Hit {
                    id: 0,
                    service_id: id,
                    time: base + ChronoDuration::seconds(offset),
                    latency_ns: latency,
                    ping_ns: latency / 2,
                })
                .unwrap();
        }
        for offset in [5, 2000, 2001] {
            store
                .record_failure(&Failure {
                    id: 0,
                    service_id: id,
                    time: base + ChronoDuration::seconds(offset),
                    kind: FailureKind::Timeout,
                    issue: "timeout".into(),
                    status_code: None,
                    snippet: None,
                })
                .unwrap();
        }
        store
            .record_failure(&Failure {
                id: 0,
                service_id: other,
                time: base,
                kind: FailureKind::Network,
                issue: "x".into(),
                status_code: None,
                snippet: None,
            })
            .unwrap();

        let end = base + ChronoDuration::hours(1);
        let hits = aggregate(&store, id, SeriesKind::Hits, base, end, Some("15m")).unwrap();
        assert_eq!(hits.iter().map(|b| b.count).collect::<Vec<_>>(), vec![2, 1, 0, 0]);
        assert_eq!(hits[0].avg_ns, Some(20.0));
        assert_eq!(hits[2].avg_ns, None);

        let ping = aggregate(&store, id, SeriesKind::Ping, base, end, Some("15m")).unwrap();
        assert_eq!(ping[0].max_ns, Some(15));

        let failures = aggregate(&store, id, SeriesKind::Failures, base, end, Some("15m")).unwrap();
        assert_eq!(failures.iter().map(|b| b.count).collect::<Vec<_>>(), vec![1, 0, 2, 0]);
        assert!(failures.iter().all(|b| b.avg_ns.is_none()));

        // Read-only
        assert_eq!(store.count_failures(id).unwrap(), 3);
        assert_eq!(store.get_hits_in_range(id, base, end).unwrap().len(), 3);
    }

    #[test]
    fn test_aggregate_empty_log_still_fills_window() {
        let (_tmp, store) = temp_store();
        let id = store.add_service(&mut sample_service("svc")).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 5, 31, 0, 0, 0).unwrap();
        let start = end - ChronoDuration::days(30);

        let hourly = aggregate(&store, id, SeriesKind::Hits, start, end, Some("1h")).unwrap();
        assert_eq!(hourly.len(), 720);
        assert!(hourly.iter().all(|b| b.count == 0));

        let daily = aggregate(&store, id, SeriesKind::Failures, start, end, Some("24h")).unwrap();
        assert_eq!(daily.len(), 30);

        let default = aggregate(&store, id, SeriesKind::Ping, start, end, None).unwrap();
        assert_eq!(default.len(), 120);
        assert_eq!((default[1].start - default[0].start).num_seconds(), 21600);
    }

    #[test]
    fn test_aggregate_rejects_bad_input() {
        let (_tmp, store) = temp_store();
        let end = Utc::now();
        assert!(matches!(
            aggregate(&store, 1, SeriesKind::Hits, end, end - ChronoDuration::hours(1), None),
            Err(AggregateError::InvertedWindow { .. })
        ));
        assert!(matches!(
            aggregate(&store, 1, SeriesKind::Hits, end - ChronoDuration::hours(1), end, Some("fortnight")),
            Err(AggregateError::InvalidGroup(_))
        ));
    }

    #[test]
    fn test_default_window_start() {
        let end = at(1_700_000_000);
        assert_eq!(default_window_start(end), Some(at(1_700_000_000 - 86_400)));
        assert_eq!(default_window_start(DateTime::<Utc>::MIN_UTC), None);
    }

    #[test]
    fn test_uptime() {
        let (_tmp, store) = temp_store();
        let id = store.add_service(&mut sample_service("svc")).unwrap();
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let end = base + ChronoDuration::hours(1);

        assert_eq!(uptime(&store, id, base, end).unwrap().percent, None);

        for i in 0..3 {
            store
                .record_hit(&Hit {
                    id: 0,
                    service_id: id,
                    time: base + ChronoDuration::seconds(i),
                    latency_ns: 1,
                    ping_ns: 1,
                })
                .unwrap();
        }
        store
            .record_failure(&Failure {
                id: 0,
                service_id: id,
                time: base,
                kind: FailureKind::Timeout,
                issue: String::new(),
                status_code: None,
                snippet: None,
            })
            .unwrap();

        let up = uptime(&store, id, base, end).unwrap();
        assert_eq!(up.hits, 3);
        assert_eq!(up.failures, 1);
        assert_eq!(up.percent, Some(75.0));
    }

    fn width_strategy() -> impl Strategy<Value = i64> {
        prop::sample::select(vec![60i64, 300, 900, 3600, 43200, 86400])
    }

    proptest! {
        #[test]
        fn prop_bucket_count_matches_formula(
            start in -1_000_000_000i64..4_000_000_000,
            len in 0i64..500_000,
            width in width_strategy(),
        ) {
            prop_assume!(expected_count(start, start + len, width) <= MAX_BUCKETS);
            let plan = BucketPlan::new(at(start), at(start + len), width).unwrap();

            prop_assert_eq!(plan.len() as i64, expected_count(start, start + len, width));
            for i in 0..plan.len() {
                prop_assert_eq!(plan.bucket_start(i).timestamp().rem_euclid(width), 0);
                if i > 0 {
                    prop_assert_eq!((plan.bucket_start(i) - plan.bucket_start(i - 1)).num_seconds(), width);
                }
            }
            if !plan.is_empty() {
                prop_assert!(plan.bucket_start(0) <= at(start));
                prop_assert!(plan.bucket_start(plan.len() - 1).timestamp() + width >= start + len);
            }
        }

        #[test]
        fn prop_overlapping_windows_share_boundaries(
            a_start in 0i64..2_000_000_000,
            a_len in 1i64..2_000_000,
            shift in 0i64..2_000_000,
            b_len in 1i64..2_000_000,
            width in prop::sample::select(vec![300i64, 900, 3600, 43200, 86400]),
        ) {
            let b_start = a_start + shift;
            let a = BucketPlan::new(at(a_start), at(a_start + a_len), width).unwrap();
            let b = BucketPlan::new(at(b_start), at(b_start + b_len), width).unwrap();

            let a_starts: Vec<_> = (0..a.len()).map(|i| a.bucket_start(i)).collect();
            for i in 0..b.len() {
                let s = b.bucket_start(i);
                if s >= a_starts[0] && s <= a_starts[a_starts.len() - 1] {
                    prop_assert!(a_starts.contains(&s));
                }
            }
        }

        #[test]
        fn prop_every_event_lands_in_its_bucket(
            start in 0i64..2_000_000_000,
            len in 1i64..500_000,
            offset_frac in 0.0f64..1.0,
            width in width_strategy(),
        ) {
            prop_assume!(expected_count(start, start + len, width) <= MAX_BUCKETS);
            let plan = BucketPlan::new(at(start), at(start + len), width).unwrap();
            let t = at(start + ((len as f64 * offset_frac) as i64).min(len - 1));

            let index = plan.index_of(t);
            prop_assert!(index.is_some());
            let index = index.unwrap();
            prop_assert!(plan.bucket_start(index) <= t);
            prop_assert!(t < plan.bucket_start(index) + ChronoDuration::seconds(width));
        }

        #[test]
        fn prop_empty_series_is_full_length(
            start in 0i64..2_000_000_000,
            len in 0i64..3_000_000,
            width in prop::sample::select(vec![900i64, 3600, 86400]),
        ) {
            let plan = BucketPlan::new(at(start), at(start + len), width).unwrap();
            let buckets = summarize(&plan, Vec::new());
            prop_assert_eq!(buckets.len(), plan.len());
            prop_assert!(buckets.iter().all(|b| b.count == 0 && b.avg_ns.is_none()));
        }
    }
}
