//! # Metrics and Monitoring Module
//!
//! Per-invocation metric collection with a hot path that never blocks:
//! recording is an unbounded mpsc enqueue, a single consumer task folds
//! data into the store, and aggregation runs on its own schedule.
//!
//! Storage has three tiers, all bounded:
//!
//! - **Raw ring**: full-resolution data for the last hour (default),
//!   powering realtime counters, percentiles, and alert windows.
//! - **Minute buckets**: raw entries older than the raw retention are
//!   collapsed into per-provider minute summaries kept for 24h, powering
//!   trend queries and the performance endpoint.
//! - **Baselines**: per-provider exponentially weighted moving averages of
//!   success rate and latency, never evicted, powering the alerting
//!   system's trend comparison.
//!
//! The collector is an injected dependency, constructed once in server
//! setup and shared as an `Arc`; there is no global instance.

use crate::config::MetricsConfig;
use chrono::{DateTime, Utc};
use dreamweave_providers::ErrorKind;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, RwLock};

const PROMISE_RING: usize = 100;
const RAW_HARD_CAP: usize = 50_000;

/// EWMA smoothing factor for baselines.
const BASELINE_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// One recorded invocation outcome.
#[derive(Debug, Clone, Serialize)]
pub struct MetricDatum {
    pub provider: String,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub outcome: Outcome,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
}

/// Recorded pending-value detection, kept for the extraction guard metric.
#[derive(Debug, Clone, Serialize)]
pub struct PromiseDetection {
    pub provider: String,
    pub location: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MinuteBucket {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub latency_sum_ms: u64,
    pub max_latency_ms: u64,
}

/// Long-run moving averages for one provider.
#[derive(Debug, Clone, Serialize)]
pub struct Baseline {
    pub success_rate: f64,
    pub latency_ms: f64,
    pub samples: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderTotals {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub tokens: u64,
    pub error_kind_counts: HashMap<ErrorKind, u64>,
}

/// Windowed statistics for one provider over a query range.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub failure_rate: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub parsing_errors: u64,
    pub tokens: u64,
}

/// Windowed stats with baseline comparison, for the performance endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPerformance {
    pub window: WindowStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<Baseline>,
    /// window success rate minus baseline success rate
    pub success_rate_delta: f64,
    /// window average latency minus baseline latency
    pub latency_delta_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesPoint {
    pub minute_start: DateTime<Utc>,
    pub requests: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
}

enum Msg {
    Datum(MetricDatum),
    Promise(PromiseDetection),
    Sync(oneshot::Sender<()>),
}

#[derive(Default)]
struct MetricsInner {
    raw: VecDeque<MetricDatum>,
    /// minute epoch → provider → bucket
    buckets: BTreeMap<i64, HashMap<String, MinuteBucket>>,
    baselines: HashMap<String, Baseline>,
    totals: HashMap<String, ProviderTotals>,
    promise_detections: VecDeque<PromiseDetection>,
}

pub struct MetricsCollector {
    tx: mpsc::UnboundedSender<Msg>,
    inner: Arc<RwLock<MetricsInner>>,
    config: MetricsConfig,
    started_at: Instant,
}

impl MetricsCollector {
    /// Construct the collector and spawn its consumer and aggregation
    /// tasks. Must be called within a tokio runtime.
    pub fn start(config: MetricsConfig) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();
        let inner: Arc<RwLock<MetricsInner>> = Arc::default();

        let consumer_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let mut store = consumer_inner.write().await;
                match msg {
                    Msg::Datum(datum) => apply_datum(&mut store, datum),
                    Msg::Promise(detection) => {
                        if store.promise_detections.len() >= PROMISE_RING {
                            store.promise_detections.pop_front();
                        }
                        store.promise_detections.push_back(detection);
                    }
                    Msg::Sync(reply) => {
                        let _ = reply.send(());
                    }
                }
            }
        });

        let collector = Arc::new(Self {
            tx,
            inner,
            config: config.clone(),
            started_at: Instant::now(),
        });

        let aggregator = Arc::clone(&collector);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.aggregation_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                aggregator.run_aggregation_once().await;
            }
        });

        collector
    }

    /// Record one invocation outcome. Non-blocking.
    pub fn record_attempt(
        &self,
        provider: &str,
        request_id: &str,
        outcome: Outcome,
        latency_ms: u64,
        error_kind: Option<ErrorKind>,
        tokens: Option<u32>,
    ) {
        let _ = self.tx.send(Msg::Datum(MetricDatum {
            provider: provider.to_string(),
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
            outcome,
            latency_ms,
            error_kind,
            tokens,
        }));
    }

    /// Record a pending-value detection with its location context.
    pub fn record_promise_detection(&self, provider: &str, location: &str) {
        let _ = self.tx.send(Msg::Promise(PromiseDetection {
            provider: provider.to_string(),
            location: location.to_string(),
            timestamp: Utc::now(),
        }));
    }

    /// Wait until every message enqueued before this call has been applied.
    pub async fn sync(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Msg::Sync(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Collapse raw data past the raw retention into minute buckets and
    /// evict buckets past the bucket retention.
    pub async fn run_aggregation_once(&self) {
        let mut store = self.inner.write().await;
        let raw_cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.raw_retention)
                .unwrap_or(chrono::Duration::hours(1));
        loop {
            let should_fold = match store.raw.front() {
                Some(front) => front.timestamp < raw_cutoff || store.raw.len() > RAW_HARD_CAP,
                None => false,
            };
            if !should_fold {
                break;
            }
            if let Some(datum) = store.raw.pop_front() {
                fold_into_bucket(&mut store, &datum);
            }
        }

        let bucket_cutoff = (Utc::now()
            - chrono::Duration::from_std(self.config.bucket_retention)
                .unwrap_or(chrono::Duration::hours(24)))
        .timestamp()
            / 60;
        store.buckets.retain(|minute, _| *minute >= bucket_cutoff);

        let promise_cutoff = raw_cutoff;
        while store
            .promise_detections
            .front()
            .is_some_and(|p| p.timestamp < promise_cutoff)
        {
            store.promise_detections.pop_front();
        }
    }

    /// Realtime counters over the last minute of raw data.
    pub async fn realtime(&self) -> HashMap<String, WindowStats> {
        self.window_stats_all(Duration::from_secs(60)).await
    }

    /// Windowed stats per provider over `range` (raw-resolution data).
    pub async fn window_stats_all(&self, range: Duration) -> HashMap<String, WindowStats> {
        let store = self.inner.read().await;
        let cutoff = Utc::now() - chrono::Duration::from_std(range).unwrap_or_else(|_| chrono::Duration::zero());
        let mut latencies: HashMap<String, Vec<u64>> = HashMap::new();
        let mut stats: HashMap<String, WindowStats> = HashMap::new();

        for datum in store.raw.iter().filter(|d| d.timestamp >= cutoff) {
            let entry = stats.entry(datum.provider.clone()).or_default();
            entry.requests += 1;
            match datum.outcome {
                Outcome::Success => entry.successes += 1,
                Outcome::Failure => entry.failures += 1,
            }
            if datum.error_kind == Some(ErrorKind::ParsingError) {
                entry.parsing_errors += 1;
            }
            entry.tokens += datum.tokens.unwrap_or(0) as u64;
            latencies
                .entry(datum.provider.clone())
                .or_default()
                .push(datum.latency_ms);
        }

        for (provider, entry) in stats.iter_mut() {
            if let Some(series) = latencies.get_mut(provider) {
                series.sort_unstable();
                let sum: u64 = series.iter().sum();
                entry.avg_latency_ms = sum as f64 / series.len() as f64;
                entry.p50_latency_ms = percentile(series, 0.50);
                entry.p95_latency_ms = percentile(series, 0.95);
            }
            if entry.requests > 0 {
                entry.failure_rate = entry.failures as f64 / entry.requests as f64;
            }
        }

        stats
    }

    /// Windowed stats for one provider.
    pub async fn window_stats(&self, provider: &str, range: Duration) -> WindowStats {
        self.window_stats_all(range)
            .await
            .remove(provider)
            .unwrap_or_default()
    }

    /// Per-provider performance over `range` with baseline comparison.
    pub async fn performance_report(
        &self,
        provider_filter: Option<&str>,
        range: Duration,
    ) -> HashMap<String, ProviderPerformance> {
        let windows = self.window_stats_all(range).await;
        let store = self.inner.read().await;
        let mut report = HashMap::new();

        for (provider, window) in windows {
            if provider_filter.is_some_and(|f| f != provider) {
                continue;
            }
            let baseline = store.baselines.get(&provider).cloned();
            let window_success_rate = if window.requests > 0 {
                window.successes as f64 / window.requests as f64
            } else {
                1.0
            };
            let (success_rate_delta, latency_delta_ms) = match &baseline {
                Some(b) => (
                    window_success_rate - b.success_rate,
                    window.avg_latency_ms - b.latency_ms,
                ),
                None => (0.0, 0.0),
            };
            report.insert(
                provider,
                ProviderPerformance {
                    window,
                    baseline,
                    success_rate_delta,
                    latency_delta_ms,
                },
            );
        }
        report
    }

    /// Minute-resolution series for chart data, merging buckets and raw.
    pub async fn time_series(
        &self,
        provider: Option<&str>,
        range: Duration,
    ) -> Vec<TimeSeriesPoint> {
        let store = self.inner.read().await;
        let cutoff = Utc::now() - chrono::Duration::from_std(range).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff_minute = cutoff.timestamp() / 60;

        let mut merged: BTreeMap<i64, MinuteBucket> = BTreeMap::new();
        for (minute, providers) in store.buckets.range(cutoff_minute..) {
            for (name, bucket) in providers {
                if provider.is_some_and(|p| p != name.as_str()) {
                    continue;
                }
                let entry = merged.entry(*minute).or_default();
                entry.requests += bucket.requests;
                entry.successes += bucket.successes;
                entry.failures += bucket.failures;
                entry.latency_sum_ms += bucket.latency_sum_ms;
                entry.max_latency_ms = entry.max_latency_ms.max(bucket.max_latency_ms);
            }
        }
        for datum in store.raw.iter().filter(|d| d.timestamp >= cutoff) {
            if provider.is_some_and(|p| p != datum.provider) {
                continue;
            }
            let minute = datum.timestamp.timestamp() / 60;
            let entry = merged.entry(minute).or_default();
            entry.requests += 1;
            match datum.outcome {
                Outcome::Success => entry.successes += 1,
                Outcome::Failure => entry.failures += 1,
            }
            entry.latency_sum_ms += datum.latency_ms;
            entry.max_latency_ms = entry.max_latency_ms.max(datum.latency_ms);
        }

        merged
            .into_iter()
            .map(|(minute, bucket)| TimeSeriesPoint {
                minute_start: DateTime::from_timestamp(minute * 60, 0).unwrap_or_default(),
                requests: bucket.requests,
                failures: bucket.failures,
                avg_latency_ms: if bucket.requests > 0 {
                    bucket.latency_sum_ms as f64 / bucket.requests as f64
                } else {
                    0.0
                },
            })
            .collect()
    }

    pub async fn totals(&self) -> HashMap<String, ProviderTotals> {
        self.inner.read().await.totals.clone()
    }

    pub async fn baselines(&self) -> HashMap<String, Baseline> {
        self.inner.read().await.baselines.clone()
    }

    pub async fn promise_detections(&self) -> Vec<PromiseDetection> {
        self.inner
            .read()
            .await
            .promise_detections
            .iter()
            .cloned()
            .collect()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

fn apply_datum(store: &mut MetricsInner, datum: MetricDatum) {
    let totals = store.totals.entry(datum.provider.clone()).or_default();
    totals.requests += 1;
    match datum.outcome {
        Outcome::Success => totals.successes += 1,
        Outcome::Failure => totals.failures += 1,
    }
    totals.tokens += datum.tokens.unwrap_or(0) as u64;
    if let Some(kind) = datum.error_kind {
        *totals.error_kind_counts.entry(kind).or_insert(0) += 1;
    }

    let outcome_value = match datum.outcome {
        Outcome::Success => 1.0,
        Outcome::Failure => 0.0,
    };
    store
        .baselines
        .entry(datum.provider.clone())
        .and_modify(|b| {
            b.success_rate =
                BASELINE_ALPHA * outcome_value + (1.0 - BASELINE_ALPHA) * b.success_rate;
            b.latency_ms =
                BASELINE_ALPHA * datum.latency_ms as f64 + (1.0 - BASELINE_ALPHA) * b.latency_ms;
            b.samples += 1;
        })
        .or_insert(Baseline {
            success_rate: outcome_value,
            latency_ms: datum.latency_ms as f64,
            samples: 1,
        });

    store.raw.push_back(datum);
    if store.raw.len() > RAW_HARD_CAP {
        if let Some(oldest) = store.raw.pop_front() {
            fold_into_bucket(store, &oldest);
        }
    }
}

fn fold_into_bucket(store: &mut MetricsInner, datum: &MetricDatum) {
    let minute = datum.timestamp.timestamp() / 60;
    let bucket = store
        .buckets
        .entry(minute)
        .or_default()
        .entry(datum.provider.clone())
        .or_default();
    bucket.requests += 1;
    match datum.outcome {
        Outcome::Success => bucket.successes += 1,
        Outcome::Failure => bucket.failures += 1,
    }
    bucket.latency_sum_ms += datum.latency_ms;
    bucket.max_latency_ms = bucket.max_latency_ms.max(datum.latency_ms);
}

fn percentile(sorted: &[u64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)] as f64
}
