// Prometheus metrics definitions for the pingpong backend.

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Counters ─────────────────────────────────────────────────────

    /// Challenges created.
    pub static ref CHALLENGES_CREATED_TOTAL: IntCounter = IntCounter::new(
        "pingpong_challenges_created_total",
        "Challenges created",
    )
    .unwrap();

    /// Challenge state transitions, by target status.
    pub static ref CHALLENGE_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pingpong_challenge_transitions_total", "Challenge state transitions"),
        &["status"],
    )
    .unwrap();

    /// Decided matches run through the rating engine.
    pub static ref RATING_UPDATES_TOTAL: IntCounter = IntCounter::new(
        "pingpong_rating_updates_total",
        "Matches rated",
    )
    .unwrap();

    pub static ref TOURNAMENTS_STARTED_TOTAL: IntCounter = IntCounter::new(
        "pingpong_tournaments_started_total",
        "Tournaments started",
    )
    .unwrap();

    /// Error responses, by error kind.
    pub static ref API_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pingpong_api_errors_total", "Error responses by kind"),
        &["kind"],
    )
    .unwrap();

    /// Bot updates handled, by update kind (message, callback, ignored).
    pub static ref BOT_UPDATES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pingpong_bot_updates_total", "Bot webhook updates handled"),
        &["kind"],
    )
    .unwrap();

    /// Total API requests, by method/endpoint/status.
    pub static ref API_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pingpong_api_requests_total", "Total API requests"),
        &["method", "endpoint", "status"],
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// API request duration in seconds, by endpoint.
    pub static ref API_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "pingpong_api_request_duration_seconds",
            "API request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        &["endpoint"],
    )
    .unwrap();
}

static REGISTER: Once = Once::new();

/// Register all metrics with the custom registry. Safe to call more than once.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(CHALLENGES_CREATED_TOTAL.clone()),
            Box::new(CHALLENGE_TRANSITIONS_TOTAL.clone()),
            Box::new(RATING_UPDATES_TOTAL.clone()),
            Box::new(TOURNAMENTS_STARTED_TOTAL.clone()),
            Box::new(API_ERRORS_TOTAL.clone()),
            Box::new(BOT_UPDATES_TOTAL.clone()),
            Box::new(API_REQUESTS_TOTAL.clone()),
            Box::new(API_REQUEST_DURATION_SECONDS.clone()),
        ];

        for c in collectors {
            if let Err(e) = REGISTRY.register(c) {
                tracing::warn!("Failed to register metric: {e}");
            }
        }
    });
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {e}");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Normalize a URL path for metric labels: replace numeric path segments with `:id`
/// to prevent cardinality explosion.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.parse::<i64>().is_ok() {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/api/leaderboard"), "/api/leaderboard");
        assert_eq!(
            normalize_path("/api/challenges/42/accept"),
            "/api/challenges/:id/accept"
        );
        assert_eq!(normalize_path("/api/user/7/history"), "/api/user/:id/history");
    }

    #[test]
    fn test_register_twice_and_gather() {
        register_metrics();
        register_metrics();

        CHALLENGES_CREATED_TOTAL.inc();
        CHALLENGE_TRANSITIONS_TOTAL
            .with_label_values(&["accepted"])
            .inc();
        API_ERRORS_TOTAL.with_label_values(&["not_found"]).inc();

        let output = gather_metrics();
        assert!(output.contains("pingpong_challenges_created_total"));
        assert!(output.contains("status=\"accepted\""));
    }
}
