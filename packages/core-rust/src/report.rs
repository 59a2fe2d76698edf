//! End-of-request reporting: duration distributions and the slow-request
//! diagnostic line.
//!
//! Emission goes through the `metrics` facade; whatever recorder the host
//! process installs (Prometheus exporter, test recorder, nothing at all)
//! receives the recordings. This module only decides what to emit and under
//! which stable key.

use metrics::{histogram, Histogram};

use crate::context::RequestSnapshot;

/// The six duration distributions recorded for one endpoint+method pair.
///
/// Handles are registered once per key and cached by the tracker, so
/// concurrent requests to the same endpoint reuse the same series.
pub(crate) struct EndpointRecorders {
    total: Histogram,
    db: Histogram,
    search: Histogram,
    auth: Histogram,
    rdf: Histogram,
    server: Histogram,
}

impl EndpointRecorders {
    pub(crate) fn register(endpoint: &str, method: &str) -> Self {
        let labels = |name: &'static str| {
            histogram!(
                name,
                "endpoint" => endpoint.to_owned(),
                "method" => method.to_owned()
            )
        };
        Self {
            total: labels("request_duration_seconds"),
            db: labels("request_db_duration_seconds"),
            search: labels("request_search_duration_seconds"),
            auth: labels("request_auth_duration_seconds"),
            rdf: labels("request_rdf_duration_seconds"),
            server: labels("request_server_duration_seconds"),
        }
    }

    /// Records the finished request. Total and server time are always
    /// recorded; a sub-operation distribution is only recorded when the
    /// request actually performed that kind of work.
    pub(crate) fn record(&self, snapshot: &RequestSnapshot) {
        self.total.record(nanos_to_seconds(snapshot.total_time_nanos));
        self.server
            .record(nanos_to_seconds(snapshot.server_time_nanos));
        for (histogram, nanos) in [
            (&self.db, snapshot.db_time_nanos),
            (&self.search, snapshot.search_time_nanos),
            (&self.auth, snapshot.auth_time_nanos),
            (&self.rdf, snapshot.rdf_time_nanos),
        ] {
            if nanos > 0 {
                histogram.record(nanos_to_seconds(nanos));
            }
        }
    }
}

/// Stable cache key for one endpoint+method series.
pub(crate) fn recorder_key(endpoint: &str, method: &str) -> String {
    format!("{endpoint}|{method}")
}

/// Strict boundary: a request is slow only when total time exceeds the
/// threshold; exactly-at-threshold is not slow.
pub(crate) fn exceeds_threshold(total_nanos: u64, threshold_nanos: u64) -> bool {
    total_nanos > threshold_nanos
}

/// Emits the single structured diagnostic line for a slow request.
pub(crate) fn log_slow_request(snapshot: &RequestSnapshot) {
    tracing::warn!(
        method = %snapshot.method,
        path = %snapshot.display_path(),
        total_ms = nanos_to_millis(snapshot.total_time_nanos),
        db_ms = nanos_to_millis(snapshot.db_time_nanos),
        search_ms = nanos_to_millis(snapshot.search_time_nanos),
        auth_ms = nanos_to_millis(snapshot.auth_time_nanos),
        rdf_ms = nanos_to_millis(snapshot.rdf_time_nanos),
        server_ms = nanos_to_millis(snapshot.server_time_nanos),
        db_ops = snapshot.db_operation_count,
        search_ops = snapshot.search_operation_count,
        rdf_ops = snapshot.rdf_operation_count,
        json_kb = bytes_to_kb(snapshot.json_bytes_deserialized),
        json_ops = snapshot.json_deserialize_count,
        phases = %format_breakdown(&snapshot.phase_time_nanos),
        phases_exclusive = %format_breakdown(&snapshot.phase_exclusive_time_nanos),
        phases_db = %format_breakdown(&snapshot.phase_db_time_nanos),
        unphased_server_ms = nanos_to_millis(snapshot.unphased_server_nanos),
        "slow request"
    );
}

/// Renders a (already descending-sorted) phase breakdown as
/// `name=1.2ms,other=0.4ms`. Empty breakdowns render as `-`.
fn format_breakdown(entries: &[(String, u64)]) -> String {
    if entries.is_empty() {
        return "-".to_owned();
    }
    entries
        .iter()
        .map(|(name, nanos)| format!("{name}={:.1}ms", nanos_to_millis(*nanos)))
        .collect::<Vec<_>>()
        .join(",")
}

#[allow(clippy::cast_precision_loss)]
fn nanos_to_seconds(nanos: u64) -> f64 {
    nanos as f64 / 1e9
}

#[allow(clippy::cast_precision_loss)]
fn nanos_to_millis(nanos: u64) -> f64 {
    nanos as f64 / 1e6
}

#[allow(clippy::cast_precision_loss)]
fn bytes_to_kb(bytes: u64) -> f64 {
    bytes as f64 / 1024.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_key_is_stable() {
        assert_eq!(recorder_key("tables", "GET"), "tables|GET");
        assert_ne!(recorder_key("tables", "GET"), recorder_key("tables", "PUT"));
    }

    #[test]
    fn threshold_boundary_is_strict() {
        assert!(!exceeds_threshold(1_000, 1_000));
        assert!(exceeds_threshold(1_001, 1_000));
        assert!(!exceeds_threshold(999, 1_000));
    }

    #[test]
    fn breakdown_formats_descending_entries() {
        let entries = vec![
            ("resourceGet".to_owned(), 60_000_000),
            ("serialize".to_owned(), 2_500_000),
        ];
        assert_eq!(
            format_breakdown(&entries),
            "resourceGet=60.0ms,serialize=2.5ms"
        );
    }

    #[test]
    fn empty_breakdown_renders_placeholder() {
        assert_eq!(format_breakdown(&[]), "-");
    }

    #[test]
    fn unit_conversions() {
        assert!((nanos_to_seconds(1_500_000_000) - 1.5).abs() < f64::EPSILON);
        assert!((nanos_to_millis(2_000_000) - 2.0).abs() < f64::EPSILON);
        assert!((bytes_to_kb(2_048) - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn recording_without_installed_recorder_is_safe() {
        // No metrics recorder installed in tests: handles are no-ops.
        let recorders = EndpointRecorders::register("tables", "GET");
        let ctx = crate::context::RequestContext::new("tables", "GET", None, 1_000);
        recorders.record(&ctx.snapshot());
    }
}
