//! Per-request timing state.
//!
//! A [`RequestContext`] is created at request start and lives until request
//! end. It may be shared across worker threads processing parts of the same
//! logical request (see [`LatencyTracker::wrap_with_context`]), so every
//! accumulator is an atomic and the phase maps are concurrent.
//!
//! All atomic operations use `Ordering::Relaxed`: each counter is independent
//! and monotonically increasing, and the end-of-request snapshot tolerates
//! sub-microsecond skew between counters.
//!
//! [`LatencyTracker::wrap_with_context`]: crate::LatencyTracker::wrap_with_context

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// The tracked sub-operation categories.
///
/// Each kind has its own time accumulator and operation counter on the
/// [`RequestContext`]. Everything not inside a tracked sub-operation counts
/// as server (application) time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Database,
    Search,
    Auth,
    Rdf,
}

impl OperationKind {
    /// Stable lower-case label used in metric names and diagnostics.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Database => "db",
            Self::Search => "search",
            Self::Auth => "auth",
            Self::Rdf => "rdf",
        }
    }
}

/// Mutable timing state for one logical inbound request.
///
/// Identity fields are immutable after construction; all accumulators are
/// atomics so concurrent helper threads sharing this context can add to them
/// without locks.
#[derive(Debug)]
pub struct RequestContext {
    endpoint: String,
    method: String,
    uri_path: Option<String>,
    request_start_nanos: u64,

    db_time_nanos: AtomicU64,
    search_time_nanos: AtomicU64,
    auth_time_nanos: AtomicU64,
    rdf_time_nanos: AtomicU64,
    server_time_nanos: AtomicU64,

    db_operation_count: AtomicU64,
    search_operation_count: AtomicU64,
    auth_operation_count: AtomicU64,
    rdf_operation_count: AtomicU64,

    /// Monotonic instant at which application code resumed after the last
    /// tracked sub-operation (or at request start). Zero means a
    /// sub-operation is in flight and server time is not accruing.
    internal_timer_start_nanos: AtomicU64,

    json_bytes_deserialized: AtomicU64,
    json_deserialize_count: AtomicU64,

    /// Written exactly once, at request end.
    total_time_nanos: AtomicU64,

    /// Inclusive wall time per phase name.
    phase_time_nanos: DashMap<String, u64>,
    /// Inclusive time minus time attributed to nested child phases.
    phase_exclusive_time_nanos: DashMap<String, u64>,
    /// Database time incurred while the phase was innermost.
    phase_db_time_nanos: DashMap<String, u64>,
}

impl RequestContext {
    /// Creates a context for a request starting at `start_nanos`. The HTTP
    /// method is normalized to upper-case. The internal server-time timer
    /// starts running immediately.
    pub(crate) fn new(
        endpoint: impl Into<String>,
        method: &str,
        uri_path: Option<String>,
        start_nanos: u64,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.to_ascii_uppercase(),
            uri_path,
            request_start_nanos: start_nanos,
            db_time_nanos: AtomicU64::new(0),
            search_time_nanos: AtomicU64::new(0),
            auth_time_nanos: AtomicU64::new(0),
            rdf_time_nanos: AtomicU64::new(0),
            server_time_nanos: AtomicU64::new(0),
            db_operation_count: AtomicU64::new(0),
            search_operation_count: AtomicU64::new(0),
            auth_operation_count: AtomicU64::new(0),
            rdf_operation_count: AtomicU64::new(0),
            internal_timer_start_nanos: AtomicU64::new(start_nanos),
            json_bytes_deserialized: AtomicU64::new(0),
            json_deserialize_count: AtomicU64::new(0),
            total_time_nanos: AtomicU64::new(0),
            phase_time_nanos: DashMap::new(),
            phase_exclusive_time_nanos: DashMap::new(),
            phase_db_time_nanos: DashMap::new(),
        }
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn request_start_nanos(&self) -> u64 {
        self.request_start_nanos
    }

    /// Cumulative database time so far. Phase scopes snapshot this at entry
    /// to attribute db time to the innermost phase.
    pub(crate) fn db_time_nanos(&self) -> u64 {
        self.db_time_nanos.load(Ordering::Relaxed)
    }

    fn time_accumulator(&self, kind: OperationKind) -> &AtomicU64 {
        match kind {
            OperationKind::Database => &self.db_time_nanos,
            OperationKind::Search => &self.search_time_nanos,
            OperationKind::Auth => &self.auth_time_nanos,
            OperationKind::Rdf => &self.rdf_time_nanos,
        }
    }

    fn operation_counter(&self, kind: OperationKind) -> &AtomicU64 {
        match kind {
            OperationKind::Database => &self.db_operation_count,
            OperationKind::Search => &self.search_operation_count,
            OperationKind::Auth => &self.auth_operation_count,
            OperationKind::Rdf => &self.rdf_operation_count,
        }
    }

    pub(crate) fn add_operation_time(&self, kind: OperationKind, nanos: u64) {
        self.time_accumulator(kind).fetch_add(nanos, Ordering::Relaxed);
    }

    pub(crate) fn increment_operation_count(&self, kind: OperationKind) {
        self.operation_counter(kind).fetch_add(1, Ordering::Relaxed);
    }

    /// Folds the currently open server-time span (if any) into
    /// `server_time_nanos` and stops the internal timer. Called when a
    /// tracked sub-operation begins and once more at request end.
    pub(crate) fn pause_server_timer(&self, now_nanos: u64) {
        let started = self.internal_timer_start_nanos.swap(0, Ordering::Relaxed);
        if started != 0 {
            self.server_time_nanos
                .fetch_add(now_nanos.saturating_sub(started), Ordering::Relaxed);
        }
    }

    /// Restarts the internal timer: application code is running again.
    pub(crate) fn resume_server_timer(&self, now_nanos: u64) {
        self.internal_timer_start_nanos
            .store(now_nanos, Ordering::Relaxed);
    }

    pub(crate) fn track_json_deserialize(&self, byte_length: u64) {
        self.json_bytes_deserialized
            .fetch_add(byte_length, Ordering::Relaxed);
        self.json_deserialize_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_total_time(&self, nanos: u64) {
        self.total_time_nanos.store(nanos, Ordering::Relaxed);
    }

    /// Folds a closed phase scope into the three phase maps.
    ///
    /// `exclusive_db_nanos` is only recorded when strictly positive: phases
    /// that performed no database work of their own stay out of the db
    /// breakdown, while the exclusive-time map is written unconditionally so
    /// every opened phase shows up in diagnostics.
    pub(crate) fn add_phase_result(
        &self,
        name: &str,
        elapsed_nanos: u64,
        exclusive_nanos: u64,
        exclusive_db_nanos: u64,
    ) {
        *self.phase_time_nanos.entry(name.to_owned()).or_insert(0) += elapsed_nanos;
        *self
            .phase_exclusive_time_nanos
            .entry(name.to_owned())
            .or_insert(0) += exclusive_nanos;
        if exclusive_db_nanos > 0 {
            *self.phase_db_time_nanos.entry(name.to_owned()).or_insert(0) +=
                exclusive_db_nanos;
        }
    }

    /// Produces the immutable end-of-request view.
    pub(crate) fn snapshot(&self) -> RequestSnapshot {
        let server_time_nanos = self.server_time_nanos.load(Ordering::Relaxed);
        let phase_exclusive_time_nanos = sorted_descending(&self.phase_exclusive_time_nanos);
        let exclusive_sum: u64 = phase_exclusive_time_nanos.iter().map(|(_, v)| v).sum();

        RequestSnapshot {
            endpoint: self.endpoint.clone(),
            method: self.method.clone(),
            uri_path: self.uri_path.clone(),
            total_time_nanos: self.total_time_nanos.load(Ordering::Relaxed),
            db_time_nanos: self.db_time_nanos.load(Ordering::Relaxed),
            search_time_nanos: self.search_time_nanos.load(Ordering::Relaxed),
            auth_time_nanos: self.auth_time_nanos.load(Ordering::Relaxed),
            rdf_time_nanos: self.rdf_time_nanos.load(Ordering::Relaxed),
            server_time_nanos,
            db_operation_count: self.db_operation_count.load(Ordering::Relaxed),
            search_operation_count: self.search_operation_count.load(Ordering::Relaxed),
            auth_operation_count: self.auth_operation_count.load(Ordering::Relaxed),
            rdf_operation_count: self.rdf_operation_count.load(Ordering::Relaxed),
            json_bytes_deserialized: self.json_bytes_deserialized.load(Ordering::Relaxed),
            json_deserialize_count: self.json_deserialize_count.load(Ordering::Relaxed),
            phase_time_nanos: sorted_descending(&self.phase_time_nanos),
            phase_exclusive_time_nanos,
            phase_db_time_nanos: sorted_descending(&self.phase_db_time_nanos),
            unphased_server_nanos: server_time_nanos.saturating_sub(exclusive_sum),
        }
    }
}

/// Copies a phase map into a vector sorted by descending time, with name as
/// the tie-breaker for deterministic output.
fn sorted_descending(map: &DashMap<String, u64>) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = map
        .iter()
        .map(|entry| (entry.key().clone(), *entry.value()))
        .collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries
}

/// Read-only view of a finished request, returned by
/// [`LatencyTracker::end_request`](crate::LatencyTracker::end_request).
///
/// Phase breakdowns are sorted by descending time. All durations are
/// monotonic-clock nanoseconds.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSnapshot {
    pub endpoint: String,
    pub method: String,
    pub uri_path: Option<String>,
    pub total_time_nanos: u64,
    pub db_time_nanos: u64,
    pub search_time_nanos: u64,
    pub auth_time_nanos: u64,
    pub rdf_time_nanos: u64,
    pub server_time_nanos: u64,
    pub db_operation_count: u64,
    pub search_operation_count: u64,
    pub auth_operation_count: u64,
    pub rdf_operation_count: u64,
    pub json_bytes_deserialized: u64,
    pub json_deserialize_count: u64,
    /// Inclusive wall time per phase, descending.
    pub phase_time_nanos: Vec<(String, u64)>,
    /// Exclusive wall time per phase (children subtracted), descending.
    pub phase_exclusive_time_nanos: Vec<(String, u64)>,
    /// Database time attributed to each phase while innermost, descending.
    pub phase_db_time_nanos: Vec<(String, u64)>,
    /// Server time not accounted for by any explicit phase.
    pub unphased_server_nanos: u64,
}

impl RequestSnapshot {
    /// The path reported in diagnostics: the raw URI path when captured,
    /// otherwise the logical endpoint name.
    #[must_use]
    pub fn display_path(&self) -> &str {
        self.uri_path.as_deref().unwrap_or(&self.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_is_normalized_upper_case() {
        let ctx = RequestContext::new("tables", "get", None, 1_000);
        assert_eq!(ctx.method(), "GET");
    }

    #[test]
    fn operation_time_and_count_accumulate() {
        let ctx = RequestContext::new("tables", "GET", None, 1_000);
        ctx.add_operation_time(OperationKind::Database, 50);
        ctx.add_operation_time(OperationKind::Database, 25);
        ctx.increment_operation_count(OperationKind::Database);
        ctx.increment_operation_count(OperationKind::Database);
        ctx.increment_operation_count(OperationKind::Search);

        let snap = ctx.snapshot();
        assert_eq!(snap.db_time_nanos, 75);
        assert_eq!(snap.db_operation_count, 2);
        assert_eq!(snap.search_operation_count, 1);
        assert_eq!(snap.search_time_nanos, 0);
    }

    #[test]
    fn server_timer_pause_folds_elapsed_span() {
        let ctx = RequestContext::new("tables", "GET", None, 1_000);
        ctx.pause_server_timer(1_400);
        assert_eq!(ctx.snapshot().server_time_nanos, 400);

        // Timer is stopped: a second pause adds nothing.
        ctx.pause_server_timer(2_000);
        assert_eq!(ctx.snapshot().server_time_nanos, 400);

        ctx.resume_server_timer(2_000);
        ctx.pause_server_timer(2_300);
        assert_eq!(ctx.snapshot().server_time_nanos, 700);
    }

    #[test]
    fn server_timer_clamps_backward_clock() {
        let ctx = RequestContext::new("tables", "GET", None, 5_000);
        ctx.pause_server_timer(4_000);
        assert_eq!(ctx.snapshot().server_time_nanos, 0);
    }

    #[test]
    fn phase_result_reentrancy_accumulates() {
        let ctx = RequestContext::new("tables", "GET", None, 1_000);
        ctx.add_phase_result("resourceGet", 100, 80, 30);
        ctx.add_phase_result("resourceGet", 50, 50, 0);

        let snap = ctx.snapshot();
        assert_eq!(snap.phase_time_nanos, vec![("resourceGet".to_owned(), 150)]);
        assert_eq!(
            snap.phase_exclusive_time_nanos,
            vec![("resourceGet".to_owned(), 130)]
        );
        // Zero exclusive-db contributions are dropped, not recorded as 0.
        assert_eq!(
            snap.phase_db_time_nanos,
            vec![("resourceGet".to_owned(), 30)]
        );
    }

    #[test]
    fn zero_db_phase_stays_out_of_db_map() {
        let ctx = RequestContext::new("tables", "GET", None, 1_000);
        ctx.add_phase_result("validate", 100, 100, 0);

        let snap = ctx.snapshot();
        assert_eq!(snap.phase_exclusive_time_nanos.len(), 1);
        assert!(snap.phase_db_time_nanos.is_empty());
    }

    #[test]
    fn snapshot_sorts_phases_descending() {
        let ctx = RequestContext::new("tables", "GET", None, 1_000);
        ctx.add_phase_result("small", 10, 10, 0);
        ctx.add_phase_result("large", 300, 300, 0);
        ctx.add_phase_result("medium", 100, 100, 0);

        let snap = ctx.snapshot();
        let names: Vec<&str> = snap
            .phase_time_nanos
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(names, vec!["large", "medium", "small"]);
    }

    #[test]
    fn unphased_server_nanos_clamps_to_zero() {
        let ctx = RequestContext::new("tables", "GET", None, 1_000);
        ctx.resume_server_timer(1_000);
        ctx.pause_server_timer(1_100); // 100ns of server time
        ctx.add_phase_result("wide", 500, 500, 0); // exclusive exceeds server

        assert_eq!(ctx.snapshot().unphased_server_nanos, 0);
    }

    #[test]
    fn display_path_prefers_uri_path() {
        let ctx = RequestContext::new(
            "tables",
            "GET",
            Some("/api/v1/tables/123".to_owned()),
            1_000,
        );
        assert_eq!(ctx.snapshot().display_path(), "/api/v1/tables/123");

        let bare = RequestContext::new("tables", "GET", None, 1_000);
        assert_eq!(bare.snapshot().display_path(), "tables");
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let ctx = RequestContext::new("tables", "GET", None, 1_000);
        ctx.add_phase_result("resourceGet", 100, 100, 40);
        let json = serde_json::to_value(ctx.snapshot()).unwrap();
        assert_eq!(json["endpoint"], "tables");
        assert_eq!(json["phase_db_time_nanos"][0][0], "resourceGet");
    }
}
