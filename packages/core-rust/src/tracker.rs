//! Request lifecycle, sub-operation timers, and cross-thread propagation.
//!
//! A [`LatencyTracker`] is the entry point for all instrumentation calls.
//! Request-boundary interceptors call [`start_request`]/[`end_request`],
//! collaborator wrappers call the four sub-operation timer pairs, and
//! application code opens named [`phase`] scopes around logical sub-steps.
//!
//! Every operation is defensive: called without a current request context it
//! silently does nothing, so call sites need no guards. Instrumentation must
//! never alter request outcomes.
//!
//! [`start_request`]: LatencyTracker::start_request
//! [`end_request`]: LatencyTracker::end_request
//! [`phase`]: LatencyTracker::phase

use std::cell::RefCell;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::clock::{ClockSource, MonotonicClock};
use crate::config;
use crate::context::{OperationKind, RequestContext, RequestSnapshot};
use crate::phase::{self, PhaseGuard};
use crate::report::{self, EndpointRecorders};

thread_local! {
    /// The request context installed on this thread, if any. Only visible on
    /// the thread that created it unless explicitly propagated via
    /// [`LatencyTracker::wrap_with_context`].
    static CURRENT_CONTEXT: RefCell<Option<Arc<RequestContext>>> =
        const { RefCell::new(None) };
}

/// Clones the calling thread's current context, if one is installed.
pub(crate) fn current_context() -> Option<Arc<RequestContext>> {
    CURRENT_CONTEXT.with(|slot| slot.borrow().clone())
}

fn install_context(ctx: Option<Arc<RequestContext>>) -> Option<Arc<RequestContext>> {
    CURRENT_CONTEXT.with(|slot| slot.replace(ctx))
}

/// Opaque handle returned by the `start_*_operation` calls.
///
/// Captures the sub-operation kind and start instant. An inert handle is
/// returned when no request context was current; ending it is a no-op. The
/// handle may cross threads, but the matching `end_*` call reads the context
/// installed on the thread it runs on.
#[derive(Debug)]
pub struct OperationTimer {
    inner: Option<TimerInner>,
}

#[derive(Debug)]
struct TimerInner {
    kind: OperationKind,
    start_nanos: u64,
}

impl OperationTimer {
    fn noop() -> Self {
        Self { inner: None }
    }

    /// Whether this handle will record anything when ended. False for
    /// handles created without a current request context.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.is_some()
    }
}

/// Per-request latency attribution tracker.
///
/// Holds the clock, the slow-request threshold, and the cache of registered
/// per-endpoint duration distributions. Most deployments use the single
/// [`LatencyTracker::global`] instance; tests construct their own with a
/// [`ManualClock`](crate::ManualClock).
pub struct LatencyTracker {
    clock: Arc<dyn ClockSource>,
    slow_request_threshold_nanos: u64,
    recorders: DashMap<String, EndpointRecorders>,
}

static GLOBAL: OnceLock<LatencyTracker> = OnceLock::new();

impl LatencyTracker {
    /// Creates a tracker with an explicit clock and slow-request threshold.
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>, slow_request_threshold_nanos: u64) -> Self {
        Self {
            clock,
            slow_request_threshold_nanos,
            recorders: DashMap::new(),
        }
    }

    /// The process-wide tracker: real monotonic clock, threshold resolved
    /// from the environment on first use.
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(|| {
            Self::new(
                Arc::new(MonotonicClock::new()),
                config::resolve_slow_request_threshold(),
            )
        })
    }

    /// The threshold above which a request produces the slow-request
    /// diagnostic, in nanoseconds.
    #[must_use]
    pub fn slow_request_threshold_nanos(&self) -> u64 {
        self.slow_request_threshold_nanos
    }

    /// Begins tracking a logical request on the calling thread.
    ///
    /// Installs a fresh context as current-for-this-thread, starts the
    /// overall request timer, and starts accruing server time. Any leftover
    /// context from a previous request on this pooled thread is discarded.
    pub fn start_request(&self, endpoint: &str, method: &str, uri_path: Option<&str>) {
        let ctx = Arc::new(RequestContext::new(
            endpoint,
            method,
            uri_path.map(str::to_owned),
            self.clock.now_nanos(),
        ));
        install_context(Some(ctx));
    }

    /// Finishes the calling thread's current request, if any.
    ///
    /// Clears the thread's context slot and phase stack first, so cleanup is
    /// guaranteed even if reporting fails, then records the per-endpoint
    /// duration distributions, emits the slow-request diagnostic when total
    /// time strictly exceeds the threshold, and returns the final snapshot.
    pub fn end_request(&self) -> Option<RequestSnapshot> {
        let ctx = install_context(None)?;
        phase::clear_stack();

        let now_nanos = self.clock.now_nanos();
        ctx.record_total_time(now_nanos.saturating_sub(ctx.request_start_nanos()));
        ctx.pause_server_timer(now_nanos);
        let snapshot = ctx.snapshot();

        // A panicking metrics recorder must not reach the request thread's
        // caller; the context slot is already clean at this point.
        let reported = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.recorders
                .entry(report::recorder_key(ctx.endpoint(), ctx.method()))
                .or_insert_with(|| EndpointRecorders::register(ctx.endpoint(), ctx.method()))
                .record(&snapshot);
            if report::exceeds_threshold(
                snapshot.total_time_nanos,
                self.slow_request_threshold_nanos,
            ) {
                report::log_slow_request(&snapshot);
            }
        }));
        if reported.is_err() {
            tracing::error!(
                endpoint = %snapshot.endpoint,
                method = %snapshot.method,
                "latency reporting failed; request processing unaffected"
            );
        }

        Some(snapshot)
    }

    fn start_operation(&self, kind: OperationKind) -> OperationTimer {
        let Some(ctx) = current_context() else {
            return OperationTimer::noop();
        };
        let now_nanos = self.clock.now_nanos();
        // Application code was running until this instant.
        ctx.pause_server_timer(now_nanos);
        ctx.increment_operation_count(kind);
        OperationTimer {
            inner: Some(TimerInner {
                kind,
                start_nanos: now_nanos,
            }),
        }
    }

    fn end_operation(&self, timer: OperationTimer) {
        let Some(inner) = timer.inner else { return };
        let Some(ctx) = current_context() else { return };
        let now_nanos = self.clock.now_nanos();
        ctx.add_operation_time(inner.kind, now_nanos.saturating_sub(inner.start_nanos));
        ctx.resume_server_timer(now_nanos);
    }

    /// Starts timing a database operation.
    pub fn start_database_operation(&self) -> OperationTimer {
        self.start_operation(OperationKind::Database)
    }

    /// Ends a database operation and adds its elapsed time to the request.
    pub fn end_database_operation(&self, timer: OperationTimer) {
        self.end_operation(timer);
    }

    /// Starts timing a search operation.
    pub fn start_search_operation(&self) -> OperationTimer {
        self.start_operation(OperationKind::Search)
    }

    /// Ends a search operation.
    pub fn end_search_operation(&self, timer: OperationTimer) {
        self.end_operation(timer);
    }

    /// Starts timing an auth operation.
    pub fn start_auth_operation(&self) -> OperationTimer {
        self.start_operation(OperationKind::Auth)
    }

    /// Ends an auth operation.
    pub fn end_auth_operation(&self, timer: OperationTimer) {
        self.end_operation(timer);
    }

    /// Starts timing an RDF store operation.
    pub fn start_rdf_operation(&self) -> OperationTimer {
        self.start_operation(OperationKind::Rdf)
    }

    /// Ends an RDF store operation.
    pub fn end_rdf_operation(&self, timer: OperationTimer) {
        self.end_operation(timer);
    }

    /// Records one JSON deserialization of `byte_length` bytes against the
    /// current request. No-op without a context.
    pub fn track_json_deserialize(&self, byte_length: u64) {
        if let Some(ctx) = current_context() {
            ctx.track_json_deserialize(byte_length);
        }
    }

    /// Opens a named phase scope on the calling thread. The returned guard
    /// closes the phase when dropped; without a current context the guard is
    /// inert.
    pub fn phase(&self, name: &str) -> PhaseGuard {
        match current_context() {
            Some(ctx) => phase::open_phase(ctx, self.clock.clone(), name),
            None => PhaseGuard::noop(),
        }
    }

    /// Wraps a task so it runs with the calling thread's current context
    /// installed on whichever thread executes it.
    ///
    /// Fan-out workers of one logical request all contribute to the shared
    /// counters this way. The context is removed again when the task
    /// finishes, panic included; the phase stack is never propagated, so a
    /// worker's phases are always its own. Without a current context the
    /// task runs unchanged.
    pub fn wrap_with_context<F, R>(&self, task: F) -> impl FnOnce() -> R
    where
        F: FnOnce() -> R,
    {
        let captured = current_context();
        move || {
            let _guard = captured.map(InstalledContext::new);
            task()
        }
    }

    /// Test/operational utility: clears the calling thread's context slot
    /// and phase stack and drops all cached metric registrations. Contexts
    /// installed on other threads are unaffected.
    pub fn reset(&self) {
        install_context(None);
        phase::clear_stack();
        self.recorders.clear();
    }
}

/// Drop guard that restores the previously installed context, clearing the
/// slot on fresh worker threads even when the wrapped task panics.
struct InstalledContext {
    previous: Option<Arc<RequestContext>>,
}

impl InstalledContext {
    fn new(ctx: Arc<RequestContext>) -> Self {
        Self {
            previous: install_context(Some(ctx)),
        }
    }
}

impl Drop for InstalledContext {
    fn drop(&mut self) {
        install_context(self.previous.take());
    }
}
