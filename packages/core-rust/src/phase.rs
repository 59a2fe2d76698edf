//! Nested named-phase scopes and exclusive-time attribution.
//!
//! Phases attribute wall-clock and database time to caller-named sub-steps of
//! a request ("resourceGet", "serialize", ...). They nest within a single
//! thread's execution and are tracked on a per-thread stack that is
//! deliberately independent of the current-context slot: handing a context to
//! a worker thread never hands over phase nesting.
//!
//! Closing is driven by [`PhaseGuard`]'s `Drop` impl, so a phase is folded
//! into the request's accumulators on every exit path, including panics.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::ClockSource;
use crate::context::RequestContext;

thread_local! {
    /// Stack of open phase scopes on this thread. Innermost phase is last.
    static PHASE_STACK: RefCell<Vec<ActivePhase>> = const { RefCell::new(Vec::new()) };
}

/// Process-wide id source so a guard can find its own entry even after
/// out-of-order closes have shuffled the stack.
static NEXT_PHASE_ID: AtomicU64 = AtomicU64::new(1);

/// One currently-open phase scope.
#[derive(Debug)]
struct ActivePhase {
    id: u64,
    name: String,
    start_nanos: u64,
    /// Snapshot of the context's cumulative db time at entry; the delta at
    /// close is the db time incurred strictly within this phase.
    db_time_at_start_nanos: u64,
    /// Wall time contributed by nested child phases closed so far.
    child_elapsed_nanos: u64,
    /// Database time contributed by nested child phases closed so far.
    child_db_nanos: u64,
}

/// Scoped handle for a named phase. Closes the phase when dropped.
///
/// Obtained from [`LatencyTracker::phase`](crate::LatencyTracker::phase).
/// When no request context was current at open time the guard is inert and
/// dropping it does nothing.
///
/// Not `Send`: phase scopes belong to the thread that opened them.
pub struct PhaseGuard {
    inner: Option<GuardInner>,
    _not_send: PhantomData<*const ()>,
}

struct GuardInner {
    ctx: Arc<RequestContext>,
    clock: Arc<dyn ClockSource>,
    id: u64,
}

impl PhaseGuard {
    /// Inert guard for calls made without a current request context.
    pub(crate) fn noop() -> Self {
        Self {
            inner: None,
            _not_send: PhantomData,
        }
    }

    /// Closes the phase now instead of at end of scope.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            close_phase(&inner.ctx, inner.clock.as_ref(), inner.id);
        }
    }
}

/// Opens a phase scope on the calling thread: snapshots the clock and the
/// context's cumulative db time, and pushes an entry onto the thread's stack.
pub(crate) fn open_phase(
    ctx: Arc<RequestContext>,
    clock: Arc<dyn ClockSource>,
    name: &str,
) -> PhaseGuard {
    let id = NEXT_PHASE_ID.fetch_add(1, Ordering::Relaxed);
    PHASE_STACK.with(|stack| {
        stack.borrow_mut().push(ActivePhase {
            id,
            name: name.to_owned(),
            start_nanos: clock.now_nanos(),
            db_time_at_start_nanos: ctx.db_time_nanos(),
            child_elapsed_nanos: 0,
            child_db_nanos: 0,
        });
    });
    PhaseGuard {
        inner: Some(GuardInner { ctx, clock, id }),
        _not_send: PhantomData,
    }
}

/// Closes the phase with the given id and folds its timings into the context.
///
/// Pop is defensive: the common case removes the top of the stack, but an
/// out-of-order close (caller dropped guards in the wrong order) removes the
/// entry from wherever it sits, and a phase that is no longer on the stack at
/// all (stack cleared at request end) is ignored. Instrumentation mistakes
/// must never crash request processing.
fn close_phase(ctx: &RequestContext, clock: &dyn ClockSource, id: u64) {
    let closed = PHASE_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let index = stack.iter().rposition(|phase| phase.id == id)?;
        let phase = stack.remove(index);

        let now_nanos = clock.now_nanos();
        let elapsed = now_nanos.saturating_sub(phase.start_nanos);
        let exclusive = elapsed.saturating_sub(phase.child_elapsed_nanos);
        let db_during_phase = ctx
            .db_time_nanos()
            .saturating_sub(phase.db_time_at_start_nanos);
        let exclusive_db = db_during_phase.saturating_sub(phase.child_db_nanos);

        // The surviving innermost phase absorbs this phase's full elapsed and
        // db time (grandchildren included), so an ancestor's exclusive share
        // subtracts all descendant contributions.
        if let Some(parent) = stack.last_mut() {
            parent.child_elapsed_nanos += elapsed;
            parent.child_db_nanos += db_during_phase;
        }

        if stack.is_empty() {
            // Release the backing storage rather than pinning per-thread
            // capacity for the life of a pooled thread.
            stack.shrink_to_fit();
        }

        Some((phase.name, elapsed, exclusive, exclusive_db))
    });

    if let Some((name, elapsed, exclusive, exclusive_db)) = closed {
        ctx.add_phase_result(&name, elapsed, exclusive, exclusive_db);
    }
}

/// Drops every open phase on the calling thread and releases the stack's
/// storage. Called at request end and by `reset`.
pub(crate) fn clear_stack() {
    PHASE_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        stack.clear();
        stack.shrink_to_fit();
    });
}

#[cfg(test)]
pub(crate) fn stack_depth() -> usize {
    PHASE_STACK.with(|stack| stack.borrow().len())
}
