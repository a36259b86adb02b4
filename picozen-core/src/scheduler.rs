//! Deterministic periodic task scheduler.
//!
//! Drives retransmission, heartbeats and housekeeping. The scheduler is
//! passive: someone must call [`PeriodicScheduler::process_tasks`], either
//! a cooperative caller or a dedicated background task polling on an
//! interval.
//!
//! Semantics:
//! - tasks fire when `next_due_ms <= now()`, ordered by `(next_due_ms, id)`;
//! - a fired task is rescheduled to `max(next_due + period, now + period)`,
//!   so missed periods are skipped rather than caught up;
//! - a task may remove itself or a peer task from within its callback;
//! - time regression is safe: future tasks simply do not fire.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{ZError, ZResult};

/// Upper bound on concurrently registered tasks.
pub const PERIODIC_SCHEDULER_MAX_TASKS: usize = 32;

struct Task {
    id: u32,
    period_ms: u64,
    next_due_ms: u64,
    callback: Box<dyn FnMut() + Send>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Task {
    /// Consume the task, firing its drop hook exactly once.
    fn finish(mut self) {
        if let Some(hook) = self.on_drop.take() {
            hook();
        }
    }
}

struct Inner {
    tasks: Vec<Task>,
    next_id: u32,
    /// Id of the task whose callback is currently executing, if any.
    running: Option<u32>,
    /// Set when the running task removed itself from its own callback.
    cancel_running: bool,
    now_fn: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl Inner {
    fn alloc_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != 0 && !self.tasks.iter().any(|t| t.id == id) {
                return id;
            }
        }
    }
}

/// Shared handle to the scheduler. Clones refer to the same task table,
/// which lets a callback capture a handle and cancel itself.
#[derive(Clone)]
pub struct PeriodicScheduler {
    inner: Arc<Mutex<Inner>>,
}

impl Default for PeriodicScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PeriodicScheduler {
    /// Create a scheduler with a monotonic millisecond clock.
    #[must_use]
    pub fn new() -> Self {
        let start = Instant::now();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                tasks: Vec::new(),
                next_id: 1,
                running: None,
                cancel_running: false,
                now_fn: Arc::new(move || start.elapsed().as_millis() as u64),
            })),
        }
    }

    /// Replace the clock. Used by tests to drive virtual time.
    pub fn set_time_source(&self, now_fn: impl Fn() -> u64 + Send + Sync + 'static) {
        self.inner.lock().now_fn = Arc::new(now_fn);
    }

    /// Register a task firing every `period_ms`.
    ///
    /// Returns the nonzero task id. A zero period is refused, as is any
    /// add beyond [`PERIODIC_SCHEDULER_MAX_TASKS`].
    pub fn add(
        &self,
        callback: impl FnMut() + Send + 'static,
        period_ms: u64,
    ) -> ZResult<u32> {
        self.add_with_drop(callback, || {}, period_ms)
    }

    /// Like [`add`](Self::add) with an explicit drop hook that runs exactly
    /// once when the task leaves the table.
    pub fn add_with_drop(
        &self,
        callback: impl FnMut() + Send + 'static,
        on_drop: impl FnOnce() + Send + 'static,
        period_ms: u64,
    ) -> ZResult<u32> {
        if period_ms == 0 {
            return Err(ZError::InvalidPeriod);
        }
        let mut inner = self.inner.lock();
        let in_flight = usize::from(inner.running.is_some());
        if inner.tasks.len() + in_flight >= PERIODIC_SCHEDULER_MAX_TASKS {
            return Err(ZError::SchedulerFull);
        }
        let id = inner.alloc_id();
        let now = (inner.now_fn)();
        inner.tasks.push(Task {
            id,
            period_ms,
            next_due_ms: now.saturating_add(period_ms),
            callback: Box::new(callback),
            on_drop: Some(Box::new(on_drop)),
        });
        Ok(id)
    }

    /// Remove a task. Its drop hook runs before this call returns, except
    /// for self-removal from within the task's own callback, where the
    /// drop runs as soon as the callback unwinds.
    pub fn remove(&self, id: u32) -> ZResult<()> {
        let mut inner = self.inner.lock();
        if inner.running == Some(id) {
            inner.cancel_running = true;
            return Ok(());
        }
        match inner.tasks.iter().position(|t| t.id == id) {
            Some(pos) => {
                let task = inner.tasks.swap_remove(pos);
                drop(inner);
                task.finish();
                Ok(())
            }
            None => Err(ZError::UnknownTask(id)),
        }
    }

    /// Run every task due at the time of the call. Returns the number of
    /// callbacks fired.
    pub fn process_tasks(&self) -> usize {
        let mut fired = 0;
        let mut due: Vec<(u64, u32)> = {
            let inner = self.inner.lock();
            let now = (inner.now_fn)();
            inner
                .tasks
                .iter()
                .filter(|t| t.next_due_ms <= now)
                .map(|t| (t.next_due_ms, t.id))
                .collect()
        };
        due.sort_unstable();

        for (_, id) in due {
            let mut inner = self.inner.lock();
            // A previous callback in this pass may have removed the task.
            let Some(pos) = inner.tasks.iter().position(|t| t.id == id) else {
                continue;
            };
            let mut task = inner.tasks.swap_remove(pos);
            inner.running = Some(id);
            inner.cancel_running = false;
            drop(inner);

            trace!(id, "periodic task fired");
            (task.callback)();
            fired += 1;

            let mut inner = self.inner.lock();
            inner.running = None;
            if inner.cancel_running {
                inner.cancel_running = false;
                drop(inner);
                task.finish();
            } else {
                let now = (inner.now_fn)();
                task.next_due_ms = task
                    .next_due_ms
                    .saturating_add(task.period_ms)
                    .max(now.saturating_add(task.period_ms));
                inner.tasks.push(task);
            }
        }
        fired
    }

    /// Remove every task, firing each drop hook exactly once.
    pub fn clear(&self) {
        let drained: Vec<Task> = {
            let mut inner = self.inner.lock();
            inner.tasks.drain(..).collect()
        };
        for task in drained {
            task.finish();
        }
    }

    /// Number of registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    fn virtual_clock() -> (PeriodicScheduler, Arc<AtomicU64>) {
        let sched = PeriodicScheduler::new();
        let clock = Arc::new(AtomicU64::new(0));
        let c = clock.clone();
        sched.set_time_source(move || c.load(Ordering::SeqCst));
        (sched, clock)
    }

    #[test]
    fn zero_period_refused() {
        let (sched, _clock) = virtual_clock();
        assert!(matches!(sched.add(|| {}, 0), Err(ZError::InvalidPeriod)));
    }

    #[test]
    fn fires_when_due_and_reschedules() {
        let (sched, clock) = virtual_clock();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        sched
            .add(move || _ = c.fetch_add(1, Ordering::SeqCst), 10)
            .unwrap();

        assert_eq!(sched.process_tasks(), 0);
        clock.store(10, Ordering::SeqCst);
        assert_eq!(sched.process_tasks(), 1);
        // Not due again until 20
        assert_eq!(sched.process_tasks(), 0);
        clock.store(20, Ordering::SeqCst);
        assert_eq!(sched.process_tasks(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missed_periods_are_skipped_not_caught_up() {
        let (sched, clock) = virtual_clock();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        sched
            .add(move || _ = c.fetch_add(1, Ordering::SeqCst), 10)
            .unwrap();

        // Jump far past several periods: exactly one firing, then the task
        // is pushed to now + period.
        clock.store(55, Ordering::SeqCst);
        assert_eq!(sched.process_tasks(), 1);
        assert_eq!(sched.process_tasks(), 0);
        clock.store(64, Ordering::SeqCst);
        assert_eq!(sched.process_tasks(), 0);
        clock.store(65, Ordering::SeqCst);
        assert_eq!(sched.process_tasks(), 1);
    }

    #[test]
    fn fire_order_is_due_then_id() {
        let (sched, clock) = virtual_clock();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2, o3) = (order.clone(), order.clone(), order.clone());
        let a = sched.add(move || o1.lock().push('a'), 30).unwrap();
        let b = sched.add(move || o2.lock().push('b'), 20).unwrap();
        let c = sched.add(move || o3.lock().push('c'), 20).unwrap();
        assert!(a < b && b < c);

        clock.store(30, Ordering::SeqCst);
        assert_eq!(sched.process_tasks(), 3);
        // b and c share a deadline (20) and precede a (30); id breaks the tie.
        assert_eq!(*order.lock(), vec!['b', 'c', 'a']);
    }

    #[test]
    fn task_can_remove_itself() {
        let (sched, clock) = virtual_clock();
        let drops = Arc::new(AtomicU32::new(0));
        let d = drops.clone();
        let sched2 = sched.clone();
        let id = Arc::new(AtomicU32::new(0));
        let id2 = id.clone();
        let got = sched
            .add_with_drop(
                move || {
                    let _ = sched2.remove(id2.load(Ordering::SeqCst));
                },
                move || _ = d.fetch_add(1, Ordering::SeqCst),
                5,
            )
            .unwrap();
        id.store(got, Ordering::SeqCst);

        clock.store(5, Ordering::SeqCst);
        assert_eq!(sched.process_tasks(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(sched.is_empty());
        // Removing again reports the id as unknown
        assert!(matches!(sched.remove(got), Err(ZError::UnknownTask(_))));
    }

    #[test]
    fn task_can_remove_peer_before_it_fires() {
        let (sched, clock) = virtual_clock();
        let peer_fired = Arc::new(AtomicU32::new(0));
        let peer_dropped = Arc::new(AtomicU32::new(0));
        let pf = peer_fired.clone();
        let pd = peer_dropped.clone();

        // Peer is registered first so it has the smaller id but the later
        // deadline; the killer fires first and removes it.
        let peer = sched
            .add_with_drop(
                move || _ = pf.fetch_add(1, Ordering::SeqCst),
                move || _ = pd.fetch_add(1, Ordering::SeqCst),
                20,
            )
            .unwrap();
        let sched2 = sched.clone();
        sched
            .add(
                move || {
                    let _ = sched2.remove(peer);
                },
                10,
            )
            .unwrap();

        clock.store(20, Ordering::SeqCst);
        sched.process_tasks();
        assert_eq!(peer_fired.load(Ordering::SeqCst), 0);
        assert_eq!(peer_dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn time_regression_is_safe() {
        let (sched, clock) = virtual_clock();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        sched
            .add(move || _ = c.fetch_add(1, Ordering::SeqCst), 10)
            .unwrap();
        clock.store(10, Ordering::SeqCst);
        assert_eq!(sched.process_tasks(), 1);
        clock.store(3, Ordering::SeqCst);
        assert_eq!(sched.process_tasks(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_drops_everything_once() {
        let (sched, _clock) = virtual_clock();
        let drops = Arc::new(AtomicU32::new(0));
        for _ in 0..4 {
            let d = drops.clone();
            sched
                .add_with_drop(|| {}, move || _ = d.fetch_add(1, Ordering::SeqCst), 7)
                .unwrap();
        }
        sched.clear();
        assert_eq!(drops.load(Ordering::SeqCst), 4);
        assert!(sched.is_empty());
    }

    #[test]
    fn table_capacity_enforced() {
        let (sched, _clock) = virtual_clock();
        for _ in 0..PERIODIC_SCHEDULER_MAX_TASKS {
            sched.add(|| {}, 1).unwrap();
        }
        assert!(matches!(sched.add(|| {}, 1), Err(ZError::SchedulerFull)));
    }

    #[test]
    fn ids_skip_zero_and_stay_unique() {
        let (sched, _clock) = virtual_clock();
        let a = sched.add(|| {}, 1).unwrap();
        let b = sched.add(|| {}, 1).unwrap();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }
}
