//! Bounded worker pool with a delay-ordered set of scheduled tasks.
//!
//! The pool keeps idle workers on a LIFO stack for cache affinity and lets
//! them exit after an idle timeout. Scheduled tasks live in an ordered map
//! keyed by `(deadline, sequence)`, so cancellation removes the entry in
//! O(log n) immediately instead of tombstoning it until it reaches the head.
//! A single task-runner worker sleeps on the head deadline; when it pops a
//! due task it arranges a replacement runner first, then runs the task body
//! outside the set's monitor.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{error, warn};

use crate::errors::Rejected;

const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

static LIMIT_THREAD_DUMP: OnceLock<bool> = OnceLock::new();
static LIMIT_EXIT: OnceLock<bool> = OnceLock::new();

fn limit_thread_dump() -> bool {
    *LIMIT_THREAD_DUMP.get_or_init(|| {
        std::env::var("TETHER_POOL_LIMIT_THREAD_DUMP")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    })
}

fn limit_exit() -> bool {
    *LIMIT_EXIT.get_or_init(|| {
        std::env::var("TETHER_POOL_LIMIT_EXIT")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    })
}

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;
type PanicHandler = Arc<dyn Fn(Box<dyn std::any::Any + Send>) + Send + Sync>;

/// Worker pool plus scheduling services. Cloning shares the pool.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    max_threads: usize,
    pool: Mutex<PoolState>,
    pool_cv: Condvar,
    tasks: Mutex<TaskSet>,
    tasks_cv: Condvar,
    task_seq: AtomicU64,
    thread_seq: AtomicU64,
    panic_handler: PanicHandler,
}

struct PoolState {
    idle: Vec<Arc<Worker>>,
    active: usize,
    shutdown: bool,
}

struct TaskSet {
    entries: BTreeMap<TaskKey, Arc<ScheduledTask>>,
    runner_ready: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TaskKey {
    at: Instant,
    seq: u64,
}

struct Worker {
    slot: Mutex<Slot>,
    cv: Condvar,
}

enum Slot {
    Empty,
    Job(Job),
    /// Shutdown sentinel: the worker exits instead of waiting for work.
    Exit,
    /// The worker gave up waiting and is on its way out; handing it a job
    /// is no longer possible.
    Exiting,
}

enum Wait {
    Job(Job),
    Exit,
    TimedOut,
}

impl Worker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot::Empty),
            cv: Condvar::new(),
        })
    }

    /// Hand a job to an idle worker. Fails by returning the job when the
    /// worker is already exiting.
    fn set_job(&self, job: Job) -> Result<(), Job> {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Empty => {
                *slot = Slot::Job(job);
                self.cv.notify_one();
                Ok(())
            }
            Slot::Exiting | Slot::Exit => Err(job),
            Slot::Job(_) => unreachable!("idle worker already holds a job"),
        }
    }

    fn set_exit(&self) {
        let mut slot = self.slot.lock();
        if matches!(&*slot, Slot::Empty) {
            *slot = Slot::Exit;
        }
        self.cv.notify_one();
    }

    fn wait_for_job(&self, idle_timeout: Duration) -> Wait {
        let deadline = Instant::now() + idle_timeout;
        let mut slot = self.slot.lock();
        loop {
            match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Job(job) => return Wait::Job(job),
                Slot::Exit => return Wait::Exit,
                Slot::Exiting => unreachable!("only the waiting worker marks itself exiting"),
                Slot::Empty => {}
            }
            let now = Instant::now();
            if now >= deadline {
                *slot = Slot::Exiting;
                return Wait::TimedOut;
            }
            self.cv.wait_for(&mut slot, deadline - now);
        }
    }
}

impl Scheduler {
    /// Create a pool allowing at most `max_threads` concurrent workers.
    pub fn new(name: impl Into<String>, max_threads: usize) -> Self {
        assert!(max_threads > 0, "maximum thread count must be positive");
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                max_threads,
                pool: Mutex::new(PoolState {
                    idle: Vec::new(),
                    active: 0,
                    shutdown: false,
                }),
                pool_cv: Condvar::new(),
                tasks: Mutex::new(TaskSet {
                    entries: BTreeMap::new(),
                    runner_ready: false,
                }),
                tasks_cv: Condvar::new(),
                task_seq: AtomicU64::new(1),
                thread_seq: AtomicU64::new(1),
                panic_handler: Arc::new(|payload| {
                    error!(panic = %panic_message(&payload), "worker task panicked");
                }),
            }),
        }
    }

    /// Replace the handler invoked when a job panics.
    pub fn with_panic_handler(
        mut self,
        handler: impl Fn(Box<dyn std::any::Any + Send>) + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("panic handler must be installed before the scheduler is shared");
        inner.panic_handler = Arc::new(handler);
        self
    }

    /// Enqueue a job for immediate execution.
    pub fn execute(&self, f: impl FnOnce() + Send + 'static) -> Result<(), Rejected> {
        self.inner
            .execute_inner(Box::new(f), false)
            .map_err(|(_job, rejected)| rejected)
    }

    /// Enqueue a job, or run it on the calling thread when the pool refuses
    /// it. For work that must happen even under saturation.
    pub(crate) fn execute_or_run(&self, job: Job) {
        if let Err((job, rejected)) = self.inner.execute_inner(job, false) {
            tracing::debug!(%rejected, "pool refused job; running inline");
            job();
        }
    }

    /// Run a job once, on or after `now + delay`.
    pub fn schedule(
        &self,
        delay: Duration,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<ScheduledHandle, Rejected> {
        let mut f = Some(f);
        self.schedule_task(delay, Period::OneShot, move || {
            if let Some(f) = f.take() {
                f();
            }
        })
    }

    /// Run a job repeatedly at a fixed rate: each deadline is the previous
    /// deadline plus the period.
    pub fn schedule_at_fixed_rate(
        &self,
        initial_delay: Duration,
        period: Duration,
        f: impl FnMut() + Send + 'static,
    ) -> Result<ScheduledHandle, Rejected> {
        assert!(period > Duration::ZERO, "fixed-rate period must be positive");
        self.schedule_task(initial_delay, Period::FixedRate(period), f)
    }

    /// Run a job repeatedly with a fixed delay measured from each
    /// completion.
    pub fn schedule_with_fixed_delay(
        &self,
        initial_delay: Duration,
        delay: Duration,
        f: impl FnMut() + Send + 'static,
    ) -> Result<ScheduledHandle, Rejected> {
        assert!(delay > Duration::ZERO, "fixed delay must be positive");
        self.schedule_task(initial_delay, Period::FixedDelay(delay), f)
    }

    /// Run a job repeatedly with a period drawn uniformly from
    /// `[low, high]` at every firing, for applying jitter.
    pub fn schedule_jittered(
        &self,
        initial_delay: Duration,
        low: Duration,
        high: Duration,
        f: impl FnMut() + Send + 'static,
    ) -> Result<ScheduledHandle, Rejected> {
        assert!(high > Duration::ZERO && low <= high, "invalid jitter range");
        self.schedule_task(initial_delay, Period::Jittered { low, high }, f)
    }

    fn schedule_task(
        &self,
        delay: Duration,
        period: Period,
        f: impl FnMut() + Send + 'static,
    ) -> Result<ScheduledHandle, Rejected> {
        let task = Arc::new(ScheduledTask {
            seq: self.inner.task_seq.fetch_add(1, Ordering::Relaxed),
            period,
            state: Mutex::new(TaskLifecycle {
                at: Instant::now() + delay,
                fired: false,
                cancelled: false,
                done: false,
            }),
            job: Mutex::new(Some(Box::new(f))),
        });
        self.inner.insert_task(task.clone())?;
        Ok(ScheduledHandle {
            task,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Refuse new work, signal idle workers to exit, and clear the delay
    /// set. Jobs already running are left to finish.
    pub fn shutdown(&self) {
        {
            let mut pool = self.inner.pool.lock();
            if pool.shutdown {
                return;
            }
            pool.shutdown = true;
            for worker in pool.idle.drain(..) {
                worker.set_exit();
            }
            self.inner.pool_cv.notify_all();
        }
        let mut tasks = self.inner.tasks.lock();
        for task in tasks.entries.values() {
            task.state.lock().cancelled = true;
        }
        tasks.entries.clear();
        tasks.runner_ready = false;
        self.inner.tasks_cv.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.pool.lock().shutdown
    }

    /// Wait until shutdown has been requested and all workers have exited.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pool = self.inner.pool.lock();
        loop {
            if pool.shutdown && pool.active == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.inner.pool_cv.wait_for(&mut pool, deadline - now);
        }
    }

    /// Number of entries currently in the delay set.
    pub fn scheduled_count(&self) -> usize {
        self.inner.tasks.lock().entries.len()
    }
}

impl Inner {
    fn execute_inner(self: &Arc<Self>, mut job: Job, force: bool) -> Result<(), (Job, Rejected)> {
        loop {
            let worker = {
                let mut pool = self.pool.lock();
                if pool.shutdown && !force {
                    return Err((job, Rejected { shutdown: true }));
                }
                match pool.idle.pop() {
                    Some(worker) => worker,
                    None => {
                        if pool.active >= self.max_threads {
                            drop(pool);
                            self.limit_reached();
                            return Err((job, Rejected { shutdown: false }));
                        }
                        pool.active += 1;
                        drop(pool);
                        return self.spawn_worker(job);
                    }
                }
            };

            match worker.set_job(job) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    // The worker timed out concurrently and is exiting. Give
                    // it a moment to release its active slot, then retry.
                    job = returned;
                    let mut pool = self.pool.lock();
                    if pool.idle.is_empty() && pool.active >= self.max_threads {
                        self.pool_cv.wait_for(&mut pool, Duration::from_millis(50));
                    }
                }
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>, job: Job) -> Result<(), (Job, Rejected)> {
        let worker = Worker::new();
        // Preload the job in the worker's own slot so a failed spawn can
        // hand it back.
        *worker.slot.lock() = Slot::Job(job);

        let inner = self.clone();
        let me = worker.clone();
        let n = self.thread_seq.fetch_add(1, Ordering::Relaxed);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-worker-{}", self.name, n))
            .spawn(move || worker_main(inner, me));

        match spawned {
            Ok(_) => Ok(()),
            Err(e) => {
                let mut pool = self.pool.lock();
                pool.active -= 1;
                self.pool_cv.notify_all();
                drop(pool);
                error!(error = %e, "failed to spawn worker thread");
                let job = match std::mem::replace(&mut *worker.slot.lock(), Slot::Empty) {
                    Slot::Job(job) => job,
                    _ => Box::new(|| {}),
                };
                Err((job, Rejected { shutdown: false }))
            }
        }
    }

    fn limit_reached(&self) {
        warn!(max = self.max_threads, "too many active threads");
        if limit_thread_dump() {
            // Stack dumps are not portable; record what the runtime can see.
            error!(
                max = self.max_threads,
                pool = %self.name,
                "thread limit reached; active workers are saturated"
            );
        }
        if limit_exit() {
            error!("thread limit reached and hard-exit flag is set");
            std::process::exit(1);
        }
    }

    fn run_job(&self, job: Job) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            (self.panic_handler)(payload);
        }
    }

    fn exit_worker(&self, me: &Arc<Worker>) {
        let mut pool = self.pool.lock();
        pool.idle.retain(|w| !Arc::ptr_eq(w, me));
        pool.active -= 1;
        self.pool_cv.notify_all();
    }

    // ------------------------------------------------------------------
    // Scheduled task machinery
    // ------------------------------------------------------------------

    fn insert_task(self: &Arc<Self>, task: Arc<ScheduledTask>) -> Result<(), Rejected> {
        if self.pool.lock().shutdown {
            return Err(Rejected { shutdown: true });
        }
        let mut tasks = self.tasks.lock();
        let key = TaskKey {
            at: task.state.lock().at,
            seq: task.seq,
        };
        let is_new_head = tasks
            .entries
            .keys()
            .next()
            .map_or(true, |head| key < *head);
        tasks.entries.insert(key, task);

        if is_new_head {
            if tasks.runner_ready {
                self.tasks_cv.notify_one();
            } else {
                tasks.runner_ready = true;
                drop(tasks);
                let inner = self.clone();
                if self
                    .execute_inner(Box::new(move || inner.run_next_scheduled()), true)
                    .is_err()
                {
                    // Saturated; a worker picks up runner duty when it frees.
                    self.tasks.lock().runner_ready = false;
                }
            }
        }
        Ok(())
    }

    /// After finishing a job, a worker volunteers as the task runner when
    /// none is active but tasks are pending.
    fn claim_runner_duty(&self) -> bool {
        let mut tasks = self.tasks.lock();
        if !tasks.runner_ready && !tasks.entries.is_empty() {
            tasks.runner_ready = true;
            true
        } else {
            false
        }
    }

    fn run_next_scheduled(self: &Arc<Self>) {
        let (task, replaced) = {
            let mut tasks = self.tasks.lock();
            loop {
                let Some((&key, _)) = tasks.entries.iter().next() else {
                    tasks.runner_ready = false;
                    return;
                };
                let now = Instant::now();
                if key.at <= now {
                    let task = tasks.entries.remove(&key).expect("head entry exists");
                    let inner = self.clone();
                    let replaced = self
                        .execute_inner(Box::new(move || inner.run_next_scheduled()), true)
                        .is_ok();
                    if !replaced {
                        tasks.runner_ready = false;
                    }
                    break (task, replaced);
                }
                self.tasks_cv.wait_for(&mut tasks, key.at - now);
            }
        };

        self.run_scheduled_body(&task);

        if replaced {
            // Run any further due tasks on this thread to avoid context
            // switches while the replacement runner sleeps on the head.
            loop {
                let task = {
                    let mut tasks = self.tasks.lock();
                    let Some((&key, _)) = tasks.entries.iter().next() else {
                        break;
                    };
                    if key.at > Instant::now() {
                        break;
                    }
                    tasks.entries.remove(&key).expect("head entry exists")
                };
                self.run_scheduled_body(&task);
            }
        }
    }

    fn run_scheduled_body(self: &Arc<Self>, task: &Arc<ScheduledTask>) {
        {
            let mut state = task.state.lock();
            if state.cancelled {
                return;
            }
            state.fired = true;
        }

        {
            let mut job = task.job.lock();
            if let Some(f) = job.as_mut() {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f())) {
                    (self.panic_handler)(payload);
                }
            }
        }

        let next_at = {
            let mut state = task.state.lock();
            if state.cancelled {
                *task.job.lock() = None;
                return;
            }
            match task.period {
                Period::OneShot => {
                    state.done = true;
                    None
                }
                Period::FixedRate(period) => {
                    state.at += period;
                    Some(state.at)
                }
                Period::FixedDelay(delay) => {
                    state.at = Instant::now() + delay;
                    Some(state.at)
                }
                Period::Jittered { low, high } => {
                    let range = high - low;
                    let extra = if range.is_zero() {
                        Duration::ZERO
                    } else {
                        Duration::from_nanos(
                            rand::thread_rng().gen_range(0..=range.as_nanos() as u64),
                        )
                    };
                    state.at += low + extra;
                    Some(state.at)
                }
            }
        };

        match next_at {
            None => *task.job.lock() = None,
            Some(_) => {
                if self.insert_task(task.clone()).is_err() {
                    // Shut down while rescheduling.
                    task.state.lock().done = true;
                    *task.job.lock() = None;
                }
            }
        }
    }
}

fn worker_main(inner: Arc<Inner>, me: Arc<Worker>) {
    let mut job = match std::mem::replace(&mut *me.slot.lock(), Slot::Empty) {
        Slot::Job(job) => Some(job),
        _ => None,
    };
    loop {
        if let Some(j) = job.take() {
            inner.run_job(j);
        }

        while inner.claim_runner_duty() {
            inner.run_next_scheduled();
        }

        {
            let mut pool = inner.pool.lock();
            if pool.shutdown {
                pool.active -= 1;
                inner.pool_cv.notify_all();
                return;
            }
            pool.idle.push(me.clone());
        }

        match me.wait_for_job(IDLE_TIMEOUT) {
            Wait::Job(j) => job = Some(j),
            Wait::Exit => {
                inner.exit_worker(&me);
                return;
            }
            Wait::TimedOut => {
                inner.exit_worker(&me);
                return;
            }
        }
    }
}

enum Period {
    OneShot,
    FixedRate(Duration),
    FixedDelay(Duration),
    Jittered { low: Duration, high: Duration },
}

struct TaskLifecycle {
    at: Instant,
    fired: bool,
    cancelled: bool,
    done: bool,
}

struct ScheduledTask {
    seq: u64,
    period: Period,
    state: Mutex<TaskLifecycle>,
    job: Mutex<Option<Box<dyn FnMut() + Send>>>,
}

/// Handle to a scheduled task.
pub struct ScheduledHandle {
    task: Arc<ScheduledTask>,
    inner: Weak<Inner>,
}

impl ScheduledHandle {
    /// Cancel the task, removing it from the delay set immediately.
    /// Returns true when the task never fired and now never will.
    ///
    /// Deliberately does not touch the job slot: a task body may cancel its
    /// own handle, and the runner releases the slot itself once a cancelled
    /// task is observed.
    pub fn cancel(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut tasks = inner.tasks.lock();
        let mut state = self.task.state.lock();
        if !state.cancelled && !state.done {
            let key = TaskKey {
                at: state.at,
                seq: self.task.seq,
            };
            tasks.entries.remove(&key);
            state.cancelled = true;
        }
        !state.fired
    }

    /// True once the task body has started running at least once.
    pub fn has_fired(&self) -> bool {
        self.task.state.lock().fired
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn execute_runs_job() {
        let scheduler = Scheduler::new("test", 4);
        let (tx, rx) = mpsc::channel();
        scheduler.execute(move || tx.send(42).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
        scheduler.shutdown();
    }

    #[test]
    fn saturated_pool_rejects() {
        let scheduler = Scheduler::new("test", 1);
        let (block_tx, block_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        scheduler
            .execute(move || {
                started_tx.send(()).unwrap();
                let _ = block_rx.recv();
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let err = scheduler.execute(|| {}).unwrap_err();
        assert!(!err.shutdown);

        block_tx.send(()).unwrap();
        scheduler.shutdown();
    }

    #[test]
    fn shutdown_rejects_and_terminates() {
        let scheduler = Scheduler::new("test", 2);
        scheduler.execute(|| {}).unwrap();
        scheduler.shutdown();
        let err = scheduler.execute(|| {}).unwrap_err();
        assert!(err.shutdown);
        assert!(scheduler.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn schedule_runs_on_or_after_deadline() {
        let scheduler = Scheduler::new("test", 4);
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        scheduler
            .schedule(Duration::from_millis(50), move || {
                tx.send(Instant::now()).unwrap();
            })
            .unwrap();
        let fired_at = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fired_at.duration_since(start) >= Duration::from_millis(50));
        scheduler.shutdown();
    }

    #[test]
    fn cancelled_task_never_fires_and_leaves_no_trace() {
        let scheduler = Scheduler::new("test", 4);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let handle = scheduler
            .schedule(Duration::from_millis(80), move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(handle.cancel());
        assert_eq!(scheduler.scheduled_count(), 0);
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!handle.has_fired());
        scheduler.shutdown();
    }

    #[test]
    fn fixed_rate_task_repeats_until_cancelled() {
        let scheduler = Scheduler::new("test", 4);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let handle = scheduler
            .schedule_at_fixed_rate(Duration::from_millis(5), Duration::from_millis(20), move || {
                count2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(300));
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected at least 3 firings, saw {seen}");
        assert!(handle.has_fired());
        assert!(!handle.cancel());

        let after_cancel = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
        scheduler.shutdown();
    }

    #[test]
    fn jittered_task_repeats() {
        let scheduler = Scheduler::new("test", 4);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        scheduler
            .schedule_jittered(
                Duration::from_millis(1),
                Duration::from_millis(5),
                Duration::from_millis(25),
                move || {
                    count2.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(300));
        assert!(count.load(Ordering::SeqCst) >= 2);
        scheduler.shutdown();
    }

    #[test]
    fn panicking_job_does_not_kill_the_pool() {
        let scheduler = Scheduler::new("test", 2).with_panic_handler(|_| {});
        scheduler.execute(|| panic!("boom")).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let (tx, rx) = mpsc::channel();
        scheduler.execute(move || tx.send(1).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        scheduler.shutdown();
    }
}
