//! Hashed timing wheel: O(1) insertion scheduler shared by every connection's
//! idle-state checker. A single driver task advances a ring of buckets; each
//! bucket holds entries due this revolution plus a rounds-remaining counter
//! for entries scheduled further out than one revolution.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Tasks scheduled with a delay shorter than this are clamped up to it.
pub const MIN_TIMEOUT_MS: u64 = 1;

const DEFAULT_TICK_MS: u64 = 100;
const DEFAULT_WHEEL_SIZE: usize = 512;

type Task = Box<dyn FnOnce() + Send>;

struct WheelEntry {
    task: Mutex<Option<Task>>,
    cancelled: AtomicBool,
}

struct BucketItem {
    entry: Arc<WheelEntry>,
    rounds: usize,
}

struct Inner {
    buckets: Vec<Mutex<VecDeque<BucketItem>>>,
    cursor: AtomicUsize,
    tick_ms: u64,
}

/// A single shared wheel servicing all connections of a process.
pub struct TimingWheel {
    inner: Arc<Inner>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TimingWheel {
    pub fn new() -> Arc<Self> {
        Self::with_params(DEFAULT_TICK_MS, DEFAULT_WHEEL_SIZE)
    }

    pub fn with_params(tick_ms: u64, wheel_size: usize) -> Arc<Self> {
        Self::with_tick_listener(tick_ms, wheel_size, || {})
    }

    /// Like `with_params`, but `on_tick` runs once after every tick of the
    /// driver loop. Used to let a caller observe that the wheel is actually
    /// advancing (e.g. a health check heartbeat) rather than inferring
    /// liveness from unrelated events.
    pub fn with_tick_listener(tick_ms: u64, wheel_size: usize, on_tick: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        let buckets = (0..wheel_size).map(|_| Mutex::new(VecDeque::new())).collect();
        let inner = Arc::new(Inner { buckets, cursor: AtomicUsize::new(0), tick_ms });
        let wheel = Arc::new(Self { inner: inner.clone(), driver: Mutex::new(None) });
        let driver_inner = inner;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(driver_inner.tick_ms));
            loop {
                interval.tick().await;
                tick(&driver_inner);
                on_tick();
            }
        });
        *wheel.driver.lock() = Some(handle);
        wheel
    }

    /// Schedule `task` to fire no earlier than `delay` from now. Delays
    /// shorter than `MIN_TIMEOUT_MS` are clamped up to it.
    pub fn new_timeout(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> Timeout {
        let delay_ms = (delay.as_millis() as u64).max(MIN_TIMEOUT_MS);
        let wheel_len = self.inner.buckets.len();
        let ticks = ((delay_ms + self.inner.tick_ms - 1) / self.inner.tick_ms).max(1) as usize;
        let rounds = ticks / wheel_len;
        let cursor = self.inner.cursor.load(Ordering::Acquire);
        let bucket_idx = (cursor + ticks) % wheel_len;

        let entry = Arc::new(WheelEntry { task: Mutex::new(Some(Box::new(task))), cancelled: AtomicBool::new(false) });
        self.inner.buckets[bucket_idx].lock().push_back(BucketItem { entry: entry.clone(), rounds });
        Timeout { entry }
    }
}

impl Drop for TimingWheel {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }
}

fn tick(inner: &Inner) {
    let idx = inner.cursor.fetch_add(1, Ordering::AcqRel) % inner.buckets.len();
    let mut due = Vec::new();
    {
        let mut bucket = inner.buckets[idx].lock();
        let mut remaining = VecDeque::with_capacity(bucket.len());
        while let Some(item) = bucket.pop_front() {
            if item.entry.cancelled.load(Ordering::Acquire) {
                continue;
            }
            if item.rounds == 0 {
                due.push(item.entry);
            } else {
                remaining.push_back(BucketItem { entry: item.entry, rounds: item.rounds - 1 });
            }
        }
        *bucket = remaining;
    }
    for entry in due {
        if let Some(task) = entry.task.lock().take() {
            task();
        }
    }
}

/// Handle to a scheduled task. `cancel()` prevents firing if the task has
/// not yet run; cancellation is race-safe against a concurrent fire.
#[derive(Clone)]
pub struct Timeout {
    entry: Arc<WheelEntry>,
}

impl Timeout {
    pub fn cancel(&self) {
        self.entry.cancelled.store(true, Ordering::Release);
        self.entry.task.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.entry.cancelled.load(Ordering::Acquire)
    }
}
