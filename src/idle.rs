//! Per-connection idle-state detection on top of the shared `TimingWheel`.
//! Distinct from any per-event-loop delayed queue: every connection in the
//! process schedules its idle timers on the same wheel.

// ACCEPTABLE: Mutex poisoning .expect() is allowed in this module (unrecoverable state)
#![allow(clippy::expect_used)]

use crate::clock::Clock;
use crate::error::RegistryResult;
use crate::timing_wheel::{Timeout, TimingWheel};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Which idle event fired.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IdleKind {
    FirstReaderIdle,
    ReaderIdle,
    FirstWriterIdle,
    WriterIdle,
    FirstAllIdle,
    AllIdle,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Variant {
    Reader,
    Writer,
    All,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lifecycle {
    None,
    Initialized,
    Destroyed,
}

/// `(reader_idle, writer_idle, all_idle)` in milliseconds; `None` disables
/// that variant, matching the spec's "0 disables" convention.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdleConfig {
    pub reader_idle: Option<Duration>,
    pub writer_idle: Option<Duration>,
    pub all_idle: Option<Duration>,
}

impl IdleConfig {
    pub fn reader_only(reader_idle: Duration) -> Self {
        Self { reader_idle: Some(reader_idle), writer_idle: None, all_idle: None }
    }
}

struct State {
    last_read_ms: AtomicI64,
    last_write_ms: AtomicI64,
    reader_first: AtomicBool,
    writer_first: AtomicBool,
    all_first: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    timeouts: Mutex<Vec<Timeout>>,
}

/// Attached to each connection; fires `on_idle` when the configured reader,
/// writer, or combined idle deadline elapses without the matching activity.
pub struct IdleStateChecker {
    state: Arc<State>,
    wheel: Arc<TimingWheel>,
    clock: Clock,
    config: IdleConfig,
    on_idle: Arc<dyn Fn(IdleKind) -> RegistryResult<()> + Send + Sync>,
    closed: Arc<AtomicBool>,
}

impl IdleStateChecker {
    pub fn new(
        wheel: Arc<TimingWheel>,
        clock: Clock,
        config: IdleConfig,
        closed: Arc<AtomicBool>,
        on_idle: impl Fn(IdleKind) -> RegistryResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: Arc::new(State {
                last_read_ms: AtomicI64::new(clock.now_ms()),
                last_write_ms: AtomicI64::new(clock.now_ms()),
                reader_first: AtomicBool::new(true),
                writer_first: AtomicBool::new(true),
                all_first: AtomicBool::new(true),
                lifecycle: Mutex::new(Lifecycle::None),
                timeouts: Mutex::new(Vec::new()),
            }),
            wheel,
            clock,
            config,
            on_idle: Arc::new(on_idle),
            closed,
        }
    }

    /// Initialize exactly once per connection. Safe to call from
    /// handler-attach, registration, or the first active event — later
    /// calls are no-ops.
    pub fn initialize(&self) {
        let mut lifecycle = self.state.lifecycle.lock().expect("idle state mutex poisoned");
        if *lifecycle != Lifecycle::None || self.closed.load(Ordering::Acquire) {
            return;
        }
        *lifecycle = Lifecycle::Initialized;
        drop(lifecycle);

        let mut timeouts = self.state.timeouts.lock().expect("idle state mutex poisoned");
        if let Some(limit) = self.config.reader_idle {
            timeouts.push(self.schedule(Variant::Reader, limit));
        }
        if let Some(limit) = self.config.writer_idle {
            timeouts.push(self.schedule(Variant::Writer, limit));
        }
        if let Some(limit) = self.config.all_idle {
            timeouts.push(self.schedule(Variant::All, limit));
        }
    }

    /// Idempotent: cancels all outstanding timeouts and marks the checker
    /// destroyed so any in-flight fire is a no-op.
    pub fn destroy(&self) {
        let mut lifecycle = self.state.lifecycle.lock().expect("idle state mutex poisoned");
        if *lifecycle == Lifecycle::Destroyed {
            return;
        }
        *lifecycle = Lifecycle::Destroyed;
        for timeout in self.state.timeouts.lock().expect("idle state mutex poisoned").drain(..) {
            timeout.cancel();
        }
    }

    /// Record a successful inbound read.
    pub fn on_read(&self) {
        self.state.last_read_ms.store(self.clock.now_ms(), Ordering::Release);
        self.state.reader_first.store(true, Ordering::Release);
        self.state.all_first.store(true, Ordering::Release);
    }

    /// Record a completed outbound write (not merely issuance).
    pub fn on_write_complete(&self) {
        self.state.last_write_ms.store(self.clock.now_ms(), Ordering::Release);
        self.state.writer_first.store(true, Ordering::Release);
        self.state.all_first.store(true, Ordering::Release);
    }

    fn schedule(&self, variant: Variant, limit: Duration) -> Timeout {
        let state = self.state.clone();
        let wheel = self.wheel.clone();
        let clock = self.clock.clone();
        let on_idle = self.on_idle.clone();
        let closed = self.closed.clone();
        self.wheel.new_timeout(limit, move || {
            fire(variant, limit, state, wheel, clock, on_idle, closed);
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn fire(
    variant: Variant,
    limit: Duration,
    state: Arc<State>,
    wheel: Arc<TimingWheel>,
    clock: Clock,
    on_idle: Arc<dyn Fn(IdleKind) -> RegistryResult<()> + Send + Sync>,
    closed: Arc<AtomicBool>,
) {
    if closed.load(Ordering::Acquire) {
        return;
    }
    {
        let lifecycle = state.lifecycle.lock().expect("idle state mutex poisoned");
        if *lifecycle == Lifecycle::Destroyed {
            return;
        }
    }

    let now = clock.now_ms();
    let last_activity = match variant {
        Variant::Reader => state.last_read_ms.load(Ordering::Acquire),
        Variant::Writer => state.last_write_ms.load(Ordering::Acquire),
        Variant::All => state.last_read_ms.load(Ordering::Acquire).max(state.last_write_ms.load(Ordering::Acquire)),
    };
    let limit_ms = limit.as_millis() as i64;
    let next_delay_ms = limit_ms - (now - last_activity);

    let reschedule_delay = if next_delay_ms > 0 { Duration::from_millis(next_delay_ms as u64) } else { limit };

    let state2 = state.clone();
    let wheel2 = wheel.clone();
    let clock2 = clock.clone();
    let on_idle2 = on_idle.clone();
    let closed2 = closed.clone();
    let new_timeout = wheel.new_timeout(reschedule_delay, move || {
        fire(variant, limit, state2, wheel2, clock2, on_idle2, closed2);
    });
    state.timeouts.lock().expect("idle state mutex poisoned").push(new_timeout);

    if next_delay_ms > 0 {
        return;
    }

    let first_flag = match variant {
        Variant::Reader => &state.reader_first,
        Variant::Writer => &state.writer_first,
        Variant::All => &state.all_first,
    };
    let is_first = first_flag.swap(false, Ordering::AcqRel);
    let kind = match (variant, is_first) {
        (Variant::Reader, true) => IdleKind::FirstReaderIdle,
        (Variant::Reader, false) => IdleKind::ReaderIdle,
        (Variant::Writer, true) => IdleKind::FirstWriterIdle,
        (Variant::Writer, false) => IdleKind::WriterIdle,
        (Variant::All, true) => IdleKind::FirstAllIdle,
        (Variant::All, false) => IdleKind::AllIdle,
    };

    if let Err(err) = on_idle(kind) {
        tracing::error!(error = %err, "idle event handler failed; timer continues");
    }
}
