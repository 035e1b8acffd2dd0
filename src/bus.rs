//! Event bus: bounded producer queue plus a single dispatch thread.
//!
//! Producers call [`EventBus::emit`] from any thread. The call validates the
//! payload, enqueues with a non-blocking `try_send` and returns. One dispatch
//! thread drains the queue and invokes the subscribers of each event strictly
//! sequentially, in registration order.
//!
//! Shutdown favours latency over delivery: [`EventBus::stop`] lets the callback
//! currently running finish, then discards whatever is still queued. A callback
//! that never returns stalls the dispatch thread and therefore `stop()`;
//! cancellation is cooperative only.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::error::{HookError, HookResult};
use crate::event::{Envelope, EventKind, Payload};
use crate::registry::{CallbackRegistry, HandlerResult, SubscriberHandle};

/// How queued events get dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// A dedicated background thread dispatches as events arrive.
    #[default]
    Threaded,
    /// Nothing runs in the background; the owner calls [`EventBus::pump`].
    Manual,
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Max queued events before `emit` starts failing with `QueueFull`.
    pub queue_capacity: usize,
    /// Background thread or explicit pumping.
    pub mode: DispatchMode,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            mode: DispatchMode::Threaded,
        }
    }
}

/// Point-in-time bus counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusStats {
    /// Events accepted by `emit`.
    pub emitted: u64,
    /// Events handed to their subscribers.
    pub dispatched: u64,
    /// Events refused because the queue was full.
    pub dropped_full: u64,
    /// Events still queued when the bus stopped.
    pub discarded_on_stop: u64,
    /// Subscriber invocations that returned an error or panicked.
    pub handler_failures: u64,
    /// Events waiting in the queue right now.
    pub queued: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Default)]
struct Counters {
    emitted: AtomicU64,
    dispatched: AtomicU64,
    dropped_full: AtomicU64,
    discarded_on_stop: AtomicU64,
    handler_failures: AtomicU64,
}

#[derive(Debug)]
struct Shared {
    registry: RwLock<CallbackRegistry>,
    rx: Receiver<Envelope>,
    stopping: AtomicBool,
    counters: Counters,
}

impl Shared {
    fn dispatch(&self, envelope: &Envelope) {
        // Snapshot so callbacks may (un)subscribe without deadlocking on the registry.
        let handlers = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers(envelope.kind);

        for handler in &handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.invoke(envelope)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        subscription = %handler.id(),
                        kind = ?envelope.kind,
                        sequence = envelope.sequence,
                        error = %err,
                        "subscriber failed"
                    );
                }
                Err(panic) => {
                    self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        subscription = %handler.id(),
                        kind = ?envelope.kind,
                        sequence = envelope.sequence,
                        panic = panic_message(panic.as_ref()),
                        "subscriber panicked"
                    );
                }
            }
        }

        self.counters.dispatched.fetch_add(1, Ordering::Release);
    }

    fn discard_queued(&self) -> u64 {
        let mut discarded = 0u64;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            self.counters.discarded_on_stop.fetch_add(discarded, Ordering::Release);
        }
        discarded
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Typed event bus with a single dispatch thread.
///
/// Construct one explicitly and share it by reference (or `Arc`); there is no
/// global instance.
#[derive(Debug)]
pub struct EventBus {
    cfg: EventBusConfig,
    shared: Arc<Shared>,
    tx: Sender<Envelope>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    sequence: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Create an idle bus. Events emitted before [`start`](Self::start) wait in the queue.
    #[must_use]
    pub fn new(cfg: EventBusConfig) -> Self {
        let (tx, rx) = bounded::<Envelope>(cfg.queue_capacity.max(1));
        let (stop_tx, stop_rx) = bounded::<()>(1);

        Self {
            cfg,
            shared: Arc::new(Shared {
                registry: RwLock::new(CallbackRegistry::new()),
                rx,
                stopping: AtomicBool::new(false),
                counters: Counters::default(),
            }),
            tx,
            stop_tx,
            stop_rx,
            sequence: AtomicU64::new(0),
            lifecycle: Mutex::new(Lifecycle::Idle),
            join: Mutex::new(None),
        }
    }

    /// Bus in [`DispatchMode::Manual`], driven by [`pump`](Self::pump).
    #[must_use]
    pub fn manual() -> Self {
        Self::new(EventBusConfig {
            mode: DispatchMode::Manual,
            ..EventBusConfig::default()
        })
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn config(&self) -> &EventBusConfig {
        &self.cfg
    }

    /// Register `handler` for `kind`. Handlers of one kind run in registration order.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriberHandle
    where
        F: Fn(&Envelope) -> HandlerResult + Send + Sync + 'static,
    {
        let handle = SubscriberHandle::new(handler);
        self.subscribe_handle(kind, &handle);
        handle
    }

    /// Register an existing handle under (another) `kind`.
    pub fn subscribe_handle(&self, kind: EventKind, handle: &SubscriberHandle) {
        self.shared
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add(kind, handle.clone());
        tracing::debug!(subscription = %handle.id(), ?kind, "subscriber added");
    }

    /// Remove `handle` from every kind. Returns the number of registrations removed.
    pub fn unsubscribe(&self, handle: &SubscriberHandle) -> usize {
        let removed = self
            .shared
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_all(handle.id());
        if removed > 0 {
            tracing::debug!(subscription = %handle.id(), removed, "subscriber removed");
        }
        removed
    }

    /// Number of subscribers registered for `kind`.
    #[must_use]
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.shared
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len(kind)
    }

    /// Validate and enqueue one event. Never blocks.
    ///
    /// Returns the envelope sequence number on success.
    ///
    /// # Errors
    /// - `InvalidEventType` if `payload` does not fit `kind`; nothing is enqueued.
    /// - `BusStopped` after [`stop`](Self::stop).
    /// - `QueueFull` when the bounded queue is at capacity.
    pub fn emit(&self, kind: EventKind, payload: Payload) -> HookResult<u64> {
        if !payload.matches(kind) {
            return Err(HookError::InvalidEventType {
                kind,
                payload: payload.tag(),
            });
        }
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(HookError::BusStopped);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let envelope = Envelope {
            sequence,
            kind,
            payload,
            emitted_at: Utc::now(),
        };

        match self.tx.try_send(envelope) {
            Ok(()) => {
                self.shared.counters.emitted.fetch_add(1, Ordering::Release);
                // A concurrent stop() may have drained the queue before this
                // send landed; nobody else will take it off again.
                if self.shared.stopping.load(Ordering::Acquire) {
                    self.shared.discard_queued();
                }
                Ok(sequence)
            }
            Err(TrySendError::Full(_)) => {
                self.shared.counters.dropped_full.fetch_add(1, Ordering::Relaxed);
                Err(HookError::QueueFull {
                    capacity: self.cfg.queue_capacity.max(1),
                })
            }
            Err(TrySendError::Disconnected(_)) => Err(HookError::BusStopped),
        }
    }

    /// Begin dispatching. Idempotent.
    ///
    /// In [`DispatchMode::Threaded`] this spawns the dispatch thread; in
    /// [`DispatchMode::Manual`] it only marks the bus as running.
    ///
    /// # Errors
    /// `BusStopped` if the bus was already stopped; `Internal` if the thread
    /// cannot be spawned.
    pub fn start(&self) -> HookResult<()> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        match *lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Stopped => return Err(HookError::BusStopped),
            Lifecycle::Idle => {}
        }

        if self.cfg.mode == DispatchMode::Threaded {
            let shared = Arc::clone(&self.shared);
            let stop_rx = self.stop_rx.clone();
            let handle = thread::Builder::new()
                .name("hookbus-dispatch".to_string())
                .spawn(move || dispatch_loop(&shared, &stop_rx))
                .map_err(|e| HookError::internal(format!("failed to spawn dispatch thread: {e}")))?;
            *self.join.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }

        *lifecycle = Lifecycle::Running;
        tracing::debug!(mode = ?self.cfg.mode, "event bus started");
        Ok(())
    }

    /// Dispatch every event queued at the time of the call on the calling thread.
    ///
    /// Only meaningful in [`DispatchMode::Manual`]; with a dispatch thread it
    /// returns 0 without touching the queue.
    pub fn pump(&self) -> usize {
        if self.cfg.mode == DispatchMode::Threaded || self.shared.stopping.load(Ordering::Acquire) {
            return 0;
        }

        // Events emitted by callbacks during this pump wait for the next one.
        let pending = self.shared.rx.len();
        let mut processed = 0;
        for _ in 0..pending {
            let Ok(envelope) = self.shared.rx.try_recv() else {
                break;
            };
            self.shared.dispatch(&envelope);
            processed += 1;
        }
        processed
    }

    /// Stop dispatching and discard anything still queued. Idempotent, callable
    /// from any thread except a subscriber callback.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if *lifecycle == Lifecycle::Stopped {
            return;
        }
        *lifecycle = Lifecycle::Stopped;

        self.shared.stopping.store(true, Ordering::Release);
        let _ = self.stop_tx.try_send(());

        let handle = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("dispatch thread terminated abnormally");
            }
        }

        let discarded = self.shared.discard_queued();
        tracing::debug!(discarded, "event bus stopped");
    }

    /// True once [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    /// Wait until every accepted event was dispatched or discarded.
    ///
    /// Returns false if `timeout` elapsed first.
    #[must_use]
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let c = &self.shared.counters;
            let settled =
                c.dispatched.load(Ordering::Acquire) + c.discarded_on_stop.load(Ordering::Acquire);
            if settled >= c.emitted.load(Ordering::Acquire) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Snapshot of the bus counters.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        let c = &self.shared.counters;
        BusStats {
            emitted: c.emitted.load(Ordering::Acquire),
            dispatched: c.dispatched.load(Ordering::Acquire),
            dropped_full: c.dropped_full.load(Ordering::Relaxed),
            discarded_on_stop: c.discarded_on_stop.load(Ordering::Acquire),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            queued: self.shared.rx.len(),
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(shared: &Shared, stop_rx: &Receiver<()>) {
    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(shared.rx) -> msg => {
                let Ok(envelope) = msg else { break };
                if shared.stopping.load(Ordering::Acquire) {
                    shared.counters.discarded_on_stop.fetch_add(1, Ordering::Release);
                    break;
                }
                shared.dispatch(&envelope);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use crate::event::{Point2, Point3};

    fn ball(x: f32) -> Payload {
        Payload::ball_pair(Point2::new(x, 0.0), Point2::new(x, 1.0))
    }

    #[test]
    fn manual_pump_dispatches_in_order() {
        let bus = EventBus::manual();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(EventKind::BallPosition, move |env| {
            if let Payload::BallPair { left, .. } = env.payload {
                sink.lock().unwrap().push(left.x);
            }
            Ok(())
        });
        bus.start().unwrap();

        for i in 0..5 {
            bus.emit(EventKind::BallPosition, ball(i as f32)).unwrap();
        }
        assert_eq!(bus.pump(), 5);
        assert_eq!(*seen.lock().unwrap(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(bus.pump(), 0);
    }

    #[test]
    fn mismatched_payload_is_rejected_before_enqueue() {
        let bus = EventBus::manual();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        bus.subscribe(EventKind::HitPoint, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let err = bus.emit(EventKind::HitPoint, Payload::None).unwrap_err();
        assert!(matches!(
            err,
            HookError::InvalidEventType {
                kind: EventKind::HitPoint,
                ..
            }
        ));
        assert_eq!(bus.stats().emitted, 0);
        assert_eq!(bus.pump(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_and_panicking_subscribers_are_isolated() {
        let bus = EventBus::manual();
        let reached = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventKind::HitPoint, |_| Err("boom".into()));
        bus.subscribe(EventKind::HitPoint, |_| panic!("subscriber bug"));
        let r = Arc::clone(&reached);
        bus.subscribe(EventKind::HitPoint, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(EventKind::HitPoint, Payload::Point(Point3::default())).unwrap();
        bus.emit(EventKind::HitPoint, Payload::Point(Point3::default())).unwrap();
        assert_eq!(bus.pump(), 2);

        assert_eq!(reached.load(Ordering::SeqCst), 2);
        let stats = bus.stats();
        assert_eq!(stats.handler_failures, 4);
        assert_eq!(stats.dispatched, 2);
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let bus = EventBus::new(EventBusConfig {
            queue_capacity: 2,
            mode: DispatchMode::Manual,
        });
        bus.emit(EventKind::MatchStart, Payload::None).unwrap();
        bus.emit(EventKind::MatchEnd, Payload::None).unwrap();
        let err = bus.emit(EventKind::MatchEnd, Payload::None).unwrap_err();
        assert!(matches!(err, HookError::QueueFull { capacity: 2 }));
        assert!(err.is_retryable());
        assert_eq!(bus.stats().dropped_full, 1);
    }

    #[test]
    fn stop_discards_queued_events_and_is_idempotent() {
        let bus = EventBus::manual();
        bus.emit(EventKind::MatchStart, Payload::None).unwrap();
        bus.emit(EventKind::MatchEnd, Payload::None).unwrap();

        bus.stop();
        bus.stop();

        let stats = bus.stats();
        assert_eq!(stats.discarded_on_stop, 2);
        assert_eq!(stats.dispatched, 0);
        assert!(matches!(bus.emit(EventKind::MatchStart, Payload::None), Err(HookError::BusStopped)));
        assert!(matches!(bus.start(), Err(HookError::BusStopped)));
        assert!(bus.wait_idle(Duration::from_millis(10)));
    }

    #[test]
    fn emit_racing_stop_never_strands_an_event() {
        for _ in 0..20 {
            let bus = Arc::new(EventBus::new(EventBusConfig::default()));
            bus.subscribe(EventKind::MatchStart, |_| Ok(()));
            bus.start().unwrap();

            let producers: Vec<_> = (0..4)
                .map(|_| {
                    let bus = Arc::clone(&bus);
                    thread::spawn(move || {
                        while !matches!(bus.emit(EventKind::MatchStart, Payload::None), Err(HookError::BusStopped)) {}
                    })
                })
                .collect();
            thread::sleep(Duration::from_millis(2));
            bus.stop();
            for p in producers {
                p.join().unwrap();
            }

            let stats = bus.stats();
            assert_eq!(stats.queued, 0);
            assert!(bus.wait_idle(Duration::from_millis(50)));
            assert_eq!(stats.emitted, stats.dispatched + stats.discarded_on_stop);
        }
    }

    #[test]
    fn threaded_start_is_idempotent_and_dispatches() {
        let bus = EventBus::new(EventBusConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        bus.subscribe(EventKind::MatchStart, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.start().unwrap();
        bus.start().unwrap();
        for _ in 0..10 {
            bus.emit(EventKind::MatchStart, Payload::None).unwrap();
        }
        assert!(bus.wait_idle(Duration::from_secs(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(bus.pump(), 0);

        bus.stop();
        bus.stop();
    }

    #[test]
    fn callbacks_may_subscribe_during_dispatch() {
        let bus = Arc::new(EventBus::manual());
        let inner = Arc::clone(&bus);
        bus.subscribe(EventKind::MatchStart, move |_| {
            inner.subscribe(EventKind::MatchEnd, |_| Ok(()));
            Ok(())
        });

        bus.emit(EventKind::MatchStart, Payload::None).unwrap();
        assert_eq!(bus.pump(), 1);
        assert_eq!(bus.subscriber_count(EventKind::MatchEnd), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::manual();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let handle = bus.subscribe(EventKind::MatchEnd, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.subscribe_handle(EventKind::MatchStart, &handle);

        assert_eq!(bus.unsubscribe(&handle), 2);
        bus.emit(EventKind::MatchEnd, Payload::None).unwrap();
        bus.pump();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
