//! Buffered publisher with admission control and a delivery pump thread.
//!
//! `publish` only appends to a bounded local buffer. A pump thread wakes every
//! `poll_interval_ms`, regardless of traffic, and hands every record whose
//! linger window has elapsed to the [`BrokerClient`]. Transient failures are
//! retried with a fixed backoff up to `message_send_max_retries` times; after
//! that, or on a fatal failure, or once `message_timeout_ms` has passed, the
//! record fails terminally and is counted. Nothing leaves the buffer without
//! being counted as delivered or failed.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{HookError, HookResult, PublishRejected};

use super::client::{BrokerClient, DeliveryError, OutboundRecord};
use super::config::BrokerConfig;
use super::{Publisher, TopicOptions};

const FLUSH_TICK: Duration = Duration::from_millis(5);

/// Point-in-time publisher counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublisherStats {
    /// Messages admitted into the buffer.
    pub accepted: u64,
    /// Refused because the buffer was at its message or byte limit.
    pub rejected_backpressure: u64,
    /// Refused because the message exceeded `message_max_bytes`.
    pub rejected_oversize: u64,
    /// Refused because the publisher was closed.
    pub rejected_closed: u64,
    /// Handed to the broker client successfully.
    pub delivered: u64,
    /// Transient failures that were scheduled for another attempt.
    pub retried: u64,
    /// Terminal failures (retries exhausted, fatal, timed out, dropped at close).
    pub failed: u64,
    /// Messages buffered or in flight right now.
    pub buffered_messages: usize,
    /// Bytes buffered or in flight right now.
    pub buffered_bytes: usize,
}

#[derive(Debug)]
struct Pending {
    record: OutboundRecord,
    enqueued_at: Instant,
    not_before: Instant,
    failures: u32,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    rejected_backpressure: AtomicU64,
    rejected_oversize: AtomicU64,
    rejected_closed: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

struct Pump<C> {
    cfg: BrokerConfig,
    client: C,
    queue: Mutex<VecDeque<Pending>>,
    buffered_messages: AtomicUsize,
    buffered_bytes: AtomicUsize,
    closed: AtomicBool,
    counters: Counters,
}

impl<C: BrokerClient> Pump<C> {
    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Pending>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self, topic: &str, message: &[u8]) -> Result<(), PublishRejected> {
        let size = message.len();
        if size > self.cfg.message_max_bytes {
            self.counters.rejected_oversize.fetch_add(1, Ordering::Relaxed);
            return Err(PublishRejected::Oversize {
                size,
                max: self.cfg.message_max_bytes,
            });
        }

        // Admission is decided under the queue lock so concurrent producers
        // cannot overshoot the limits.
        let mut queue = self.lock_queue();
        if self.closed.load(Ordering::Acquire) {
            self.counters.rejected_closed.fetch_add(1, Ordering::Relaxed);
            return Err(PublishRejected::Closed);
        }

        let buffered_messages = self.buffered_messages.load(Ordering::Acquire);
        let buffered_bytes = self.buffered_bytes.load(Ordering::Acquire);
        if buffered_messages >= self.cfg.queue_buffering_max_messages
            || buffered_bytes.saturating_add(size) > self.cfg.max_buffered_bytes()
        {
            self.counters.rejected_backpressure.fetch_add(1, Ordering::Relaxed);
            return Err(PublishRejected::Backpressure {
                buffered_messages,
                buffered_bytes,
            });
        }

        let now = Instant::now();
        queue.push_back(Pending {
            record: OutboundRecord {
                topic: topic.to_string(),
                payload: message.to_vec(),
            },
            enqueued_at: now,
            not_before: now,
            failures: 0,
        });
        self.buffered_messages.fetch_add(1, Ordering::Release);
        self.buffered_bytes.fetch_add(size, Ordering::Release);
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn settle(&self, pending: &Pending) {
        self.buffered_messages.fetch_sub(1, Ordering::Release);
        self.buffered_bytes.fetch_sub(pending.record.payload.len(), Ordering::Release);
    }

    fn fail(&self, pending: &Pending, reason: &str) {
        self.settle(pending);
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            topic = %pending.record.topic,
            bytes = pending.record.payload.len(),
            failures = pending.failures,
            reason,
            "message delivery failed"
        );
    }

    /// One delivery round. With `force`, the linger window is ignored (backoff
    /// is not). Returns the number of records still buffered or in flight.
    fn drive(&self, force: bool) -> usize {
        let now = Instant::now();
        let linger = self.cfg.linger();
        let timeout = self.cfg.message_timeout();

        let mut ready = Vec::new();
        let mut expired = Vec::new();
        {
            let mut queue = self.lock_queue();
            let mut waiting = VecDeque::with_capacity(queue.len());
            for pending in std::mem::take(&mut *queue) {
                let age = now.saturating_duration_since(pending.enqueued_at);
                if age >= timeout {
                    expired.push(pending);
                } else if now >= pending.not_before && (force || age >= linger) {
                    ready.push(pending);
                } else {
                    waiting.push_back(pending);
                }
            }
            *queue = waiting;
        }

        for pending in &expired {
            self.fail(pending, "message timed out");
        }

        let mut retry = Vec::new();
        for mut pending in ready {
            match self.client.send(&pending.record) {
                Ok(()) => {
                    self.settle(&pending);
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(DeliveryError::Transient { message }) => {
                    pending.failures += 1;
                    if pending.failures > self.cfg.message_send_max_retries {
                        self.fail(&pending, &message);
                    } else {
                        self.counters.retried.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            topic = %pending.record.topic,
                            failures = pending.failures,
                            error = %message,
                            "transient send failure, retrying"
                        );
                        pending.not_before = Instant::now() + self.cfg.retry_backoff();
                        retry.push(pending);
                    }
                }
                Err(DeliveryError::Fatal { message }) => self.fail(&pending, &message),
            }
        }

        if !retry.is_empty() {
            let mut queue = self.lock_queue();
            for pending in retry.into_iter().rev() {
                queue.push_front(pending);
            }
        }

        self.buffered_messages.load(Ordering::Acquire)
    }

    fn flush(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = self.drive(true);
            let now = Instant::now();
            if remaining == 0 || now >= deadline {
                return remaining;
            }
            thread::sleep(FLUSH_TICK.min(deadline - now));
        }
    }

    fn fail_remaining(&self) -> usize {
        let leftovers = std::mem::take(&mut *self.lock_queue());
        for pending in &leftovers {
            self.fail(pending, "dropped at shutdown");
        }
        leftovers.len()
    }

    fn stats(&self) -> PublisherStats {
        let c = &self.counters;
        PublisherStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            rejected_backpressure: c.rejected_backpressure.load(Ordering::Relaxed),
            rejected_oversize: c.rejected_oversize.load(Ordering::Relaxed),
            rejected_closed: c.rejected_closed.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            buffered_messages: self.buffered_messages.load(Ordering::Acquire),
            buffered_bytes: self.buffered_bytes.load(Ordering::Acquire),
        }
    }
}

fn pump_loop<C: BrokerClient>(pump: &Pump<C>, stop_rx: &Receiver<()>) {
    let tick = pump.cfg.poll_interval();
    loop {
        match stop_rx.recv_timeout(tick) {
            Err(RecvTimeoutError::Timeout) => {
                pump.drive(false);
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// [`Publisher`] that buffers locally and delivers through a [`BrokerClient`]
/// from its own pump thread.
pub struct BufferedPublisher<C: BrokerClient> {
    pump: Arc<Pump<C>>,
    stop_tx: Sender<()>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl<C: BrokerClient> BufferedPublisher<C> {
    /// Validate `cfg`, hand its property map to `client` and start the pump thread.
    ///
    /// # Errors
    /// `HookError::Configuration` if `cfg` is invalid or the client refuses a
    /// property; `HookError::Internal` if the pump thread cannot be spawned.
    pub fn new(cfg: BrokerConfig, client: C) -> HookResult<Self> {
        cfg.validate()?;
        client.configure(&cfg.to_properties())?;

        let pump = Arc::new(Pump {
            cfg,
            client,
            queue: Mutex::new(VecDeque::new()),
            buffered_messages: AtomicUsize::new(0),
            buffered_bytes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread_pump = Arc::clone(&pump);
        let join = thread::Builder::new()
            .name("hookbus-pump".to_string())
            .spawn(move || pump_loop(&thread_pump, &stop_rx))
            .map_err(|e| HookError::internal(format!("failed to spawn delivery pump: {e}")))?;

        tracing::debug!(
            servers = %pump.cfg.bootstrap_servers.join(","),
            client_id = %pump.cfg.client_id,
            "publisher started"
        );

        Ok(Self {
            pump,
            stop_tx,
            join: Mutex::new(Some(join)),
        })
    }

    /// Deliver buffered records, ignoring the linger window, until the buffer
    /// is empty or `timeout` passes. Returns the number of records left.
    pub fn flush(&self, timeout: Duration) -> usize {
        self.pump.flush(timeout)
    }

    /// Stop accepting messages, stop the pump and flush for at most
    /// `flush_timeout_ms`. Whatever is still buffered afterwards is counted as
    /// failed. Idempotent.
    pub fn close(&self) {
        let was_closed = {
            let _queue = self.pump.lock_queue();
            self.pump.closed.swap(true, Ordering::AcqRel)
        };
        if was_closed {
            return;
        }

        let _ = self.stop_tx.try_send(());
        let handle = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("delivery pump terminated abnormally");
            }
        }

        let remaining = self.pump.flush(self.pump.cfg.flush_timeout());
        if remaining > 0 {
            let dropped = self.pump.fail_remaining();
            tracing::warn!(dropped, "publisher closed with undelivered messages");
        }
        tracing::debug!(stats = ?self.pump.stats(), "publisher closed");
    }

    /// True once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pump.closed.load(Ordering::Acquire)
    }

    /// Snapshot of the delivery counters.
    #[must_use]
    pub fn stats(&self) -> PublisherStats {
        self.pump.stats()
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.pump.cfg
    }

    /// The wrapped broker client.
    #[must_use]
    pub fn client(&self) -> &C {
        &self.pump.client
    }
}

impl<C: BrokerClient> Publisher for BufferedPublisher<C> {
    fn try_publish(&self, topic: &str, message: &[u8]) -> Result<(), PublishRejected> {
        self.pump.admit(topic, message)
    }

    fn create_topic(&self, topic: &str, options: &TopicOptions) -> HookResult<()> {
        if self.is_closed() {
            return Err(PublishRejected::Closed.into());
        }
        self.pump.client.create_topic(topic, options)
    }
}

impl<C: BrokerClient> Drop for BufferedPublisher<C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<C: BrokerClient> fmt::Debug for BufferedPublisher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedPublisher")
            .field("client_id", &self.pump.cfg.client_id)
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::publisher::{LogBroker, MemoryBroker};

    fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn fast_cfg() -> BrokerConfig {
        BrokerConfig {
            linger_ms: 0,
            retry_backoff_ms: 1,
            poll_interval_ms: 1,
            flush_timeout_ms: 200,
            ..BrokerConfig::default()
        }
    }

    #[test]
    fn rejects_invalid_config() {
        let cfg = BrokerConfig {
            bootstrap_servers: Vec::new(),
            ..BrokerConfig::default()
        };
        let err = BufferedPublisher::new(cfg, MemoryBroker::new()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn properties_reach_the_client() {
        let broker = Arc::new(MemoryBroker::new());
        let cfg = BrokerConfig {
            acks: crate::publisher::Acks::Leader,
            ..BrokerConfig::with_servers("kafka-1:9092,kafka-2:9092")
        };
        let publisher = BufferedPublisher::new(cfg, Arc::clone(&broker)).unwrap();
        let props = broker.properties();
        assert_eq!(props["bootstrap.servers"], "kafka-1:9092,kafka-2:9092");
        assert_eq!(props["acks"], "1");
        assert_eq!(props["queue.buffering.max.ms"], "1000");
        publisher.close();
    }

    #[test]
    fn refused_property_is_a_configuration_error() {
        let broker = MemoryBroker::new();
        broker.refuse_property("compression.type");
        let err = BufferedPublisher::new(fast_cfg(), broker).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn delivers_after_linger() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = BufferedPublisher::new(fast_cfg(), Arc::clone(&broker)).unwrap();

        assert!(publisher.publish_str("events", r#"{"event":"match_start"}"#));
        assert!(wait_for(Duration::from_secs(2), || publisher.stats().delivered == 1));
        assert_eq!(broker.delivered_to("events").len(), 1);
        assert_eq!(publisher.stats().buffered_messages, 0);
    }

    #[test]
    fn count_limit_applies_backpressure_until_drained() {
        let cfg = BrokerConfig {
            linger_ms: 60_000,
            message_timeout_ms: 120_000,
            queue_buffering_max_messages: 3,
            ..fast_cfg()
        };
        let publisher = BufferedPublisher::new(cfg, MemoryBroker::new()).unwrap();

        for _ in 0..3 {
            assert!(publisher.publish("t", b"x"));
        }
        assert!(!publisher.publish("t", b"x"));
        assert_eq!(
            publisher.try_publish("t", b"x"),
            Err(PublishRejected::Backpressure {
                buffered_messages: 3,
                buffered_bytes: 3
            })
        );

        assert_eq!(publisher.flush(Duration::from_secs(1)), 0);
        assert!(publisher.publish("t", b"x"));

        let stats = publisher.stats();
        assert_eq!(stats.rejected_backpressure, 2);
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.accepted, 4);
    }

    #[test]
    fn byte_limit_applies_backpressure() {
        let cfg = BrokerConfig {
            linger_ms: 60_000,
            queue_buffering_max_kbytes: 1,
            message_max_bytes: 1024,
            ..fast_cfg()
        };
        let publisher = BufferedPublisher::new(cfg, MemoryBroker::new()).unwrap();

        assert!(publisher.publish("t", &[0u8; 600]));
        assert!(matches!(
            publisher.try_publish("t", &[0u8; 600]),
            Err(PublishRejected::Backpressure { buffered_bytes: 600, .. })
        ));
        assert!(publisher.publish("t", &[0u8; 424]));
    }

    #[test]
    fn oversize_message_rejected() {
        let cfg = BrokerConfig {
            message_max_bytes: 4,
            ..fast_cfg()
        };
        let publisher = BufferedPublisher::new(cfg, MemoryBroker::new()).unwrap();
        assert_eq!(
            publisher.try_publish("t", b"12345"),
            Err(PublishRejected::Oversize { size: 5, max: 4 })
        );
        assert_eq!(publisher.stats().rejected_oversize, 1);
    }

    #[test]
    fn transient_failure_is_retried() {
        let broker = Arc::new(MemoryBroker::new());
        broker.fail_next(DeliveryError::transient("leader not available"));
        let publisher = BufferedPublisher::new(fast_cfg(), Arc::clone(&broker)).unwrap();

        assert!(publisher.publish("t", b"payload"));
        assert!(wait_for(Duration::from_secs(2), || publisher.stats().delivered == 1));

        let stats = publisher.stats();
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(broker.send_calls(), 2);
    }

    #[test]
    fn retries_exhausted_counts_failure() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_offline(true);
        let cfg = BrokerConfig {
            message_send_max_retries: 2,
            ..fast_cfg()
        };
        let publisher = BufferedPublisher::new(cfg, Arc::clone(&broker)).unwrap();

        assert!(publisher.publish("t", b"payload"));
        assert!(wait_for(Duration::from_secs(2), || publisher.stats().failed == 1));

        let stats = publisher.stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.buffered_messages, 0);
        assert_eq!(broker.send_calls(), 3);
    }

    #[test]
    fn fatal_failure_is_not_retried() {
        let broker = Arc::new(MemoryBroker::new());
        broker.fail_next(DeliveryError::fatal("record too large"));
        let publisher = BufferedPublisher::new(fast_cfg(), Arc::clone(&broker)).unwrap();

        assert!(publisher.publish("t", b"payload"));
        assert!(wait_for(Duration::from_secs(2), || publisher.stats().failed == 1));
        assert_eq!(broker.send_calls(), 1);
        assert_eq!(publisher.stats().retried, 0);
    }

    #[test]
    fn message_timeout_fails_stuck_records() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_offline(true);
        let cfg = BrokerConfig {
            message_send_max_retries: u32::MAX,
            message_timeout_ms: 20,
            ..fast_cfg()
        };
        let publisher = BufferedPublisher::new(cfg, Arc::clone(&broker)).unwrap();

        assert!(publisher.publish("t", b"payload"));
        assert!(wait_for(Duration::from_secs(2), || publisher.stats().failed == 1));
        assert_eq!(publisher.stats().delivered, 0);
    }

    #[test]
    fn close_is_bounded_and_counts_leftovers() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_offline(true);
        let cfg = BrokerConfig {
            message_send_max_retries: u32::MAX,
            flush_timeout_ms: 50,
            ..fast_cfg()
        };
        let publisher = BufferedPublisher::new(cfg, Arc::clone(&broker)).unwrap();
        assert!(publisher.publish("t", b"a"));
        assert!(publisher.publish("t", b"b"));

        let started = Instant::now();
        publisher.close();
        publisher.close();
        assert!(started.elapsed() < Duration::from_secs(2));

        let stats = publisher.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.buffered_messages, 0);
        assert_eq!(stats.buffered_bytes, 0);

        assert_eq!(publisher.try_publish("t", b"c"), Err(PublishRejected::Closed));
        assert_eq!(publisher.stats().rejected_closed, 1);
    }

    #[test]
    fn close_flushes_lingering_records() {
        let broker = Arc::new(MemoryBroker::new());
        let cfg = BrokerConfig {
            linger_ms: 60_000,
            ..fast_cfg()
        };
        let publisher = BufferedPublisher::new(cfg, Arc::clone(&broker)).unwrap();
        assert!(publisher.publish("t", b"a"));
        publisher.close();
        assert_eq!(broker.delivered().len(), 1);
        assert_eq!(publisher.stats().failed, 0);
    }

    #[test]
    fn create_topic_follows_client_support() {
        let memory = BufferedPublisher::new(fast_cfg(), MemoryBroker::new()).unwrap();
        memory.create_topic("events", &TopicOptions::default()).unwrap();
        assert_eq!(memory.client().topics(), vec!["events".to_string()]);

        let log = BufferedPublisher::new(fast_cfg(), LogBroker::new("test")).unwrap();
        assert!(log.create_topic("events", &TopicOptions::default()).unwrap_err().is_unsupported());
    }
}
