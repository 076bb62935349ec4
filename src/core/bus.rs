//! Queued event bus with fixed-size payload slots.
//!
//! Producers copy payload bytes into a bounded queue; a dispatcher task
//! drains the queue and fans each event out to every subscriber whose id
//! matches, in registration order. The queue sits behind a
//! critical-section mutex so the same enqueue path is safe from both
//! task and interrupt context.
//!
//! ```text
//! post() / post_from_isr()          dispatch(max)
//!        │                               │
//!        ▼                               ▼
//!   ┌─────────────────┐      ┌───────────────────────┐
//!   │ bounded queue    │────▶│ subscribers (id match) │
//!   │ (payload copies) │      │ registration order     │
//!   └─────────────────┘      └───────────────────────┘
//! ```
//!
//! Subscribers observe payload bytes as a borrowed view valid only for
//! the duration of the callback.

use core::cell::RefCell;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use embassy_sync::blocking_mutex::Mutex as IsrMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::warn;

use super::events::{EventId, MAX_PAYLOAD_SIZE};

/// Default queue depth (events pending between dispatch calls).
pub const EVENT_QUEUE_LEN: usize = 32;

/// Maximum number of subscriptions across all event ids.
pub const MAX_SUBSCRIBERS: usize = 24;

/// A handler exceeding this wall time gets a rate-limited warning.
const HANDLER_WARN_US: u128 = 5_000;

/// A dispatch batch exceeding this wall time gets a rate-limited warning.
const DISPATCH_WARN_US: u128 = 20_000;

/// Minimum interval between profiling warnings.
const WARN_MIN_INTERVAL_MS: u64 = 2_000;

/// Borrowed view of a delivered event. Valid only inside the callback.
#[derive(Debug, Clone, Copy)]
pub struct EventView<'a> {
    pub id: EventId,
    pub payload: &'a [u8],
}

/// Subscriber callback object. One method, no opaque context pointer:
/// the closure captures whatever state it needs.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &EventView<'_>);
}

impl<F> EventHandler for F
where
    F: Fn(&EventView<'_>) + Send + Sync,
{
    fn on_event(&self, event: &EventView<'_>) {
        self(event);
    }
}

struct Subscriber {
    id: EventId,
    handler: std::sync::Arc<dyn EventHandler>,
}

#[derive(Clone, Copy)]
struct QueuedEvent {
    id: u16,
    len: u8,
    data: [u8; MAX_PAYLOAD_SIZE],
}

/// Thread-safe event queue with subscriber dispatch.
///
/// `QUEUE_LEN` is compile-time; the default matches the production
/// configuration, tests instantiate smaller queues to exercise overflow.
pub struct EventBus<const QUEUE_LEN: usize = EVENT_QUEUE_LEN> {
    queue: IsrMutex<CriticalSectionRawMutex, RefCell<heapless::Deque<QueuedEvent, QUEUE_LEN>>>,
    subs: Mutex<Vec<Subscriber>>,
    dropped: AtomicU32,
    epoch: Instant,
    last_warn_ms: AtomicU64,
}

impl<const QUEUE_LEN: usize> EventBus<QUEUE_LEN> {
    pub fn new() -> Self {
        Self {
            queue: IsrMutex::new(RefCell::new(heapless::Deque::new())),
            subs: Mutex::new(Vec::with_capacity(MAX_SUBSCRIBERS)),
            dropped: AtomicU32::new(0),
            epoch: Instant::now(),
            last_warn_ms: AtomicU64::new(0),
        }
    }

    /// Subscribe a handler to an event id.
    ///
    /// Intended for the init phase only; subscriptions cannot be removed.
    /// Fails when the subscriber table is full.
    pub fn subscribe(&self, id: EventId, handler: std::sync::Arc<dyn EventHandler>) -> bool {
        let mut subs = self.subs.lock().expect("subscriber table poisoned");
        if subs.len() >= MAX_SUBSCRIBERS {
            return false;
        }
        subs.push(Subscriber { id, handler });
        true
    }

    /// Post an event from task context. Non-blocking; the payload is
    /// copied into the queue slot. Returns `false` on overflow or when
    /// the payload exceeds the slot size.
    pub fn post(&self, id: EventId, payload: &[u8]) -> bool {
        self.enqueue(id, payload)
    }

    /// Post an event from interrupt context.
    ///
    /// Same contract as [`post`](Self::post) but guaranteed not to log
    /// or block: the only shared state touched is the critical-section
    /// queue. Producers on the interrupt side of the line must use this
    /// entry point. Failure (queue full) is silent beyond the return
    /// value.
    pub fn post_from_isr(&self, id: EventId, payload: &[u8]) -> bool {
        self.enqueue(id, payload)
    }

    fn enqueue(&self, id: EventId, payload: &[u8]) -> bool {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return false;
        }
        let mut qe = QueuedEvent {
            id: id as u16,
            len: payload.len() as u8,
            data: [0u8; MAX_PAYLOAD_SIZE],
        };
        qe.data[..payload.len()].copy_from_slice(payload);

        let ok = self.queue.lock(|q| q.borrow_mut().push_back(qe).is_ok());
        if !ok {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Dispatch up to `max_events` queued events to their subscribers.
    ///
    /// FIFO per producer; at-most-once delivery per subscriber per post.
    pub fn dispatch(&self, max_events: u16) {
        let batch_start = Instant::now();
        let mut dispatched = 0u16;

        for _ in 0..max_events {
            let Some(qe) = self.queue.lock(|q| q.borrow_mut().pop_front()) else {
                break;
            };
            self.dispatch_one(&qe);
            dispatched += 1;
        }

        let dt = batch_start.elapsed().as_micros();
        if dispatched > 0 && dt > DISPATCH_WARN_US && self.can_warn_now() {
            warn!("dispatch slow: {} events dt={} us", dispatched, dt);
        }
    }

    /// Number of queued events not yet dispatched.
    pub fn pending(&self) -> usize {
        self.queue.lock(|q| q.borrow().len())
    }

    /// Total events dropped on overflow since construction.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn dispatch_one(&self, qe: &QueuedEvent) {
        let Some(id) = EventId::from_u16(qe.id) else {
            // Unknown id in the queue: skip, never fail the dispatcher.
            return;
        };
        let view = EventView {
            id,
            payload: &qe.data[..qe.len as usize],
        };

        let subs = self.subs.lock().expect("subscriber table poisoned");
        for sub in subs.iter() {
            if sub.id != id {
                continue;
            }
            let t0 = Instant::now();
            sub.handler.on_event(&view);
            let dt = t0.elapsed().as_micros();
            if dt > HANDLER_WARN_US && self.can_warn_now() {
                warn!("slow handler: event={} dt={} us", qe.id, dt);
            }
        }
    }

    fn can_warn_now(&self) -> bool {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_warn_ms.load(Ordering::Relaxed);
        if now_ms.wrapping_sub(last) < WARN_MIN_INTERVAL_MS && last != 0 {
            return false;
        }
        self.last_warn_ms.store(now_ms, Ordering::Relaxed);
        true
    }
}

impl<const QUEUE_LEN: usize> Default for EventBus<QUEUE_LEN> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    fn recorder() -> (Arc<StdMutex<Vec<(EventId, Vec<u8>)>>>, Arc<dyn EventHandler>) {
        let log: Arc<StdMutex<Vec<(EventId, Vec<u8>)>>> = Arc::new(StdMutex::new(Vec::new()));
        let log2 = log.clone();
        let handler: Arc<dyn EventHandler> = Arc::new(move |e: &EventView<'_>| {
            log2.lock().unwrap().push((e.id, e.payload.to_vec()));
        });
        (log, handler)
    }

    #[test]
    fn delivers_only_matching_id() {
        let bus: EventBus<8> = EventBus::new();
        let (log, handler) = recorder();
        assert!(bus.subscribe(EventId::SensorsUpdated, handler));

        assert!(bus.post(EventId::SensorsUpdated, &[1, 2]));
        assert!(bus.post(EventId::RelayChanged, &[3]));
        bus.dispatch(16);

        let seen = log.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, EventId::SensorsUpdated);
        assert_eq!(seen[0].1, vec![1, 2]);
    }

    #[test]
    fn overflow_drops_fifth_post_and_keeps_fifo() {
        let bus: EventBus<4> = EventBus::new();
        let (log, handler) = recorder();
        assert!(bus.subscribe(EventId::SensorsUpdated, handler));

        for i in 0..4u8 {
            assert!(bus.post(EventId::SensorsUpdated, &[i]));
        }
        assert!(!bus.post(EventId::SensorsUpdated, &[4]));
        assert_eq!(bus.dropped(), 1);

        bus.dispatch(16);
        let seen = log.lock().unwrap();
        assert_eq!(seen.len(), 4);
        for (i, (_, payload)) in seen.iter().enumerate() {
            assert_eq!(payload[0], i as u8);
        }
    }

    #[test]
    fn oversized_payload_rejected() {
        let bus: EventBus<4> = EventBus::new();
        let too_big = [0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(!bus.post(EventId::SensorsUpdated, &too_big));
        assert_eq!(bus.pending(), 0);
    }

    #[test]
    fn dispatch_respects_max_events() {
        let bus: EventBus<8> = EventBus::new();
        let (log, handler) = recorder();
        assert!(bus.subscribe(EventId::SensorsUpdated, handler));

        for _ in 0..5 {
            assert!(bus.post(EventId::SensorsUpdated, &[]));
        }
        bus.dispatch(2);
        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(bus.pending(), 3);

        bus.dispatch(16);
        assert_eq!(log.lock().unwrap().len(), 5);
    }

    #[test]
    fn subscriber_table_bounded() {
        let bus: EventBus<4> = EventBus::new();
        for _ in 0..MAX_SUBSCRIBERS {
            let (_, handler) = recorder();
            assert!(bus.subscribe(EventId::SystemStarted, handler));
        }
        let (_, handler) = recorder();
        assert!(!bus.subscribe(EventId::SystemStarted, handler));
    }

    #[test]
    fn multiple_subscribers_in_registration_order() {
        let bus: EventBus<4> = EventBus::new();
        let order: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));
        for tag in 0..3u8 {
            let order2 = order.clone();
            let handler: Arc<dyn EventHandler> = Arc::new(move |_: &EventView<'_>| {
                order2.lock().unwrap().push(tag);
            });
            assert!(bus.subscribe(EventId::PoolModeChanged, handler));
        }
        assert!(bus.post(EventId::PoolModeChanged, &[0]));
        bus.dispatch(4);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn isr_post_matches_task_post() {
        let bus: EventBus<4> = EventBus::new();
        let (log, handler) = recorder();
        assert!(bus.subscribe(EventId::AlarmRaised, handler));

        assert!(bus.post_from_isr(EventId::AlarmRaised, &[0x10, 0x04]));
        bus.dispatch(4);
        let seen = log.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, vec![0x10, 0x04]);
    }
}
