#![doc = include_str!("../README.md")]

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Marker for values that can ride the bus. The tag travels with every
/// event and is compared before downcasting; the catalogue of payload
/// types is closed and fixed at compile time, which is what makes the
/// downcast safe.
pub trait EventPayload: Any + Send + Sync {
    const TYPE_TAG: &'static str;
}

/// A published event: type name, tagged payload.
#[derive(Clone)]
pub struct Event {
    event_type: Arc<str>,
    payload: Arc<dyn Any + Send + Sync>,
    type_tag: &'static str,
}

impl Event {
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn type_tag(&self) -> &'static str {
        self.type_tag
    }

    /// The payload, if `T` matches the tag it was published with.
    pub fn payload<T: EventPayload>(&self) -> Option<&T> {
        if self.type_tag != T::TYPE_TAG {
            return None;
        }
        self.payload.downcast_ref::<T>()
    }
}

/// Delivery ordering between handlers of one event. Higher runs first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub enum EventPriority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
    /// Observability handlers that must see the event before anything else.
    Monitor,
}

/// Where a handler runs relative to `publish`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum DeliveryMode {
    /// Queued; runs on the dispatch task.
    #[default]
    Sync,
    /// Queued; the dispatch task offloads it to its own task.
    Async,
    /// Runs on the publishing task, before `publish` returns.
    Immediate,
}

#[derive(Clone, Copy, Debug)]
pub struct HandlerConfig {
    pub priority: EventPriority,
    pub mode: DeliveryMode,
    /// Keep the subscription alive after the handler reports failure.
    pub persist_after_error: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            priority: EventPriority::Normal,
            mode: DeliveryMode::Sync,
            persist_after_error: true,
        }
    }
}

pub type HandlerId = u64;

/// Handlers return `false` to report failure; the bus unsubscribes failed
/// handlers unless they asked to persist.
type HandlerFn = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

struct HandlerInfo {
    id: HandlerId,
    config: HandlerConfig,
    expected_tag: &'static str,
    handler: HandlerFn,
}

/// The process-wide publish/subscribe bus.
///
/// Two locks: the subscription table is read-mostly, and the pending queue
/// is a bounded producer/consumer channel drained by
/// [`run_dispatch`](Self::run_dispatch).
pub struct EventBus {
    subscriptions: RwLock<FxHashMap<Arc<str>, Vec<HandlerInfo>>>,
    queue_tx: flume::Sender<Event>,
    queue_rx: flume::Receiver<Event>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(queue_capacity: usize) -> Self {
        let (queue_tx, queue_rx) = flume::bounded(queue_capacity);
        Self {
            subscriptions: RwLock::new(FxHashMap::default()),
            queue_tx,
            queue_rx,
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `handler` for events published under `event_type` with a
    /// payload of type `T`.
    pub fn subscribe<T, F>(&self, event_type: &str, config: HandlerConfig, handler: F) -> HandlerId
    where
        T: EventPayload,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let erased: HandlerFn = Arc::new(move |event: &Event| match event.payload::<T>() {
            Some(payload) => handler(payload),
            // Tag mismatch is not an error; the event is simply not for
            // this handler.
            None => true,
        });

        let mut subs = self.subscriptions.write();
        let handlers = subs.entry(Arc::from(event_type)).or_default();
        handlers.push(HandlerInfo {
            id,
            config,
            expected_tag: T::TYPE_TAG,
            handler: erased,
        });
        // Descending priority so delivery can walk the list in order.
        handlers.sort_by(|a, b| b.config.priority.cmp(&a.config.priority));

        trace!(event_type, id, "subscribed event handler");
        id
    }

    pub fn unsubscribe(&self, event_type: &str, id: HandlerId) -> bool {
        let mut subs = self.subscriptions.write();
        let Some(handlers) = subs.get_mut(event_type) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|info| info.id != id);
        before != handlers.len()
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.subscriptions
            .read()
            .get(event_type)
            .map_or(0, Vec::len)
    }

    pub fn has_handlers(&self, event_type: &str) -> bool {
        self.handler_count(event_type) > 0
    }

    /// Publishes `payload` under `event_type`.
    ///
    /// Immediate handlers run here, in descending priority order, before
    /// this returns. Queued handlers are counted and serviced by the
    /// dispatch task. Returns the number of handlers the event was
    /// delivered or queued to.
    pub fn publish<T: EventPayload>(&self, event_type: &str, payload: T) -> usize {
        let event = Event {
            event_type: Arc::from(event_type),
            payload: Arc::new(payload),
            type_tag: T::TYPE_TAG,
        };

        let (immediate, queued_matches) = {
            let subs = self.subscriptions.read();
            let Some(handlers) = subs.get(event_type) else {
                return 0;
            };

            let mut immediate = Vec::new();
            let mut queued = 0_usize;
            for info in handlers {
                if info.expected_tag != event.type_tag {
                    continue;
                }
                match info.config.mode {
                    DeliveryMode::Immediate => {
                        immediate.push((info.id, info.config, Arc::clone(&info.handler)));
                    }
                    DeliveryMode::Sync | DeliveryMode::Async => queued += 1,
                }
            }
            (immediate, queued)
        };

        let mut delivered = 0_usize;
        for (id, config, handler) in immediate {
            delivered += 1;
            if !handler(&event) && !config.persist_after_error {
                warn!(event_type, id, "unsubscribing failed immediate handler");
                self.unsubscribe(event_type, id);
            }
        }

        if queued_matches > 0 {
            if self.queue_tx.try_send(event).is_err() {
                warn!(event_type, "event queue full, dropping queued delivery");
            } else {
                delivered += queued_matches;
            }
        }

        delivered
    }

    /// Drains the pending queue, fanning each event out to its queued
    /// handlers. Runs until the shutdown signal flips.
    pub async fn run_dispatch(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let event = tokio::select! {
                recv = self.queue_rx.recv_async() => match recv {
                    Ok(event) => event,
                    Err(_) => return,
                },
                _ = shutdown.changed() => {
                    debug!("event dispatch task stopping");
                    return;
                }
            };

            self.dispatch_queued(&event);
        }
    }

    /// Delivers one queued event to its Sync and Async handlers. Exposed
    /// so tests can drive delivery without a running dispatch task.
    pub fn dispatch_queued(&self, event: &Event) {
        let targets: Vec<_> = {
            let subs = self.subscriptions.read();
            let Some(handlers) = subs.get(event.event_type()) else {
                return;
            };
            handlers
                .iter()
                .filter(|info| {
                    info.expected_tag == event.type_tag
                        && info.config.mode != DeliveryMode::Immediate
                })
                .map(|info| (info.id, info.config, Arc::clone(&info.handler)))
                .collect()
        };

        for (id, config, handler) in targets {
            match config.mode {
                DeliveryMode::Async => {
                    let event = event.clone();
                    tokio::spawn(async move {
                        if !handler(&event) {
                            // The dispatch task owns unsubscription; a
                            // failed async handler only logs.
                            warn!(event_type = event.event_type(), id, "async handler failed");
                        }
                    });
                }
                _ => {
                    if !handler(event) && !config.persist_after_error {
                        warn!(
                            event_type = event.event_type(),
                            id, "unsubscribing failed handler"
                        );
                        self.unsubscribe(event.event_type(), id);
                    }
                }
            }
        }
    }

    /// Number of events waiting for the dispatch task.
    pub fn pending(&self) -> usize {
        self.queue_rx.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use super::*;

    struct Ping(u32);

    impl EventPayload for Ping {
        const TYPE_TAG: &'static str = "test.ping";
    }

    struct Pong;

    impl EventPayload for Pong {
        const TYPE_TAG: &'static str = "test.pong";
    }

    fn immediate(priority: EventPriority) -> HandlerConfig {
        HandlerConfig {
            priority,
            mode: DeliveryMode::Immediate,
            persist_after_error: true,
        }
    }

    #[test]
    fn immediate_handlers_run_before_publish_returns() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen2 = Arc::clone(&seen);
        bus.subscribe::<Ping, _>("tick", immediate(EventPriority::Normal), move |ping| {
            seen2.fetch_add(ping.0 as usize, Ordering::SeqCst);
            true
        });

        assert_eq!(bus.publish("tick", Ping(5)), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn immediate_delivery_is_priority_ordered() {
        let bus = EventBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, priority) in [
            ("low", EventPriority::Low),
            ("monitor", EventPriority::Monitor),
            ("normal", EventPriority::Normal),
        ] {
            let order = Arc::clone(&order);
            bus.subscribe::<Ping, _>("tick", immediate(priority), move |_| {
                order.lock().unwrap().push(label);
                true
            });
        }

        bus.publish("tick", Ping(0));
        assert_eq!(*order.lock().unwrap(), vec!["monitor", "normal", "low"]);
    }

    #[test]
    fn mismatched_payload_type_is_skipped_silently() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = Arc::clone(&hits);
        bus.subscribe::<Ping, _>("tick", immediate(EventPriority::Normal), move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
            true
        });

        bus.publish("tick", Pong);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_handler_without_persist_is_unsubscribed() {
        let bus = EventBus::default();
        bus.subscribe::<Ping, _>(
            "tick",
            HandlerConfig {
                persist_after_error: false,
                mode: DeliveryMode::Immediate,
                ..Default::default()
            },
            |_| false,
        );

        assert_eq!(bus.handler_count("tick"), 1);
        bus.publish("tick", Ping(0));
        assert_eq!(bus.handler_count("tick"), 0);
    }

    #[test]
    fn subscribe_then_unsubscribe_restores_count() {
        let bus = EventBus::default();
        let before = bus.handler_count("tick");

        let id = bus.subscribe::<Ping, _>("tick", HandlerConfig::default(), |_| true);
        assert_eq!(bus.handler_count("tick"), before + 1);

        assert!(bus.unsubscribe("tick", id));
        assert_eq!(bus.handler_count("tick"), before);
        assert!(!bus.unsubscribe("tick", id));
    }

    #[test]
    fn queued_events_deliver_through_dispatch() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = Arc::clone(&hits);
        bus.subscribe::<Ping, _>("tick", HandlerConfig::default(), move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
            true
        });

        assert_eq!(bus.publish("tick", Ping(0)), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0, "sync handlers wait for dispatch");

        let event = bus.queue_rx.recv().unwrap();
        bus.dispatch_queued(&event);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
