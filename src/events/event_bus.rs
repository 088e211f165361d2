/// Typed publish/subscribe event bus. Handlers are fanned out concurrently
/// by default; `emit_and_wait` awaits completion for shutdown-critical paths.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use super::types::{Event, EventType};
use crate::error::Result;

pub type EventHandler =
    Arc<dyn Fn(Event) -> futures_util::future::BoxFuture<'static, Result<()>> + Send + Sync>;

/// Whether a subscribed handler runs concurrently with its siblings or is
/// serialized behind the bus's own sequential lane. Handlers that require
/// in-order delivery (e.g. persist-then-trade) should register Sequential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerMode {
    Concurrent,
    Sequential,
}

struct Subscription {
    handler: EventHandler,
    mode: HandlerMode,
}

#[derive(Debug, Default)]
struct HandlerStats {
    dispatched: AtomicU64,
    failed: AtomicU64,
}

pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<EventType, Vec<Subscription>>>>,
    stats: Arc<RwLock<HashMap<EventType, Arc<HandlerStats>>>>,
    /// Serializes Sequential-mode handlers so they observe events in emission order.
    sequential_lane: Arc<tokio::sync::Mutex<()>>,
    accepting: Arc<std::sync::atomic::AtomicBool>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(HashMap::new())),
            sequential_lane: Arc::new(tokio::sync::Mutex::new(())),
            accepting: Arc::new(std::sync::atomic::AtomicBool::new(true)),
        }
    }

    pub async fn subscribe(&self, event_type: EventType, handler: EventHandler, mode: HandlerMode) {
        let mut subscribers = self.subscribers.write().await;
        subscribers
            .entry(event_type)
            .or_default()
            .push(Subscription { handler, mode });
        debug!("subscribed handler to {}", event_type.as_str());
    }

    pub async fn unsubscribe_all(&self, event_type: EventType) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.remove(&event_type);
    }

    /// Fire-and-forget: each handler runs in its own spawned task. The emitter
    /// returns as soon as handlers are dispatched, not when they complete.
    pub async fn emit(&self, event: Event) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            warn!("event bus not accepting emissions, dropping {}", event.event_type.as_str());
            return Ok(());
        }
        self.dispatch(event, false).await;
        Ok(())
    }

    /// Awaits all handlers (concurrent ones included) before returning. Used
    /// for shutdown-critical events where the caller must know handlers ran.
    pub async fn emit_and_wait(&self, event: Event) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            warn!("event bus not accepting emissions, dropping {}", event.event_type.as_str());
            return Ok(());
        }
        self.dispatch(event, true).await;
        Ok(())
    }

    async fn dispatch(&self, event: Event, wait: bool) {
        let event_type = event.event_type;
        let handlers: Vec<(EventHandler, HandlerMode)> = {
            let subs = self.subscribers.read().await;
            match subs.get(&event_type) {
                Some(v) => v.iter().map(|s| (Arc::clone(&s.handler), s.mode)).collect(),
                None => {
                    debug!("no handlers registered for {}", event_type.as_str());
                    return;
                }
            }
        };

        let stats = self.handler_stats(event_type).await;
        let mut wait_handles = Vec::new();

        for (handler, mode) in handlers {
            let event_clone = event.clone();
            let stats = Arc::clone(&stats);
            let sequential_lane = Arc::clone(&self.sequential_lane);

            let fut = async move {
                stats.dispatched.fetch_add(1, Ordering::Relaxed);
                let result = match mode {
                    HandlerMode::Concurrent => handler(event_clone).await,
                    HandlerMode::Sequential => {
                        let _guard = sequential_lane.lock().await;
                        handler(event_clone).await
                    }
                };
                if let Err(e) = result {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, code = e.error_code(), "event handler failed for {}", event_type.as_str());
                }
            };

            if wait {
                wait_handles.push(tokio::spawn(fut));
            } else {
                tokio::spawn(fut);
            }
        }

        if wait {
            for handle in wait_handles {
                let _ = handle.await;
            }
        }
    }

    async fn handler_stats(&self, event_type: EventType) -> Arc<HandlerStats> {
        let mut stats = self.stats.write().await;
        Arc::clone(stats.entry(event_type).or_insert_with(|| Arc::new(HandlerStats::default())))
    }

    /// (dispatched, failed) counters for one event type, for the operator-visible stats snapshot.
    pub async fn handler_counts(&self, event_type: EventType) -> (u64, u64) {
        let stats = self.stats.read().await;
        match stats.get(&event_type) {
            Some(s) => (s.dispatched.load(Ordering::Relaxed), s.failed.load(Ordering::Relaxed)),
            None => (0, 0),
        }
    }

    /// Stops accepting new emissions and waits up to `timeout` for the
    /// sequential lane to drain. Concurrent handlers already spawned are not
    /// forcibly cancelled; they are expected to be short-lived.
    pub async fn shutdown(&self, timeout: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        let _ = tokio::time::timeout(timeout, self.sequential_lane.lock()).await;
        debug!("event bus shut down");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::EventPayload;
    use crate::types::{InvalidationReason, Tick};
    use rust_decimal_macros::dec;
    use tokio::sync::Mutex;

    fn sample_tick() -> Tick {
        Tick {
            symbol: "NQ".into(),
            price: dec!(100),
            size: 1,
            timestamp: chrono::Utc::now(),
            exchange: "CME".into(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let bus = EventBus::new();
        let called = Arc::new(Mutex::new(false));
        let called_clone = Arc::clone(&called);

        let handler: EventHandler = Arc::new(move |_event| {
            let called = Arc::clone(&called_clone);
            Box::pin(async move {
                *called.lock().await = true;
                Ok(())
            })
        });

        bus.subscribe(EventType::TickReceived, handler, HandlerMode::Concurrent).await;

        let event = Event::new(EventType::TickReceived, EventPayload::TickReceived { tick: sample_tick() });
        bus.emit_and_wait(event).await.unwrap();

        assert!(*called.lock().await);
    }

    #[tokio::test]
    async fn test_handler_failure_is_isolated_and_counted() {
        let bus = EventBus::new();
        let handler: EventHandler = Arc::new(|_event| {
            Box::pin(async move { Err(crate::error::TradingError::Other("boom".into())) })
        });
        bus.subscribe(EventType::SetupInvalidated, handler, HandlerMode::Concurrent).await;

        let event = Event::new(
            EventType::SetupInvalidated,
            EventPayload::SetupInvalidated {
                setup: Box::new(crate::types::SetupCandidate::new(
                    "NQ",
                    chrono::Utc::now(),
                    dec!(100),
                    dec!(90),
                    None,
                    chrono::Utc::now(),
                    dec!(105),
                )),
                reason: InvalidationReason::ConsolTimeout,
            },
        );
        bus.emit_and_wait(event).await.unwrap();

        let (dispatched, failed) = bus.handler_counts(EventType::SetupInvalidated).await;
        assert_eq!(dispatched, 1);
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting_emissions() {
        let bus = EventBus::new();
        bus.shutdown(Duration::from_millis(100)).await;

        let called = Arc::new(Mutex::new(false));
        let called_clone = Arc::clone(&called);
        let handler: EventHandler = Arc::new(move |_event| {
            let called = Arc::clone(&called_clone);
            Box::pin(async move {
                *called.lock().await = true;
                Ok(())
            })
        });
        bus.subscribe(EventType::TickReceived, handler, HandlerMode::Concurrent).await;
        bus.emit(Event::new(EventType::TickReceived, EventPayload::TickReceived { tick: sample_tick() }))
            .await
            .unwrap();

        assert!(!*called.lock().await);
    }
}
