/// Fixed event enumeration and payloads for the domain event bus.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Bar, InvalidationReason, OrderOutcome, SetupCandidate, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    TickReceived,
    BarCompleted,
    SetupDetected,
    SetupInvalidated,
    OrderPlaced,
    OrderFilled,
    OrderRejected,
    PositionOpened,
    PositionClosed,
    FeedConnected,
    FeedDisconnected,
    CircuitBreakerTripped,
    SafeModeEntered,
    ShadowPrediction,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TickReceived => "TICK_RECEIVED",
            EventType::BarCompleted => "BAR_COMPLETED",
            EventType::SetupDetected => "SETUP_DETECTED",
            EventType::SetupInvalidated => "SETUP_INVALIDATED",
            EventType::OrderPlaced => "ORDER_PLACED",
            EventType::OrderFilled => "ORDER_FILLED",
            EventType::OrderRejected => "ORDER_REJECTED",
            EventType::PositionOpened => "POSITION_OPENED",
            EventType::PositionClosed => "POSITION_CLOSED",
            EventType::FeedConnected => "FEED_CONNECTED",
            EventType::FeedDisconnected => "FEED_DISCONNECTED",
            EventType::CircuitBreakerTripped => "CIRCUIT_BREAKER_TRIPPED",
            EventType::SafeModeEntered => "SAFE_MODE_ENTERED",
            EventType::ShadowPrediction => "SHADOW_PREDICTION",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    TickReceived { tick: Tick },
    BarCompleted { bar: Bar },
    SetupDetected { setup: Box<SetupCandidate> },
    SetupInvalidated { setup: Box<SetupCandidate>, reason: InvalidationReason },
    OrderPlaced { setup_id: uuid::Uuid, symbol: String },
    OrderFilled { setup_id: uuid::Uuid, outcome: OrderOutcome },
    OrderRejected { setup_id: uuid::Uuid, reason: String },
    PositionOpened { symbol: String, quantity: i64 },
    PositionClosed { symbol: String, pnl: rust_decimal::Decimal },
    FeedConnected { source: String },
    FeedDisconnected { source: String, reason: String },
    CircuitBreakerTripped { consecutive_failures: u32, reason: String },
    SafeModeEntered { reason: String },
    ShadowPrediction { symbol: String, payload: serde_json::Value },
}

/// One emission on the bus: a type tag, a timestamp and a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(event_type: EventType, payload: EventPayload) -> Self {
        Event {
            event_type,
            timestamp: Utc::now(),
            payload,
        }
    }
}
