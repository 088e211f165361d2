/// Trait boundaries to the external collaborators named in spec.md §6: the
/// live tick feed, the order-placing broker, and the broker's position
/// query used during recovery and shutdown reconciliation. The core only
/// depends on these traits; concrete feed/broker wrappers are out of scope
/// (spec.md §1).
///
/// `async_trait` is used only where the engine needs to hold these behind a
/// `Box<dyn Trait>` for dynamic dispatch, following the teacher's own
/// reservation of `async-trait` for exactly that case rather than for every
/// async interface.
use async_trait::async_trait;

use crate::error::Result;
use crate::types::{OrderOutcome, SetupCandidate, Tick};

/// A live stream of ticks. Implementations own reconnection with
/// exponential backoff and re-subscription after reconnect, and are
/// responsible for emitting FeedConnected/FeedDisconnected on the event bus
/// themselves — the engine only consumes `next_tick`.
#[async_trait]
pub trait TickSource: Send + Sync {
    /// The next tick, or `Ok(None)` if the source has been exhausted
    /// (e.g. end of a replayed file). An `Err` is a transient I/O failure
    /// the engine counts against the circuit breaker.
    async fn next_tick(&mut self) -> Result<Option<Tick>>;

    async fn disconnect(&mut self) -> Result<()>;
}

/// A single callback invoked on SetupComplete. The core never retries or
/// modifies an existing order; the callback alone decides success,
/// rejection, or timeout.
#[async_trait]
pub trait OrderPlacer: Send + Sync {
    async fn place_bracket(&self, setup: &SetupCandidate) -> Result<OrderOutcome>;

    async fn disconnect(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerPosition {
    pub symbol: String,
    pub quantity: i64,
}

/// Read-only broker position query, used at startup (verify open trades
/// against what the broker actually holds) and at shutdown (log any
/// position still open). The core never places corrective trades based on
/// a mismatch; that is explicitly out of scope.
#[async_trait]
pub trait BrokerPositionQuery: Send + Sync {
    async fn open_positions(&self) -> Result<Vec<BrokerPosition>>;
}
