/// Core data types shared across the ingestion and pattern-detection pipeline.
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single trade print from the broker feed. Immutable, never persisted by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: Decimal,
    pub size: i64,
    pub timestamp: DateTime<Utc>,
    pub exchange: String,
}

/// A minute-aligned OHLCV bar for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub minute_start: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
    pub tick_count: u32,
}

impl Bar {
    /// True if the bar satisfies the OHLC ordering and non-negative volume invariants.
    pub fn is_valid(&self) -> bool {
        self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
            && self.volume >= 0
            && self.minute_start.timestamp() % 60 == 0
            && self.minute_start.timestamp_subsec_nanos() == 0
    }

    /// A synthetic flat bar used for gap filling: O=H=L=C = previous close, zero volume.
    pub fn flat(symbol: &str, minute_start: DateTime<Utc>, price: Decimal) -> Self {
        Bar {
            symbol: symbol.to_string(),
            minute_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0,
            tick_count: 0,
        }
    }
}

/// Live lifecycle states of a [`SetupCandidate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupState {
    WatchingLiq1,
    WatchingConsol,
    WatchingLiq2,
    WaitingEntry,
    Complete,
    Invalidated,
}

impl SetupState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SetupState::Complete | SetupState::Invalidated)
    }
}

/// Reasons a candidate can be invalidated, recorded for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidationReason {
    ConsolTimeout,
    ConsolQualityLow,
    ConsolRangeTooWide,
    NoWickNotFound,
    Liq2Timeout,
    RetracementExceeded,
    EntryTimeout,
    MarketClosed,
}

impl InvalidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationReason::ConsolTimeout => "CONSOL_TIMEOUT",
            InvalidationReason::ConsolQualityLow => "CONSOL_QUALITY_LOW",
            InvalidationReason::ConsolRangeTooWide => "CONSOL_RANGE_TOO_WIDE",
            InvalidationReason::NoWickNotFound => "NO_WICK_NOT_FOUND",
            InvalidationReason::Liq2Timeout => "LIQ2_TIMEOUT",
            InvalidationReason::RetracementExceeded => "RETRACEMENT_EXCEEDED",
            InvalidationReason::EntryTimeout => "ENTRY_TIMEOUT",
            InvalidationReason::MarketClosed => "MARKET_CLOSED",
        }
    }
}

/// The central entity of the core: one instance of the liquidity-sweep →
/// consolidation → breakout → entry pattern, tracked per symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupCandidate {
    pub id: Uuid,
    pub symbol: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub state: SetupState,

    // Session context, captured at creation time.
    pub lse_high: Decimal,
    pub lse_low: Decimal,
    pub lse_close_time: Option<DateTime<Utc>>,

    // LIQ#1.
    pub liq1_time: DateTime<Utc>,
    pub liq1_price: Decimal,

    // Consolidation.
    pub consol_candles: Vec<Bar>,
    pub consol_high: Decimal,
    pub consol_low: Decimal,
    pub consol_range: Decimal,
    pub consol_quality_score: f64,
    pub consol_confirmed: bool,
    pub consol_confirmed_time: Option<DateTime<Utc>>,

    // No-wick bar.
    pub nowick_time: Option<DateTime<Utc>>,
    pub nowick_high: Option<Decimal>,
    pub nowick_low: Option<Decimal>,
    pub nowick_wick_ratio: Option<f64>,

    // LIQ#2.
    pub liq2_time: Option<DateTime<Utc>>,
    pub liq2_price: Option<Decimal>,
    pub spike_high: Option<Decimal>,
    pub spike_high_time: Option<DateTime<Utc>>,

    // Entry.
    pub entry_trigger_time: Option<DateTime<Utc>>,
    pub entry_price: Option<Decimal>,
    pub sl_price: Option<Decimal>,
    pub tp_price: Option<Decimal>,
    pub risk_reward_ratio: Option<f64>,

    // Termination.
    pub invalidation_reason: Option<InvalidationReason>,
    pub invalidation_time: Option<DateTime<Utc>>,

    /// Bars processed since this candidate entered WatchingConsol; used to
    /// derive "bars since consolidation" / "bars since LIQ#2" counters
    /// without re-deriving them from wall-clock time.
    pub candles_processed: u32,
}

impl SetupCandidate {
    pub fn new(
        symbol: &str,
        now: DateTime<Utc>,
        lse_high: Decimal,
        lse_low: Decimal,
        lse_close_time: Option<DateTime<Utc>>,
        liq1_time: DateTime<Utc>,
        liq1_price: Decimal,
    ) -> Self {
        SetupCandidate {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            created_at: now,
            last_updated: now,
            state: SetupState::WatchingConsol,
            lse_high,
            lse_low,
            lse_close_time,
            liq1_time,
            liq1_price,
            consol_candles: Vec::new(),
            consol_high: Decimal::ZERO,
            consol_low: Decimal::ZERO,
            consol_range: Decimal::ZERO,
            consol_quality_score: 0.0,
            consol_confirmed: false,
            consol_confirmed_time: None,
            nowick_time: None,
            nowick_high: None,
            nowick_low: None,
            nowick_wick_ratio: None,
            liq2_time: None,
            liq2_price: None,
            spike_high: None,
            spike_high_time: None,
            entry_trigger_time: None,
            entry_price: None,
            sl_price: None,
            tp_price: None,
            risk_reward_ratio: None,
            invalidation_reason: None,
            invalidation_time: None,
            candles_processed: 0,
        }
    }

    /// Bars appended to the consolidation window since it was frozen.
    /// Used by WatchingLiq2 to derive its own "bars since consolidation" counter.
    pub fn bars_since_consolidation(&self) -> u32 {
        self.candles_processed
            .saturating_sub(self.consol_candles.len() as u32)
    }

    /// Bars seen since the LIQ#2 breakout bar itself (which is not counted).
    pub fn bars_since_liq2(&self) -> u32 {
        self.bars_since_consolidation().saturating_sub(1)
    }
}

/// Terminal result of a trade taken on a completed setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeResult {
    Open,
    Win,
    Loss,
    Breakeven,
}

/// Append-only record created by downstream order placement and consulted during recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub setup_id: Uuid,
    pub symbol: String,
    pub entry_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub quantity: i64,
    pub sl: Decimal,
    pub tp: Decimal,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub exit_reason: Option<String>,
    pub pnl: Option<Decimal>,
    pub result: TradeResult,
}

/// Outcome of an order-placement attempt, reported synchronously by the order placer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderOutcome {
    Filled { quantity: i64, fill_price: Decimal },
    Rejected { reason: String },
    Timeout,
}

/// One row per trading date, tracking session-level counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub date: chrono::NaiveDate,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub starting_capital: Decimal,
    pub setups_detected: i64,
    pub trades_executed: i64,
    pub trades_won: i64,
    pub trades_lost: i64,
    pub daily_pnl: Decimal,
}

impl SessionState {
    pub fn new(date: chrono::NaiveDate, started_at: DateTime<Utc>, starting_capital: Decimal) -> Self {
        SessionState {
            date,
            started_at,
            ended_at: None,
            starting_capital,
            setups_detected: 0,
            trades_executed: 0,
            trades_won: 0,
            trades_lost: 0,
            daily_pnl: Decimal::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_bar_valid() {
        let bar = Bar {
            symbol: "NQ".into(),
            minute_start: Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc(),
            open: dec!(100),
            high: dec!(105),
            low: dec!(99),
            close: dec!(102),
            volume: 10,
            tick_count: 3,
        };
        assert!(bar.is_valid());
    }

    #[test]
    fn test_bar_invalid_ordering() {
        let bar = Bar {
            symbol: "NQ".into(),
            minute_start: Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc(),
            open: dec!(100),
            high: dec!(99),
            low: dec!(99),
            close: dec!(102),
            volume: 10,
            tick_count: 3,
        };
        assert!(!bar.is_valid());
    }

    #[test]
    fn test_bars_since_helpers() {
        let mut c = SetupCandidate::new(
            "NQ",
            Utc::now(),
            dec!(15300),
            dec!(15200),
            None,
            Utc::now(),
            dec!(15350),
        );
        c.consol_candles.push(Bar::flat("NQ", Utc::now(), dec!(15300)));
        c.candles_processed = 5;
        assert_eq!(c.bars_since_consolidation(), 4);
        assert_eq!(c.bars_since_liq2(), 3);
    }
}
