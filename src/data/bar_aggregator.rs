/// Per-symbol minute-aligned OHLCV aggregation with short-gap fill.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::config::BarAggregatorConfig;
use crate::types::{Bar, Tick};

fn floor_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0).unwrap().with_nanosecond(0).unwrap()
}

#[derive(Debug, Clone)]
struct ActiveBar {
    minute_start: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: i64,
    tick_count: u32,
}

impl ActiveBar {
    fn new(minute_start: DateTime<Utc>, price: Decimal, size: i64) -> Self {
        ActiveBar {
            minute_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: size.max(0),
            tick_count: 1,
        }
    }

    fn update(&mut self, price: Decimal, size: i64) {
        self.close = price;
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.volume += size.max(0);
        self.tick_count += 1;
    }

    fn to_bar(&self, symbol: &str) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            minute_start: self.minute_start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            tick_count: self.tick_count,
        }
    }
}

pub type BarSubscriber = Arc<dyn Fn(Bar) + Send + Sync>;

/// Accumulates ticks for one symbol into completed minute bars, synthesizing
/// flat bars across gaps up to a configured threshold.
pub struct BarAggregator {
    symbol: String,
    config: BarAggregatorConfig,
    active: RwLock<Option<ActiveBar>>,
    subscribers: RwLock<Vec<BarSubscriber>>,
    last_tick_time: RwLock<Option<DateTime<Utc>>>,
}

impl BarAggregator {
    pub fn new(symbol: impl Into<String>, config: BarAggregatorConfig) -> Self {
        BarAggregator {
            symbol: symbol.into(),
            config,
            active: RwLock::new(None),
            subscribers: RwLock::new(Vec::new()),
            last_tick_time: RwLock::new(None),
        }
    }

    pub async fn subscribe(&self, subscriber: BarSubscriber) {
        self.subscribers.write().await.push(subscriber);
    }

    /// Notify every subscriber of a completed bar. A subscriber panic/fault
    /// is isolated from the aggregator's own state: it never corrupts the
    /// active bar being built.
    async fn emit(&self, bar: Bar) {
        let subscribers = self.subscribers.read().await;
        for subscriber in subscribers.iter() {
            let subscriber = Arc::clone(subscriber);
            let bar_clone = bar.clone();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| subscriber(bar_clone)));
            if result.is_err() {
                error!(symbol = %self.symbol, "bar subscriber panicked, continuing");
            }
        }
    }

    pub async fn process_tick(&self, tick: &Tick) {
        let minute = floor_to_minute(tick.timestamp);
        let mut active = self.active.write().await;

        match active.as_mut() {
            None => {
                *active = Some(ActiveBar::new(minute, tick.price, tick.size));
                debug!(symbol = %self.symbol, %minute, "opened first bar");
            }
            Some(bar) if minute == bar.minute_start => {
                bar.update(tick.price, tick.size);
            }
            Some(bar) if minute < bar.minute_start => {
                // Out-of-order tick for an already-closed or future minute; the
                // aggregator only accepts ticks into the currently active minute.
                warn!(symbol = %self.symbol, tick_minute = %minute, active_minute = %bar.minute_start, "dropping out-of-order tick");
            }
            Some(bar) => {
                let completed = bar.to_bar(&self.symbol);
                let prev_minute = bar.minute_start;
                let prev_close = bar.close;
                drop(active);
                self.emit(completed).await;

                if self.config.gap_fill_enabled {
                    self.fill_gap(prev_minute, minute, prev_close).await;
                }

                let mut active = self.active.write().await;
                *active = Some(ActiveBar::new(minute, tick.price, tick.size));
                return self.record_tick_time(tick.timestamp).await;
            }
        }
        drop(active);
        self.record_tick_time(tick.timestamp).await;
    }

    async fn record_tick_time(&self, t: DateTime<Utc>) {
        *self.last_tick_time.write().await = Some(t);
    }

    /// Synthesize flat bars for each whole minute strictly between
    /// `prev_minute` and `next_minute`, provided the span does not exceed the
    /// configured gap threshold (a fill is emitted iff `gap_seconds <=
    /// gap_fill_threshold_seconds`, matching `candle_aggregator.py`'s
    /// `time_diff <= gap_threshold_seconds` check).
    async fn fill_gap(&self, prev_minute: DateTime<Utc>, next_minute: DateTime<Utc>, prev_close: Decimal) {
        let gap_seconds = (next_minute - prev_minute).num_seconds();
        if gap_seconds <= 60 {
            return;
        }
        if gap_seconds > self.config.gap_fill_threshold_seconds {
            warn!(symbol = %self.symbol, gap_seconds, "gap exceeds threshold, no fill emitted");
            return;
        }

        let mut minute = prev_minute + Duration::minutes(1);
        while minute < next_minute {
            let flat = Bar::flat(&self.symbol, minute, prev_close);
            self.emit(flat).await;
            minute += Duration::minutes(1);
        }
    }

    /// Force-emit the in-progress bar even though the next minute has not arrived.
    pub async fn force_flush(&self) {
        let mut active = self.active.write().await;
        if let Some(bar) = active.take() {
            let completed = bar.to_bar(&self.symbol);
            drop(active);
            self.emit(completed).await;
        }
    }

    pub async fn current_bar(&self) -> Option<Bar> {
        self.active.read().await.as_ref().map(|b| b.to_bar(&self.symbol))
    }

    pub async fn has_data_gap(&self, threshold_seconds: i64) -> bool {
        match *self.last_tick_time.read().await {
            Some(last) => (Utc::now() - last).num_seconds() > threshold_seconds,
            None => true,
        }
    }
}

/// One [`BarAggregator`] per symbol.
pub struct MultiBarAggregator {
    config: BarAggregatorConfig,
    aggregators: RwLock<HashMap<String, Arc<BarAggregator>>>,
}

impl MultiBarAggregator {
    pub fn new(config: BarAggregatorConfig) -> Self {
        MultiBarAggregator {
            config,
            aggregators: RwLock::new(HashMap::new()),
        }
    }

    async fn aggregator_for(&self, symbol: &str) -> Arc<BarAggregator> {
        if let Some(agg) = self.aggregators.read().await.get(symbol) {
            return Arc::clone(agg);
        }
        let mut aggregators = self.aggregators.write().await;
        Arc::clone(
            aggregators
                .entry(symbol.to_string())
                .or_insert_with(|| Arc::new(BarAggregator::new(symbol, self.config.clone()))),
        )
    }

    pub async fn process_tick(&self, tick: &Tick) {
        let aggregator = self.aggregator_for(&tick.symbol).await;
        aggregator.process_tick(tick).await;
    }

    pub async fn subscribe(&self, symbol: &str, subscriber: BarSubscriber) {
        let aggregator = self.aggregator_for(symbol).await;
        aggregator.subscribe(subscriber).await;
    }

    pub async fn force_flush_all(&self) {
        let aggregators = self.aggregators.read().await;
        for aggregator in aggregators.values() {
            aggregator.force_flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn tick_at(symbol: &str, ts: DateTime<Utc>, price: Decimal) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            price,
            size: 1,
            timestamp: ts,
            exchange: "CME".to_string(),
        }
    }

    #[tokio::test]
    async fn test_floor_to_minute() {
        let t = Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 37).unwrap();
        assert_eq!(floor_to_minute(t), Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).unwrap());
    }

    #[tokio::test]
    async fn test_single_minute_aggregation() {
        let agg = BarAggregator::new("NQ", BarAggregatorConfig::default());
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).unwrap();
        agg.process_tick(&tick_at("NQ", t0, dec!(100))).await;
        agg.process_tick(&tick_at("NQ", t0 + Duration::seconds(10), dec!(105))).await;
        agg.process_tick(&tick_at("NQ", t0 + Duration::seconds(20), dec!(98))).await;

        let bar = agg.current_bar().await.unwrap();
        assert_eq!(bar.open, dec!(100));
        assert_eq!(bar.high, dec!(105));
        assert_eq!(bar.low, dec!(98));
        assert_eq!(bar.close, dec!(98));
        assert_eq!(bar.volume, 3);
    }

    #[tokio::test]
    async fn test_minute_rollover_emits_completed_bar() {
        let agg = BarAggregator::new("NQ", BarAggregatorConfig::default());
        let emitted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let emitted_clone = Arc::clone(&emitted);
        agg.subscribe(Arc::new(move |bar: Bar| {
            emitted_clone.lock().unwrap().push(bar);
        }))
        .await;

        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).unwrap();
        agg.process_tick(&tick_at("NQ", t0, dec!(100))).await;
        agg.process_tick(&tick_at("NQ", t0 + Duration::minutes(1), dec!(101))).await;

        let bars = emitted.lock().unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].minute_start, t0);
        assert_eq!(bars[0].close, dec!(100));
    }

    #[tokio::test]
    async fn test_gap_fill_within_threshold() {
        let agg = BarAggregator::new("NQ", BarAggregatorConfig::default());
        let emitted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let emitted_clone = Arc::clone(&emitted);
        agg.subscribe(Arc::new(move |bar: Bar| {
            emitted_clone.lock().unwrap().push(bar);
        }))
        .await;

        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).unwrap();
        agg.process_tick(&tick_at("NQ", t0, dec!(100))).await;
        // Gap of 2 minutes, well under the default 120s fill threshold.
        agg.process_tick(&tick_at("NQ", t0 + Duration::minutes(2), dec!(110))).await;

        let bars = emitted.lock().unwrap();
        // original bar + 1 synthesized flat bar for the skipped minute
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].open, dec!(100));
        assert_eq!(bars[1].volume, 0);
    }

    #[tokio::test]
    async fn test_gap_three_minutes_apart_at_default_threshold_emits_no_fill() {
        // At the default 120s gap_fill_threshold_seconds, only a single
        // missing minute (2 minutes apart) is filled; a gap 3 minutes apart
        // (180s) exceeds the threshold and is left unfilled.
        let agg = BarAggregator::new("NQ", BarAggregatorConfig::default());
        let emitted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let emitted_clone = Arc::clone(&emitted);
        agg.subscribe(Arc::new(move |bar: Bar| {
            emitted_clone.lock().unwrap().push(bar);
        }))
        .await;

        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).unwrap();
        agg.process_tick(&tick_at("NQ", t0, dec!(100))).await;
        agg.process_tick(&tick_at("NQ", t0 + Duration::minutes(3), dec!(110))).await;

        let bars = emitted.lock().unwrap();
        // Only the original completed bar, no gap fill since 180s > 120s.
        assert_eq!(bars.len(), 1);
    }

    #[tokio::test]
    async fn test_gap_beyond_threshold_emits_no_fill() {
        let mut config = BarAggregatorConfig::default();
        config.gap_fill_threshold_seconds = 60;
        let agg = BarAggregator::new("NQ", config);
        let emitted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let emitted_clone = Arc::clone(&emitted);
        agg.subscribe(Arc::new(move |bar: Bar| {
            emitted_clone.lock().unwrap().push(bar);
        }))
        .await;

        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).unwrap();
        agg.process_tick(&tick_at("NQ", t0, dec!(100))).await;
        agg.process_tick(&tick_at("NQ", t0 + Duration::minutes(5), dec!(110))).await;

        let bars = emitted.lock().unwrap();
        // Only the original completed bar, no gap fill since it exceeds threshold.
        assert_eq!(bars.len(), 1);
    }
}
