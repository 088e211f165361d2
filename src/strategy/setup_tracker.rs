/// The 5/1 SLOB pattern state machine: LIQ#1 -> consolidation -> LIQ#2 ->
/// entry, tracked per symbol with multiple concurrent candidates.
///
/// Grounded on `original_source/slob/live/setup_tracker.py` and
/// `setup_state.py`: the incremental update order (append -> recompute
/// bounds -> timeout -> quality -> range -> no-wick -> freeze -> re-entry)
/// and the `candles_processed` bookkeeping that
/// [`SetupCandidate::bars_since_consolidation`]/`bars_since_liq2` rely on
/// are carried over unchanged.
///
/// `on_bar` is a plain synchronous function by design (see spec.md §5): it
/// must never suspend, which is what lets a whole bar's worth of state
/// transitions, invalidations and same-bar re-entries complete atomically
/// from the caller's point of view.
use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::calendar::SessionCalendar;
use crate::config::SetupTrackerConfig;
use crate::types::{Bar, InvalidationReason, SetupCandidate, SetupState};

/// Emitted by [`SetupTracker::on_bar`] for every candidate that reaches a
/// terminal state during that call.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    Completed(SetupCandidate),
    Invalidated(SetupCandidate, InvalidationReason),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SetupTrackerStats {
    pub bars_processed: u64,
    pub liq1_detected: u64,
    pub setups_completed: u64,
    pub setups_invalidated: u64,
}

enum Termination {
    Complete,
    Invalidated(InvalidationReason),
}

struct NoWick {
    time: DateTime<Utc>,
    high: Decimal,
    low: Decimal,
    wick_ratio: f64,
}

pub struct SetupTracker {
    config: SetupTrackerConfig,
    calendar: Arc<dyn SessionCalendar>,

    current_date: Option<NaiveDate>,
    lse_high: Option<Decimal>,
    lse_low: Option<Decimal>,
    lse_close_time: Option<DateTime<Utc>>,

    atr_window: VecDeque<Bar>,
    atr_value: Option<f64>,

    /// Ordered (insertion-order) collection of live candidates. A `Vec`
    /// rather than a map: spec.md §4.3 calls the tracker state "an ordered
    /// collection of active candidates", and ordered iteration is what
    /// keeps replay byte-identical across runs.
    active: Vec<SetupCandidate>,
    completed: Vec<SetupCandidate>,
    invalidated: Vec<SetupCandidate>,

    stats: SetupTrackerStats,
}

impl SetupTracker {
    pub fn new(config: SetupTrackerConfig, calendar: Arc<dyn SessionCalendar>) -> Self {
        let atr_period = config.atr_period;
        SetupTracker {
            config,
            calendar,
            current_date: None,
            lse_high: None,
            lse_low: None,
            lse_close_time: None,
            atr_window: VecDeque::with_capacity(atr_period + 1),
            atr_value: None,
            active: Vec::new(),
            completed: Vec::new(),
            invalidated: Vec::new(),
            stats: SetupTrackerStats::default(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.config.symbol
    }

    pub fn stats(&self) -> SetupTrackerStats {
        self.stats
    }

    pub fn active_candidates(&self) -> &[SetupCandidate] {
        &self.active
    }

    pub fn completed_setups(&self) -> &[SetupCandidate] {
        &self.completed
    }

    pub fn invalidated_setups(&self) -> &[SetupCandidate] {
        &self.invalidated
    }

    pub fn atr(&self) -> Option<f64> {
        self.atr_value
    }

    /// Re-insert a candidate recovered from the cold store (its
    /// `consol_candles` comes back empty; see spec.md §4.4). Used only at
    /// startup, before any live bar has been processed for this symbol.
    pub fn restore_active(&mut self, candidate: SetupCandidate) {
        self.active.push(candidate);
    }

    /// Process one completed bar for this tracker's symbol. Never suspends.
    pub fn on_bar(&mut self, bar: &Bar) -> Vec<TrackerEvent> {
        self.stats.bars_processed += 1;
        self.update_atr(bar);

        let mut events = Vec::new();
        let bar_date = bar.minute_start.date_naive();
        if self.current_date != Some(bar_date) {
            events.extend(self.start_new_day(bar_date, bar.minute_start));
        }

        if self.calendar.is_lse_session(bar.minute_start) {
            self.update_lse_levels(bar);
            return events;
        }

        if !self.calendar.is_nyse_session(bar.minute_start) {
            return events;
        }

        if self.lse_high.is_none() || self.lse_low.is_none() {
            return events;
        }

        if self.check_liq1(bar) {
            let candidate = self.create_candidate(bar);
            self.stats.liq1_detected += 1;
            self.active.push(candidate);
        }

        let mut terminated: Vec<(usize, SetupCandidate, Termination)> = Vec::new();
        for i in 0..self.active.len() {
            let candidate = &mut self.active[i];
            // The candle that created this candidate is not itself a
            // consolidation member; skip it for this candidate only.
            if candidate.liq1_time == bar.minute_start {
                continue;
            }
            candidate.candles_processed += 1;
            candidate.last_updated = bar.minute_start;

            let outcome = match candidate.state {
                SetupState::WatchingConsol => {
                    step_watching_consol(&self.config, self.atr_value, candidate, bar)
                }
                SetupState::WatchingLiq2 => step_watching_liq2(&self.config, candidate, bar),
                SetupState::WaitingEntry => step_waiting_entry(&self.config, candidate, bar),
                SetupState::WatchingLiq1 | SetupState::Complete | SetupState::Invalidated => None,
            };

            if let Some(outcome) = outcome {
                terminated.push((i, candidate.clone(), outcome));
            }
        }

        // Emit in the order candidates were encountered, archive, then
        // remove from `active` highest-index-first so earlier indices stay
        // valid (see Design Notes §9 on guarding against concurrent
        // modification during iteration).
        for (_, candidate, outcome) in &terminated {
            events.push(match outcome {
                Termination::Complete => TrackerEvent::Completed(candidate.clone()),
                Termination::Invalidated(reason) => {
                    TrackerEvent::Invalidated(candidate.clone(), *reason)
                }
            });
        }
        for (_, candidate, outcome) in &terminated {
            match outcome {
                Termination::Complete => {
                    self.stats.setups_completed += 1;
                    self.completed.push(candidate.clone());
                }
                Termination::Invalidated(_) => {
                    self.stats.setups_invalidated += 1;
                    self.invalidated.push(candidate.clone());
                }
            }
        }
        for (i, _, _) in terminated.iter().rev() {
            self.active.remove(*i);
        }

        events
    }

    fn start_new_day(&mut self, date: NaiveDate, bar_time: DateTime<Utc>) -> Vec<TrackerEvent> {
        let mut events = Vec::new();
        if self.current_date.is_some() {
            for mut candidate in self.active.drain(..) {
                candidate.state = SetupState::Invalidated;
                candidate.invalidation_reason = Some(InvalidationReason::MarketClosed);
                candidate.invalidation_time = Some(bar_time);
                candidate.last_updated = bar_time;
                events.push(TrackerEvent::Invalidated(
                    candidate.clone(),
                    InvalidationReason::MarketClosed,
                ));
                self.stats.setups_invalidated += 1;
                self.invalidated.push(candidate);
            }
        }
        self.current_date = Some(date);
        self.lse_high = None;
        self.lse_low = None;
        self.lse_close_time = None;
        events
    }

    fn update_lse_levels(&mut self, bar: &Bar) {
        self.lse_high = Some(match self.lse_high {
            Some(h) => h.max(bar.high),
            None => bar.high,
        });
        self.lse_low = Some(match self.lse_low {
            Some(l) => l.min(bar.low),
            None => bar.low,
        });
        self.lse_close_time = Some(bar.minute_start);
    }

    fn update_atr(&mut self, bar: &Bar) {
        self.atr_window.push_back(bar.clone());
        while self.atr_window.len() > self.config.atr_period + 1 {
            self.atr_window.pop_front();
        }
        if self.atr_window.len() == self.config.atr_period + 1 {
            let bars: Vec<&Bar> = self.atr_window.iter().collect();
            let true_ranges: Vec<Decimal> = bars
                .windows(2)
                .map(|w| {
                    let (prev, curr) = (w[0], w[1]);
                    (curr.high - curr.low)
                        .max((curr.high - prev.close).abs())
                        .max((curr.low - prev.close).abs())
                })
                .collect();
            let sum: Decimal = true_ranges.iter().sum();
            let atr = sum / Decimal::from(true_ranges.len() as u32);
            self.atr_value = atr.to_f64();
        }
    }

    fn check_liq1(&self, bar: &Bar) -> bool {
        let lse_high = match self.lse_high {
            Some(h) => h,
            None => return false,
        };
        if bar.high <= lse_high {
            return false;
        }
        let dedup_window = Duration::minutes(self.config.liq1_dedup_window_minutes);
        !self.active.iter().any(|c| {
            c.state == SetupState::WatchingConsol && (bar.minute_start - c.liq1_time) < dedup_window
        })
    }

    fn create_candidate(&self, bar: &Bar) -> SetupCandidate {
        SetupCandidate::new(
            &self.config.symbol,
            bar.minute_start,
            self.lse_high.expect("lse_high established before LIQ#1"),
            self.lse_low.expect("lse_low established before LIQ#1"),
            self.lse_close_time,
            bar.minute_start,
            bar.high,
        )
    }
}

fn invalidate(
    candidate: &mut SetupCandidate,
    reason: InvalidationReason,
    at: DateTime<Utc>,
) -> Termination {
    candidate.state = SetupState::Invalidated;
    candidate.invalidation_reason = Some(reason);
    candidate.invalidation_time = Some(at);
    Termination::Invalidated(reason)
}

fn recompute_consol_bounds(candidate: &mut SetupCandidate) {
    match (
        candidate.consol_candles.iter().map(|b| b.high).max(),
        candidate.consol_candles.iter().map(|b| b.low).min(),
    ) {
        (Some(high), Some(low)) => {
            candidate.consol_high = high;
            candidate.consol_low = low;
            candidate.consol_range = high - low;
        }
        _ => {
            candidate.consol_high = Decimal::ZERO;
            candidate.consol_low = Decimal::ZERO;
            candidate.consol_range = Decimal::ZERO;
        }
    }
}

fn quality_score(consol_range: Decimal, atr: Option<f64>, range_normalization_factor: f64) -> f64 {
    let range = consol_range.to_f64().unwrap_or(0.0);
    match atr {
        Some(atr) if atr > 0.0 => (1.0 - range / (2.0 * atr)).max(0.0),
        _ => (1.0 - range / range_normalization_factor).max(0.0),
    }
}

/// Sorted-index percentile over a pre-sorted ascending slice. Small
/// consolidation windows (3-5 bars) make an online estimator unnecessary.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64) * (pct / 100.0)) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn find_nowick(candles: &[Bar], config: &SetupTrackerConfig) -> Option<NoWick> {
    if candles.len() < 3 {
        return None;
    }

    let mut upper_wicks: Vec<f64> = Vec::with_capacity(candles.len());
    let mut body_sizes: Vec<f64> = Vec::with_capacity(candles.len());
    for c in candles {
        let body = (c.close - c.open).abs().to_f64().unwrap_or(0.0);
        let upper_wick = (c.high - c.open.max(c.close)).to_f64().unwrap_or(0.0);
        body_sizes.push(body);
        upper_wicks.push(upper_wick);
    }

    let mut wicks_sorted = upper_wicks.clone();
    wicks_sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mut bodies_sorted = body_sizes.clone();
    bodies_sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let wick_threshold = percentile(&wicks_sorted, config.nowick_upper_wick_percentile);
    let body_min = percentile(&bodies_sorted, config.nowick_body_low_percentile);
    let body_max = percentile(&bodies_sorted, config.nowick_body_high_percentile);

    for c in candles {
        if c.close <= c.open {
            continue;
        }
        let body_size = (c.close - c.open).to_f64().unwrap_or(0.0);
        let upper_wick = (c.high - c.close).to_f64().unwrap_or(0.0);
        if upper_wick < wick_threshold && body_size >= body_min && body_size <= body_max {
            let wick_ratio = if body_size > 0.0 { upper_wick / body_size } else { 999.0 };
            return Some(NoWick {
                time: c.minute_start,
                high: c.high,
                low: c.low,
                wick_ratio,
            });
        }
    }
    None
}

fn step_watching_consol(
    config: &SetupTrackerConfig,
    atr: Option<f64>,
    candidate: &mut SetupCandidate,
    bar: &Bar,
) -> Option<Termination> {
    candidate.consol_candles.push(bar.clone());
    recompute_consol_bounds(candidate);

    if candidate.consol_candles.len() as u32 > config.consol_max_duration {
        return Some(invalidate(candidate, InvalidationReason::ConsolTimeout, bar.minute_start));
    }

    candidate.consol_quality_score =
        quality_score(candidate.consol_range, atr, config.range_normalization_factor);

    if (candidate.consol_candles.len() as u32) < config.consol_min_duration {
        return None;
    }

    if candidate.consol_quality_score < config.consol_min_quality {
        return Some(invalidate(candidate, InvalidationReason::ConsolQualityLow, bar.minute_start));
    }

    if let Some(atr_val) = atr {
        let max_range = atr_val * config.atr_multiplier_max;
        if candidate.consol_range.to_f64().unwrap_or(f64::MAX) > max_range {
            return Some(invalidate(
                candidate,
                InvalidationReason::ConsolRangeTooWide,
                bar.minute_start,
            ));
        }
    }

    let nowick = find_nowick(&candidate.consol_candles, config)?;
    candidate.nowick_time = Some(nowick.time);
    candidate.nowick_high = Some(nowick.high);
    candidate.nowick_low = Some(nowick.low);
    candidate.nowick_wick_ratio = Some(nowick.wick_ratio);

    // Freeze: the current bar may itself be the LIQ#2 breakout, so it must
    // not remain part of the range it would be compared against.
    candidate.consol_confirmed = true;
    candidate.consol_confirmed_time = Some(bar.minute_start);
    candidate.consol_candles.pop();
    recompute_consol_bounds(candidate);
    candidate.state = SetupState::WatchingLiq2;

    // Re-enter with the same bar: it may also be the LIQ#2 breakout.
    step_watching_liq2(config, candidate, bar)
}

fn step_watching_liq2(
    config: &SetupTrackerConfig,
    candidate: &mut SetupCandidate,
    bar: &Bar,
) -> Option<Termination> {
    if candidate.bars_since_consolidation() > config.max_entry_wait_candles {
        return Some(invalidate(candidate, InvalidationReason::Liq2Timeout, bar.minute_start));
    }

    let nowick_high = candidate.nowick_high.expect("nowick set before WatchingLiq2");
    if bar.high > nowick_high + config.max_retracement_pips {
        return Some(invalidate(
            candidate,
            InvalidationReason::RetracementExceeded,
            bar.minute_start,
        ));
    }

    if bar.high > candidate.consol_high {
        candidate.liq2_time = Some(bar.minute_start);
        candidate.liq2_price = Some(bar.high);
        candidate.spike_high = Some(bar.high);
        candidate.spike_high_time = Some(bar.minute_start);
        candidate.state = SetupState::WaitingEntry;
    }

    None
}

fn step_waiting_entry(
    config: &SetupTrackerConfig,
    candidate: &mut SetupCandidate,
    bar: &Bar,
) -> Option<Termination> {
    // Runs every bar in this state, independent of the entry test: the
    // stop-loss must reference the max high since LIQ#2, not LIQ#2 itself.
    let spike_high = candidate.spike_high.expect("spike_high set before WaitingEntry");
    if bar.high > spike_high {
        candidate.spike_high = Some(bar.high);
        candidate.spike_high_time = Some(bar.minute_start);
    }

    if candidate.bars_since_liq2() > config.max_entry_wait_candles {
        return Some(invalidate(candidate, InvalidationReason::EntryTimeout, bar.minute_start));
    }

    let nowick_low = candidate.nowick_low.expect("nowick set before WaitingEntry");
    if bar.close < nowick_low {
        candidate.entry_trigger_time = Some(bar.minute_start);
        candidate.entry_price = Some(bar.close);

        let spike_high = candidate.spike_high.unwrap();
        let sl = spike_high + config.sl_buffer;
        let tp = candidate.lse_low - config.tp_buffer;
        candidate.sl_price = Some(sl);
        candidate.tp_price = Some(tp);

        let risk = sl - bar.close;
        let reward = bar.close - tp;
        candidate.risk_reward_ratio = Some(if risk > Decimal::ZERO {
            (reward / risk).to_f64().unwrap_or(0.0)
        } else {
            0.0
        });

        candidate.state = SetupState::Complete;
        return Some(Termination::Complete);
    }

    None
}
