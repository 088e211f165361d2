/// Configuration types for every tunable component of the core.
pub mod loader;

pub use loader::load_config;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TickBufferConfig {
    pub capacity: usize,
    pub ttl_seconds: u64,
    pub auto_flush_interval_seconds: u64,
}

impl Default for TickBufferConfig {
    fn default() -> Self {
        TickBufferConfig {
            capacity: 10_000,
            ttl_seconds: 60,
            auto_flush_interval_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BarAggregatorConfig {
    pub gap_fill_enabled: bool,
    pub gap_fill_threshold_seconds: i64,
}

impl Default for BarAggregatorConfig {
    fn default() -> Self {
        BarAggregatorConfig {
            gap_fill_enabled: true,
            gap_fill_threshold_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupTrackerConfig {
    pub symbol: String,
    pub consol_min_duration: u32,
    pub consol_max_duration: u32,
    pub consol_min_quality: f64,
    pub atr_period: usize,
    pub atr_multiplier_max: f64,
    pub nowick_upper_wick_percentile: f64,
    pub nowick_body_low_percentile: f64,
    pub nowick_body_high_percentile: f64,
    pub max_entry_wait_candles: u32,
    pub max_retracement_pips: Decimal,
    pub sl_buffer: Decimal,
    pub tp_buffer: Decimal,
    pub liq1_dedup_window_minutes: i64,
    pub range_normalization_factor: f64,
}

impl Default for SetupTrackerConfig {
    fn default() -> Self {
        SetupTrackerConfig {
            symbol: "NQ".to_string(),
            consol_min_duration: 15,
            consol_max_duration: 30,
            consol_min_quality: 0.4,
            atr_period: 14,
            atr_multiplier_max: 3.0,
            nowick_upper_wick_percentile: 90.0,
            nowick_body_low_percentile: 30.0,
            nowick_body_high_percentile: 70.0,
            max_entry_wait_candles: 20,
            max_retracement_pips: Decimal::new(1000, 1), // 100.0
            sl_buffer: Decimal::new(10, 1), // 1.0
            tp_buffer: Decimal::new(10, 1), // 1.0
            liq1_dedup_window_minutes: 5,
            range_normalization_factor: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateStoreConfig {
    pub sqlite_path: String,
    pub write_timeout_seconds: u64,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        StateStoreConfig {
            sqlite_path: "data/slob_state.db".to_string(),
            write_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub shutdown_timeout_seconds: u64,
    pub circuit_breaker_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            shutdown_timeout_seconds: 30,
            circuit_breaker_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tick_buffer: TickBufferConfig,
    #[serde(default)]
    pub bar_aggregator: BarAggregatorConfig,
    #[serde(default)]
    pub setup_tracker: SetupTrackerConfig,
    #[serde(default)]
    pub state_store: StateStoreConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}
