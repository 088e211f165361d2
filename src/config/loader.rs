/// Configuration loading from TOML file.
use std::path::Path;

use crate::config::Config;
use crate::error::{Result, TradingError};

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| TradingError::ConfigError(format!("failed to read config file: {}", e)))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| TradingError::ConfigError(format!("failed to parse config: {}", e)))?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_config(config: &Config) -> Result<()> {
    let st = &config.setup_tracker;

    if st.symbol.is_empty() {
        return Err(TradingError::ConfigError("setup_tracker.symbol is empty".to_string()));
    }

    if st.consol_min_duration == 0 || st.consol_min_duration > st.consol_max_duration {
        return Err(TradingError::ConfigError(format!(
            "consol_min_duration ({}) must be > 0 and <= consol_max_duration ({})",
            st.consol_min_duration, st.consol_max_duration
        )));
    }

    if !(0.0..=1.0).contains(&st.consol_min_quality) {
        return Err(TradingError::ConfigError(format!(
            "invalid consol_min_quality: {}",
            st.consol_min_quality
        )));
    }

    if st.atr_period < 2 {
        return Err(TradingError::ConfigError("atr_period must be >= 2".to_string()));
    }

    if st.nowick_body_low_percentile >= st.nowick_body_high_percentile {
        return Err(TradingError::ConfigError(
            "nowick_body_low_percentile must be < nowick_body_high_percentile".to_string(),
        ));
    }

    if config.tick_buffer.capacity == 0 {
        return Err(TradingError::ConfigError("tick_buffer.capacity must be > 0".to_string()));
    }

    if config.bar_aggregator.gap_fill_threshold_seconds < 0 {
        return Err(TradingError::ConfigError(
            "bar_aggregator.gap_fill_threshold_seconds must be >= 0".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        let config = Config::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_consol_bounds() {
        let mut config = Config::default();
        config.setup_tracker.consol_min_duration = 40;
        config.setup_tracker.consol_max_duration = 30;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_percentiles() {
        let mut config = Config::default();
        config.setup_tracker.nowick_body_low_percentile = 80.0;
        config.setup_tracker.nowick_body_high_percentile = 70.0;
        assert!(validate_config(&config).is_err());
    }
}
