/// Centralized error types for the ingestion and pattern-detection core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TradingError {
    // Data Errors
    #[error("Data gap detected: {0}")]
    DataGap(String),

    #[error("Invalid bar data: {0}")]
    InvalidBarData(String),

    #[error("Invalid tick data: {0}")]
    InvalidTickData(String),

    #[error("Missing data: {0}")]
    MissingData(String),

    #[error("Deserialization failed: {0}")]
    DeserializationError(#[from] serde_json::Error),

    // TickBuffer Errors
    #[error("Tick buffer full, dropped tick: {0}")]
    BufferOverflow(String),

    // SetupTracker Errors
    #[error("Setup invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Setup candidate not found: {0}")]
    CandidateNotFound(String),

    // Order / external collaborator errors
    #[error("Order placement failed: {0}")]
    OrderPlacementFailed(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Broker API error: {code} - {message}")]
    BrokerApiError { code: String, message: String },

    #[error("Position mismatch detected: {0}")]
    PositionMismatch(String),

    // Network / transient I/O errors (drive the circuit breaker)
    #[error("Network timeout: {0}")]
    NetworkTimeout(String),

    #[error("Feed disconnected: {0}")]
    FeedDisconnected(String),

    #[error("Circuit breaker tripped: {0}")]
    CircuitBreakerTripped(String),

    #[error("System is in safe mode, rejecting operation: {0}")]
    SafeModeActive(String),

    // Persistence Errors
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("State recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // File I/O Errors
    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    // Market Session Errors
    #[error("Market closed: {0}")]
    MarketClosed(String),

    #[error("Non-trading day: {0}")]
    NonTradingDay(String),

    // System Errors
    #[error("System shutdown: {0}")]
    SystemShutdown(String),

    #[error("Fatal error: {0}")]
    FatalError(String),

    // Event Bus Errors
    #[error("Event dispatch failed: {0}")]
    EventDispatchFailed(String),

    #[error("Event handler error: {0}")]
    EventHandlerError(String),

    // Generic Errors
    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TradingError>;

impl TradingError {
    /// Check if error is recoverable without operator intervention
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TradingError::NetworkTimeout(_)
                | TradingError::FeedDisconnected(_)
                | TradingError::DataGap(_)
                | TradingError::OrderPlacementFailed(_)
                | TradingError::BufferOverflow(_)
        )
    }

    /// Check if error requires immediate system shutdown
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TradingError::FatalError(_)
                | TradingError::SystemShutdown(_)
                | TradingError::InvariantViolation(_)
        )
    }

    /// Check if error should trip the circuit breaker / enter safe mode
    pub fn is_transient_io(&self) -> bool {
        matches!(
            self,
            TradingError::NetworkTimeout(_)
                | TradingError::FeedDisconnected(_)
                | TradingError::DatabaseError(_)
                | TradingError::PersistenceFailure(_)
        )
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            TradingError::DataGap(_) => "DATA_001",
            TradingError::InvalidBarData(_) => "DATA_002",
            TradingError::InvalidTickData(_) => "DATA_003",
            TradingError::MissingData(_) => "DATA_004",
            TradingError::DeserializationError(_) => "DATA_005",
            TradingError::BufferOverflow(_) => "BUF_001",
            TradingError::InvariantViolation(_) => "SETUP_001",
            TradingError::CandidateNotFound(_) => "SETUP_002",
            TradingError::OrderPlacementFailed(_) => "ORDER_001",
            TradingError::OrderRejected(_) => "ORDER_002",
            TradingError::BrokerApiError { .. } => "BROKER_001",
            TradingError::PositionMismatch(_) => "BROKER_002",
            TradingError::NetworkTimeout(_) => "NET_001",
            TradingError::FeedDisconnected(_) => "NET_002",
            TradingError::CircuitBreakerTripped(_) => "NET_003",
            TradingError::SafeModeActive(_) => "NET_004",
            TradingError::PersistenceFailure(_) => "STORE_001",
            TradingError::RecoveryFailed(_) => "STORE_002",
            TradingError::DatabaseError(_) => "STORE_003",
            TradingError::ConfigError(_) => "CFG_001",
            TradingError::InvalidParameter(_) => "CFG_002",
            TradingError::FileError(_) => "FILE_001",
            TradingError::MarketClosed(_) => "MKT_001",
            TradingError::NonTradingDay(_) => "MKT_002",
            TradingError::SystemShutdown(_) => "SYS_001",
            TradingError::FatalError(_) => "SYS_002",
            TradingError::EventDispatchFailed(_) => "EVENT_001",
            TradingError::EventHandlerError(_) => "EVENT_002",
            TradingError::InternalError(_) => "INT_001",
            TradingError::Other(_) => "GEN_001",
        }
    }
}
