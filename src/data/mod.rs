pub mod bar_aggregator;
pub mod bar_store;
pub mod tick_buffer;

pub use bar_aggregator::{BarAggregator, BarSubscriber, MultiBarAggregator};
pub use bar_store::BarStore;
pub use tick_buffer::{OverflowCallback, TickBuffer, TickBufferStats};
