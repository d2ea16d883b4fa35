//! Input shaping between the device and the rest of the bridge: burst
//! deduplication for chatty notification sources and trailing-debounce
//! batching for ambient speech.

mod batcher;
mod dedup;

pub use batcher::{BatcherConfig, InputBatcher};
pub use dedup::{DedupConfig, NotificationDedup, NotificationFlush};
