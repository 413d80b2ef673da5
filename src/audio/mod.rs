//! Audio subsystem module

pub mod buffer;

pub use buffer::{AudioBlock, AudioQueuePair, BlockConsumer, BlockProducer, QueueStats};
