//! Per-stream consumer: fetch and playback driven from one task

pub mod events;
pub mod stream_consumer;

pub use events::{ConsumerEvent, EventEmitter, StreamEvent, StreamId};
pub use stream_consumer::{ConsumerCommand, ConsumerStats, StreamConsumer, StreamConsumerHandle};
