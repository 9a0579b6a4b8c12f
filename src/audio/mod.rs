//! Audio subsystem: jitter buffer and output sink

pub mod buffer;
pub mod sink;

pub use buffer::{IngestOutcome, PlaybackBuffer, PlaybackStats, PlaybackStatus};
pub use sink::{FrameQueue, FrameSink, OutputFrame};
