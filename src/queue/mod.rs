//! Multi-stream scheduling: fetch everything, play one at a time

pub mod manager;

pub use manager::{PlaybackQueue, SinkFactory};
