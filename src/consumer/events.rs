//! Progress events emitted by a stream consumer

use std::fmt;

use crossbeam_channel::Sender;

/// Small integer id assigned to a stream when it is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Per-stream progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Initialized,
    /// Consumer closed: playback finished or explicitly closed
    BufferingComplete,
    FramePlayed(u64),
    FrameSkipped(u64),
    FinalFrameNumLearned(u64),
    DataReceived(u64),
    NackReceived(u64),
    InterestSkipped(u64),
    InterestTimeout(u64),
    ProductionWindowGrow(u64),
    FinalBlockLearned(u64),
    FetchComplete,
}

/// Event tagged with the stream it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerEvent {
    pub stream: StreamId,
    pub event: StreamEvent,
}

/// Cloneable handle used by the fetcher and the buffer to publish events
#[derive(Debug, Clone)]
pub struct EventEmitter {
    stream: StreamId,
    tx: Option<Sender<ConsumerEvent>>,
}

impl EventEmitter {
    pub fn new(stream: StreamId, tx: Sender<ConsumerEvent>) -> Self {
        Self {
            stream,
            tx: Some(tx),
        }
    }

    /// An emitter nobody listens to
    pub fn disabled(stream: StreamId) -> Self {
        Self { stream, tx: None }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn emit(&self, event: StreamEvent) {
        if let Some(tx) = &self.tx {
            // A listener that went away is not an error for the stream
            let _ = tx.send(ConsumerEvent {
                stream: self.stream,
                event,
            });
        }
    }
}
