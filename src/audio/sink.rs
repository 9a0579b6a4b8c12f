//! Output sink for paced frames
//!
//! The playback buffer writes `(frame, is_final)` pairs in strict frame
//! order, synthesized silence included. [`FrameQueue`] is the lock-free
//! hand-off to whatever decodes and renders the audio.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::queue::SegQueue;

/// One frame handed to the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFrame {
    pub data: Bytes,
    pub is_final: bool,
}

/// Receives frames in strictly increasing frame-number order
pub trait FrameSink: Send {
    fn write(&mut self, data: Bytes, is_final: bool);
}

impl FrameSink for Vec<OutputFrame> {
    fn write(&mut self, data: Bytes, is_final: bool) {
        self.push(OutputFrame { data, is_final });
    }
}

/// Shared lock-free frame queue
#[derive(Clone, Default)]
pub struct FrameQueue {
    queue: Arc<SegQueue<OutputFrame>>,
    finished: Arc<AtomicBool>,
    written: Arc<AtomicU64>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<OutputFrame> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// A frame marked final has been written
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn frames_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

impl FrameSink for FrameQueue {
    fn write(&mut self, data: Bytes, is_final: bool) {
        self.queue.push(OutputFrame { data, is_final });
        self.written.fetch_add(1, Ordering::Relaxed);
        if is_final {
            self.finished.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_queue_shared_between_clones() {
        let queue = FrameQueue::new();
        let mut writer = queue.clone();

        writer.write(Bytes::from_static(b"a"), false);
        writer.write(Bytes::from_static(b"b"), true);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.frames_written(), 2);
        assert!(queue.is_finished());
        assert_eq!(queue.pop().unwrap().data, Bytes::from_static(b"a"));
        let last = queue.pop().unwrap();
        assert!(last.is_final);
        assert!(queue.is_empty());
    }
}
