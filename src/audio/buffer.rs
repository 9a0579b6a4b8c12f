//! Jitter buffer with real-time playback pacing
//!
//! Frames arrive out of order from the fetcher and are held in a map keyed
//! by frame number. Once playback starts, frame `n` is due at
//!
//! ```text
//! deadline(n) = play_start + jitter_delay + n * frame_duration
//! ```
//!
//! Every elapsed deadline is resolved exactly once, in order: the frame is
//! played if it is buffered, otherwise a silent frame is written in its
//! place. Pacing is driven by the clock, never by the backlog.

use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::time::Instant;

use crate::audio::sink::FrameSink;
use crate::codec::{silent_frame, split_frames};
use crate::config::StreamTiming;
use crate::consumer::events::{EventEmitter, StreamEvent};

/// Result of one buffer tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    /// Playback has not been started
    Idle,
    Playing,
    /// The final frame's deadline passed and the stream was flushed
    Finished,
}

/// What ingesting one segment revealed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub frames: usize,
    /// The segment held fewer frames than a full one: it ends the stream
    pub terminal: bool,
}

/// How the end of the stream became known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// From a short terminal segment
    Exact { end_frame: u64 },
    /// From a final segment number, assuming that segment is full
    Estimated { end_frame: u64 },
}

impl StreamEnd {
    fn end_frame(self) -> u64 {
        match self {
            StreamEnd::Exact { end_frame } | StreamEnd::Estimated { end_frame } => end_frame,
        }
    }
}

/// Playback counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub frames_played: u64,
    pub frames_skipped: u64,
    /// Frames that arrived after their deadline was resolved
    pub late_frames: u64,
    pub duplicate_frames: u64,
    pub buffered: usize,
}

impl PlaybackStats {
    pub fn skip_rate(&self) -> f32 {
        let decided = self.frames_played + self.frames_skipped;
        if decided == 0 {
            0.0
        } else {
            self.frames_skipped as f32 / decided as f32
        }
    }
}

pub struct PlaybackBuffer {
    timing: StreamTiming,
    jitter_buffer: BTreeMap<u64, Bytes>,
    play_start: Option<Instant>,
    /// Next frame number to resolve
    next_frame: u64,
    next_deadline: Option<Instant>,
    end: Option<StreamEnd>,
    closed: bool,
    stats: PlaybackStats,
    events: EventEmitter,
}

impl PlaybackBuffer {
    pub fn new(timing: StreamTiming, events: EventEmitter) -> Self {
        tracing::debug!(
            "{}: playback buffer initialized (jitter delay {:?}, frame duration {:?})",
            events.stream(),
            timing.jitter_delay,
            timing.frame_duration()
        );
        Self {
            timing,
            jitter_buffer: BTreeMap::new(),
            play_start: None,
            next_frame: 0,
            next_deadline: None,
            end: None,
            closed: false,
            stats: PlaybackStats::default(),
            events,
        }
    }

    /// Record the playback start time; later calls are ignored
    pub fn start_playing(&mut self, now: Instant) {
        if self.play_start.is_none() {
            self.play_start = Some(now);
        }
    }

    pub fn play_start_time(&self) -> Option<Instant> {
        self.play_start
    }

    /// Deadline of `frame`, unknown until playback starts
    pub fn playback_deadline(&self, frame: u64) -> Option<Instant> {
        self.play_start?
            .checked_add(self.timing.jitter_delay)?
            .checked_add(self.timing.frame_offset(frame))
    }

    /// Exclusive upper bound of the stream's frame numbers, once known
    pub fn end_frame(&self) -> Option<u64> {
        self.end.map(StreamEnd::end_frame)
    }

    /// Deadline after which the whole stream has been resolved
    pub fn final_deadline(&self) -> Option<Instant> {
        let end = self.end_frame()?;
        self.playback_deadline(end.saturating_sub(1))
    }

    /// Split a segment payload into frames and buffer them
    pub fn ingest_segment(&mut self, segment: u64, payload: &Bytes) -> IngestOutcome {
        if self.closed {
            return IngestOutcome::default();
        }
        let frames = match split_frames(payload) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!(
                    "{}: dropping malformed segment {}: {}",
                    self.events.stream(),
                    segment,
                    e
                );
                return IngestOutcome::default();
            }
        };

        let per_segment = self.timing.frames_per_segment;
        let count = frames.len();
        let Some(first_frame) = segment
            .checked_mul(per_segment)
            .filter(|first| first.checked_add(count as u64).is_some())
        else {
            tracing::warn!(
                "{}: segment {} is out of frame number range",
                self.events.stream(),
                segment
            );
            return IngestOutcome::default();
        };
        for (offset, data) in frames.into_iter().enumerate() {
            self.insert_frame(first_frame + offset as u64, data);
        }

        let terminal = (count as u64) < per_segment;
        if terminal {
            self.learn_exact_end(first_frame + count as u64, segment);
        }
        IngestOutcome {
            frames: count,
            terminal,
        }
    }

    /// Final segment number learned by the fetcher
    ///
    /// Estimates the end assuming the final segment is full, unless the end
    /// is already known.
    pub fn receive_final_segment_num(&mut self, final_segment: u64) {
        if self.end.is_some() {
            return;
        }
        let Some(end_frame) = final_segment
            .checked_add(1)
            .and_then(|segments| segments.checked_mul(self.timing.frames_per_segment))
        else {
            tracing::warn!(
                "{}: final segment {} is out of frame number range, ignored",
                self.events.stream(),
                final_segment
            );
            return;
        };
        tracing::debug!(
            "{}: final segment {} gives estimated end frame {}",
            self.events.stream(),
            final_segment,
            end_frame
        );
        self.end = Some(StreamEnd::Estimated { end_frame });
    }

    fn learn_exact_end(&mut self, end_frame: u64, segment: u64) {
        if matches!(self.end, Some(StreamEnd::Exact { .. })) {
            return;
        }
        self.end = Some(StreamEnd::Exact { end_frame });
        if let Some(final_frame) = end_frame.checked_sub(1) {
            self.events.emit(StreamEvent::FinalFrameNumLearned(final_frame));
        }
        tracing::debug!(
            "{}: detected end of stream (final seg {}, end frame {})",
            self.events.stream(),
            segment,
            end_frame
        );
    }

    fn insert_frame(&mut self, frame: u64, data: Bytes) {
        if frame < self.next_frame {
            self.stats.late_frames += 1;
            tracing::debug!(
                "{}: frame {} arrived after its deadline",
                self.events.stream(),
                frame
            );
            return;
        }
        if self.jitter_buffer.contains_key(&frame) {
            self.stats.duplicate_frames += 1;
            return;
        }
        self.jitter_buffer.insert(frame, data);
    }

    /// Resolve every deadline that has elapsed by `now`
    pub fn tick(&mut self, now: Instant, sink: &mut dyn FrameSink) -> PlaybackStatus {
        if self.closed {
            return PlaybackStatus::Finished;
        }
        let Some(start) = self.play_start else {
            return PlaybackStatus::Idle;
        };
        let mut deadline = *self
            .next_deadline
            .get_or_insert(start + self.timing.jitter_delay);

        let final_deadline = self.final_deadline();
        let past_final = final_deadline.map_or(false, |d| now > d);

        while now > deadline {
            if self.end_frame().map_or(false, |end| self.next_frame >= end) {
                break;
            }
            self.resolve_next(sink, past_final);
            self.next_frame += 1;
            deadline += self.timing.frame_duration();
        }
        self.next_deadline = Some(deadline);

        if past_final {
            tracing::info!(
                "{}: finished playing all frames (end frame {:?}, played {}, skipped {})",
                self.events.stream(),
                self.end_frame(),
                self.stats.frames_played,
                self.stats.frames_skipped
            );
            sink.write(silent_frame(), true);
            self.close();
            return PlaybackStatus::Finished;
        }
        PlaybackStatus::Playing
    }

    fn resolve_next(&mut self, sink: &mut dyn FrameSink, is_final: bool) {
        let expected = self.next_frame;
        match self.jitter_buffer.first_key_value() {
            Some((&frame, _)) if frame == expected => {
                if let Some((_, data)) = self.jitter_buffer.pop_first() {
                    sink.write(data, is_final);
                }
                self.stats.frames_played += 1;
                self.events.emit(StreamEvent::FramePlayed(expected));
            }
            _ => {
                tracing::debug!(
                    "{}: frame {} missing at its deadline, playing silence",
                    self.events.stream(),
                    expected
                );
                sink.write(silent_frame(), is_final);
                self.stats.frames_skipped += 1;
                self.events.emit(StreamEvent::FrameSkipped(expected));
            }
        }
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.jitter_buffer.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Next frame number to be resolved
    pub fn next_frame(&self) -> u64 {
        self.next_frame
    }

    pub fn stats(&self) -> PlaybackStats {
        PlaybackStats {
            buffered: self.jitter_buffer.len(),
            ..self.stats.clone()
        }
    }
}
