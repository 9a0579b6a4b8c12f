//! Segment fetch scheduler for one stream
//!
//! New segments are requested at the producer's real-time cadence: segment
//! `n` becomes due once `n` segment durations have elapsed since fetching
//! started. Every request arms a retransmission timer at `now + RTO`; an
//! expired timer moves the segment to the retransmission queue, which is
//! drained (lowest segment first) before any new segment is requested.
//! Outstanding requests are capped by the congestion window.
//!
//! A request that could only arrive after the playback deadline of the
//! segment's first frame is skipped instead of sent.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use crate::audio::buffer::PlaybackBuffer;
use crate::config::{ConsumerConfig, StreamTiming};
use crate::constants::RTT_EXPECTED_SAMPLES;
use crate::consumer::events::{EventEmitter, StreamEvent};
use crate::network::cwnd::CongestionWindow;
use crate::network::rtt::{RttEstimator, RttEstimatorOptions};
use crate::network::transport::Transport;
use crate::protocol::{decode_nack, SegmentRequest, SegmentResponse, StreamInfo};

/// Result of one fetcher tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// Fetching has not been started
    Idle,
    Fetching,
    /// Every segment up to the final one is resolved
    Complete,
}

/// Fetch counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetcherStats {
    pub interests_transmitted: u64,
    pub interest_timeouts: u64,
    pub data_received: u64,
    /// Responses for segments already queued for retransmission
    pub premature_rtos: u64,
    pub interest_skips: u64,
    pub nacks: u64,
}

pub struct StreamFetcher {
    info: StreamInfo,
    timing: StreamTiming,
    default_lifetime: Duration,
    rtt: RttEstimator,
    cwnd: CongestionWindow,
    retransmission_queue: BTreeSet<u64>,
    /// Send time of first transmissions only
    send_times: HashMap<u64, Instant>,
    /// Armed retransmission timers; the map size is the outstanding count
    rto_timers: HashMap<u64, Instant>,
    satisfied: HashSet<u64>,
    highest_seg_sent: Option<u64>,
    final_block_id: Option<u64>,
    fetch_start: Option<Instant>,
    closed: bool,
    stats: FetcherStats,
    events: EventEmitter,
}

impl StreamFetcher {
    pub fn new(
        info: StreamInfo,
        timing: StreamTiming,
        config: &ConsumerConfig,
        events: EventEmitter,
    ) -> Self {
        let rtt = RttEstimator::new(RttEstimatorOptions::for_jitter_delay(
            timing.jitter_delay,
            config.min_rto(),
        ));
        tracing::debug!(
            "{}: fetcher initialized (max/initial rto {:?}, segment duration {:?})",
            events.stream(),
            rtt.options().max_rto,
            timing.segment_duration()
        );
        Self {
            info,
            timing,
            default_lifetime: config.default_interest_lifetime(),
            rtt,
            cwnd: CongestionWindow::new(config.max_cwnd),
            retransmission_queue: BTreeSet::new(),
            send_times: HashMap::new(),
            rto_timers: HashMap::new(),
            satisfied: HashSet::new(),
            highest_seg_sent: None,
            final_block_id: None,
            fetch_start: None,
            closed: false,
            stats: FetcherStats::default(),
            events,
        }
    }

    /// Record the fetch start time; later calls are ignored
    pub fn start(&mut self, now: Instant) {
        if self.fetch_start.is_none() {
            self.fetch_start = Some(now);
        }
    }

    pub fn is_started(&self) -> bool {
        self.fetch_start.is_some()
    }

    pub fn tick(
        &mut self,
        now: Instant,
        buffer: &PlaybackBuffer,
        transport: &mut dyn Transport,
    ) -> FetchStatus {
        if self.closed {
            return FetchStatus::Complete;
        }
        let Some(start) = self.fetch_start else {
            return FetchStatus::Idle;
        };

        while self.cwnd.admits(self.rto_timers.len()) {
            let Some(segment) = self.retransmission_queue.pop_first() else {
                break;
            };
            self.transmit(segment, true, now, buffer, transport);
        }

        while self.next_segment_due(start, now) && self.cwnd.admits(self.rto_timers.len()) {
            let segment = self.next_segment();
            self.highest_seg_sent = Some(segment);
            self.events.emit(StreamEvent::ProductionWindowGrow(segment));
            self.transmit(segment, false, now, buffer, transport);
        }

        if self.all_segments_resolved() {
            self.close();
            return FetchStatus::Complete;
        }
        FetchStatus::Fetching
    }

    fn next_segment(&self) -> u64 {
        self.highest_seg_sent.map_or(0, |highest| highest + 1)
    }

    fn next_segment_due(&self, start: Instant, now: Instant) -> bool {
        let next = self.next_segment();
        if self.final_block_id.map_or(false, |last| next > last) {
            return false;
        }
        let elapsed_ms = now.saturating_duration_since(start).as_millis() as u64;
        elapsed_ms / self.timing.segment_duration_ms >= next
    }

    fn all_segments_resolved(&self) -> bool {
        let Some(last) = self.final_block_id else {
            return false;
        };
        let sent_through_final = self.highest_seg_sent.map_or(false, |highest| highest >= last);
        sent_through_final && self.retransmission_queue.is_empty() && self.rto_timers.is_empty()
    }

    fn transmit(
        &mut self,
        segment: u64,
        is_retransmission: bool,
        now: Instant,
        buffer: &PlaybackBuffer,
        transport: &mut dyn Transport,
    ) {
        let first_frame = segment.checked_mul(self.timing.frames_per_segment);
        let deadline = first_frame.and_then(|frame| buffer.playback_deadline(frame));
        let avg_rtt = self.rtt.avg_rtt();

        if let (Some(first_frame), Some(deadline)) = (first_frame, deadline) {
            if now + avg_rtt > deadline {
                tracing::debug!(
                    "{}: interest skipped (seg {}, first frame {}, avg rtt {:?}, retx {})",
                    self.events.stream(),
                    segment,
                    first_frame,
                    avg_rtt,
                    is_retransmission
                );
                self.send_times.remove(&segment);
                self.stats.interest_skips += 1;
                self.events.emit(StreamEvent::InterestSkipped(segment));
                return;
            }
        }

        let lifetime = match deadline {
            Some(deadline) => deadline.saturating_duration_since(now),
            None => self.default_lifetime,
        };
        let rto = self.rtt.estimated_rto();
        self.rto_timers.insert(segment, now + rto);
        if is_retransmission {
            self.send_times.remove(&segment);
        } else {
            self.send_times.insert(segment, now);
        }

        let request = SegmentRequest::new(self.info.segment_name(segment), lifetime);
        if let Err(e) = transport.express_interest(request) {
            tracing::warn!(
                "{}: failed to send interest for seg {}: {}",
                self.events.stream(),
                segment,
                e
            );
        }
        self.stats.interests_transmitted += 1;
        tracing::debug!(
            "{}: interest transmitted (seg {}, rto {:?}, lifetime {:?}, retx {})",
            self.events.stream(),
            segment,
            rto,
            lifetime,
            is_retransmission
        );
    }

    /// Earliest armed retransmission timer
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        if self.closed {
            return None;
        }
        self.rto_timers.values().min().copied()
    }

    /// Move every segment whose timer expired by `now` to the retransmission queue
    pub fn fire_expired_timers(&mut self, now: Instant) -> usize {
        if self.closed {
            return 0;
        }
        let mut expired: Vec<u64> = self
            .rto_timers
            .iter()
            .filter(|(_, &at)| at <= now)
            .map(|(&segment, _)| segment)
            .collect();
        expired.sort_unstable();

        for &segment in &expired {
            self.rto_timers.remove(&segment);
            self.send_times.remove(&segment);
            self.retransmission_queue.insert(segment);
            self.stats.interest_timeouts += 1;
            self.events.emit(StreamEvent::InterestTimeout(segment));
            tracing::debug!("{}: rto timeout (seg {})", self.events.stream(), segment);
        }
        expired.len()
    }

    /// Handle one response delivered by the transport
    pub fn on_response(
        &mut self,
        response: &SegmentResponse,
        now: Instant,
        buffer: &mut PlaybackBuffer,
    ) {
        if self.closed {
            return;
        }
        let segment = match response.segment() {
            Ok(segment) => segment,
            Err(e) => {
                tracing::warn!(
                    "{}: dropping response with bad name {}: {}",
                    self.events.stream(),
                    response.name,
                    e
                );
                return;
            }
        };
        if !self.satisfied.insert(segment) {
            tracing::debug!("{}: duplicate response for seg {}", self.events.stream(), segment);
            return;
        }

        let premature_rto = self.retransmission_queue.contains(&segment);
        if premature_rto {
            self.stats.premature_rtos += 1;
        }

        if let Some(sent_at) = self.send_times.remove(&segment) {
            let sample = now.saturating_duration_since(sent_at);
            self.rtt.add_measurement(sample, RTT_EXPECTED_SAMPLES);
            tracing::debug!(
                "{}: rtt sample {:?}, rto now {:?}",
                self.events.stream(),
                sample,
                self.rtt.estimated_rto()
            );
        }

        if response.is_nack() {
            match decode_nack(&response.content) {
                Ok(final_segment) => {
                    self.learn_final_block(final_segment);
                    buffer.receive_final_segment_num(final_segment);
                }
                Err(e) => tracing::warn!(
                    "{}: malformed nack for seg {}: {}",
                    self.events.stream(),
                    segment,
                    e
                ),
            }
            self.stats.nacks += 1;
            self.events.emit(StreamEvent::NackReceived(segment));
        } else {
            let outcome = buffer.ingest_segment(segment, &response.content);
            if let Some(component) = &response.meta.final_block_id {
                match component.to_segment() {
                    Ok(final_segment) => {
                        self.learn_final_block(final_segment);
                        buffer.receive_final_segment_num(final_segment);
                    }
                    Err(e) => tracing::warn!(
                        "{}: bad final block id on seg {}: {}",
                        self.events.stream(),
                        segment,
                        e
                    ),
                }
            }
            if outcome.terminal {
                self.learn_final_block(segment);
            }
            self.stats.data_received += 1;
            self.events.emit(StreamEvent::DataReceived(segment));
        }

        tracing::debug!(
            "{}: receive data (seg {}, nack {}, premature rto {}, final block {:?})",
            self.events.stream(),
            segment,
            response.is_nack(),
            premature_rto,
            self.final_block_id
        );

        self.retransmission_queue.remove(&segment);
        self.rto_timers.remove(&segment);
    }

    fn learn_final_block(&mut self, final_segment: u64) {
        match self.final_block_id {
            None => {
                let in_range = final_segment
                    .checked_add(1)
                    .and_then(|segments| segments.checked_mul(self.timing.frames_per_segment))
                    .is_some();
                if !in_range {
                    tracing::warn!(
                        "{}: final block {} is out of frame number range, ignored",
                        self.events.stream(),
                        final_segment
                    );
                    return;
                }
                self.final_block_id = Some(final_segment);
                self.events.emit(StreamEvent::FinalBlockLearned(final_segment));
                self.retransmission_queue.retain(|&segment| segment <= final_segment);
                self.rto_timers.retain(|&segment, _| segment <= final_segment);
                self.send_times.retain(|&segment, _| segment <= final_segment);
            }
            Some(known) if known != final_segment => {
                tracing::warn!(
                    "{}: conflicting final block {} ignored (already {})",
                    self.events.stream(),
                    final_segment,
                    known
                );
            }
            Some(_) => {}
        }
    }

    pub fn final_block_id(&self) -> Option<u64> {
        self.final_block_id
    }

    /// Number of requests with an armed timer
    pub fn outstanding(&self) -> usize {
        self.rto_timers.len()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.retransmission_queue.clear();
        self.rto_timers.clear();
        self.send_times.clear();
        tracing::info!(
            "{}: fetch complete (final block {:?}, highest sent {:?}, transmitted {}, timeouts {}, data {}, premature rtos {}, skips {}, nacks {})",
            self.events.stream(),
            self.final_block_id,
            self.highest_seg_sent,
            self.stats.interests_transmitted,
            self.stats.interest_timeouts,
            self.stats.data_received,
            self.stats.premature_rtos,
            self.stats.interest_skips,
            self.stats.nacks
        );
        self.events.emit(StreamEvent::FetchComplete);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> FetcherStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::adts::test_frame;
    use crate::consumer::events::{ConsumerEvent, StreamId};
    use crate::error::TransportError;
    use crate::protocol::Name;
    use bytes::Bytes;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Vec<SegmentRequest>,
        fail: bool,
    }

    impl RecordingTransport {
        fn segments(&self) -> Vec<u64> {
            self.sent.iter().map(|r| r.segment().unwrap()).collect()
        }
    }

    impl Transport for RecordingTransport {
        fn express_interest(&mut self, request: SegmentRequest) -> Result<(), TransportError> {
            self.sent.push(request);
            if self.fail {
                return Err(TransportError::SendFailed("link down".into()));
            }
            Ok(())
        }

        fn close(&mut self) {}
    }

    struct Harness {
        fetcher: StreamFetcher,
        buffer: PlaybackBuffer,
        transport: RecordingTransport,
        events: crossbeam_channel::Receiver<ConsumerEvent>,
        info: StreamInfo,
        t0: Instant,
    }

    impl Harness {
        fn new(frames_per_segment: u64, max_cwnd: usize) -> Self {
            let info = StreamInfo::new(
                Name::from_uri("/ndnptt").unwrap().append_sequence_number(7),
                frames_per_segment,
                8000,
            );
            let config = ConsumerConfig {
                max_cwnd,
                ..ConsumerConfig::default()
            };
            let timing = config.timing(&info).unwrap();
            let (tx, rx) = crossbeam_channel::unbounded();
            let emitter = EventEmitter::new(StreamId(1), tx);
            Self {
                fetcher: StreamFetcher::new(info.clone(), timing, &config, emitter.clone()),
                buffer: PlaybackBuffer::new(timing, emitter),
                transport: RecordingTransport::default(),
                events: rx,
                info,
                t0: Instant::now(),
            }
        }

        fn at(&self, ms: u64) -> Instant {
            self.t0 + Duration::from_millis(ms)
        }

        fn tick(&mut self, ms: u64) -> FetchStatus {
            let now = self.at(ms);
            self.fetcher.fire_expired_timers(now);
            self.fetcher.tick(now, &self.buffer, &mut self.transport)
        }

        fn deliver(&mut self, response: SegmentResponse, ms: u64) {
            let now = self.at(ms);
            self.fetcher.on_response(&response, now, &mut self.buffer);
        }

        fn data(&self, segment: u64, frames: usize) -> SegmentResponse {
            let mut payload = Vec::new();
            for i in 0..frames {
                payload.extend(test_frame(i as u8, 12));
            }
            SegmentResponse::data(self.info.segment_name(segment), Bytes::from(payload))
        }

        fn drain_events(&self) -> Vec<StreamEvent> {
            self.events.try_iter().map(|e| e.event).collect()
        }
    }

    #[test]
    fn test_idle_until_started() {
        let mut h = Harness::new(1, 50);
        assert_eq!(h.tick(1000), FetchStatus::Idle);
        assert!(h.transport.sent.is_empty());
    }

    #[test]
    fn test_segments_requested_at_producer_cadence() {
        let mut h = Harness::new(1, 50);
        h.fetcher.start(h.t0);
        h.tick(0);
        assert_eq!(h.transport.segments(), vec![0]);
        h.tick(127);
        assert_eq!(h.transport.segments(), vec![0]);
        h.tick(128);
        assert_eq!(h.transport.segments(), vec![0, 1]);
        // a delayed tick catches up on every due segment
        h.tick(520);
        assert_eq!(h.transport.segments(), vec![0, 1, 2, 3, 4]);
        assert!(h
            .drain_events()
            .contains(&StreamEvent::ProductionWindowGrow(4)));
        // deadline unknown before playback starts
        assert_eq!(h.transport.sent[0].lifetime, Duration::from_millis(4000));
    }

    #[test]
    fn test_window_caps_outstanding() {
        let mut h = Harness::new(1, 3);
        h.fetcher.start(h.t0);
        h.tick(10 * 128);
        assert_eq!(h.transport.segments(), vec![0, 1, 2]);
        assert_eq!(h.fetcher.outstanding(), 3);

        let response = h.data(1, 1);
        h.deliver(response, 10 * 128 + 20);
        h.tick(10 * 128 + 50);
        assert_eq!(h.transport.segments(), vec![0, 1, 2, 3]);
        assert!(h.fetcher.outstanding() <= 3);
    }

    #[test]
    fn test_timeout_requeues_and_late_response_is_premature() {
        let mut h = Harness::new(1, 50);
        h.fetcher.start(h.t0);
        h.tick(0);
        // initial rto equals the 640 ms jitter delay
        assert_eq!(h.fetcher.next_timer_deadline(), Some(h.at(640)));
        h.fetcher.fire_expired_timers(h.at(640));
        assert_eq!(h.fetcher.stats().interest_timeouts, 1);
        assert!(h.drain_events().contains(&StreamEvent::InterestTimeout(0)));

        // fires once per timeout interval
        assert_eq!(h.fetcher.fire_expired_timers(h.at(641)), 0);

        let response = h.data(0, 1);
        h.deliver(response, 700);
        let stats = h.fetcher.stats();
        assert_eq!(stats.premature_rtos, 1);
        assert_eq!(stats.data_received, 1);
        // the requeued segment is not sent again
        h.tick(700);
        assert_eq!(h.transport.segments().iter().filter(|&&s| s == 0).count(), 1);
        // the send time was cleared by the timeout: no rtt sample
        assert_eq!(h.fetcher.rtt().sample_count(), 0);
    }

    #[test]
    fn test_retransmission_sent_before_new_segments() {
        let mut h = Harness::new(1, 50);
        h.fetcher.start(h.t0);
        h.tick(0);
        h.tick(640);
        assert_eq!(h.transport.segments(), vec![0, 0, 1, 2, 3, 4, 5]);

        // a response to the retransmission gives no rtt sample
        let response = h.data(0, 1);
        h.deliver(response, 660);
        assert_eq!(h.fetcher.rtt().sample_count(), 0);
        let response = h.data(1, 1);
        h.deliver(response, 700);
        assert_eq!(h.fetcher.rtt().sample_count(), 1);
    }

    #[test]
    fn test_skip_when_rtt_exceeds_deadline() {
        let mut h = Harness::new(1, 50);
        h.fetcher.start(h.t0);
        h.buffer.start_playing(h.t0);
        h.tick(0);
        let response = h.data(0, 1);
        h.deliver(response, 300);
        assert_eq!(h.fetcher.rtt().avg_rtt(), Duration::from_millis(300));

        // seg 1 deadline is 768; now + avg rtt = 428 is fine
        h.tick(128);
        assert_eq!(h.transport.segments(), vec![0, 1]);
        assert_eq!(h.transport.sent[1].lifetime, Duration::from_millis(640));

        // seg 1 timed out; its retransmission and segs 2..=5 (deadline
        // 1280 < 1000 + 300) are skipped, segs 6 and 7 still make it
        h.tick(1000);
        assert_eq!(h.transport.segments(), vec![0, 1, 6, 7]);
        assert_eq!(h.fetcher.stats().interest_skips, 5);
        let events = h.drain_events();
        assert!(events.contains(&StreamEvent::InterestSkipped(1)));
        assert!(events.contains(&StreamEvent::InterestSkipped(5)));
        assert!(!events.contains(&StreamEvent::InterestSkipped(6)));
    }

    #[test]
    fn test_duplicate_response_ignored() {
        let mut h = Harness::new(1, 50);
        h.fetcher.start(h.t0);
        h.tick(0);
        let response = h.data(0, 1);
        h.deliver(response.clone(), 50);
        h.deliver(response, 60);
        assert_eq!(h.fetcher.stats().data_received, 1);
        assert_eq!(h.buffer.stats().duplicate_frames, 0);
    }

    #[test]
    fn test_short_segment_completes_fetch() {
        let mut h = Harness::new(2, 50);
        h.fetcher.start(h.t0);
        h.tick(256);
        h.tick(512);
        assert_eq!(h.transport.segments(), vec![0, 1, 2]);

        let response = h.data(0, 2);
        h.deliver(response, 520);
        let response = h.data(1, 1);
        h.deliver(response, 530);
        assert_eq!(h.fetcher.final_block_id(), Some(1));
        assert_eq!(h.buffer.end_frame(), Some(3));

        // outstanding seg 2 is beyond the end and was cancelled
        assert_eq!(h.tick(540), FetchStatus::Complete);
        let events = h.drain_events();
        assert!(events.contains(&StreamEvent::FinalBlockLearned(1)));
        assert!(events.contains(&StreamEvent::FetchComplete));
        assert!(h.fetcher.is_closed());
    }

    #[test]
    fn test_nack_sets_final_block() {
        let mut h = Harness::new(1, 50);
        h.fetcher.start(h.t0);
        h.tick(256);
        assert_eq!(h.transport.segments(), vec![0, 1, 2]);

        let response = h.data(0, 1);
        h.deliver(response, 260);
        let response = h.data(1, 1).with_final_block_id(1);
        h.deliver(response, 262);
        let nack = SegmentResponse::nack(h.info.segment_name(2), 1);
        h.deliver(nack, 265);

        let stats = h.fetcher.stats();
        assert_eq!(stats.nacks, 1);
        assert_eq!(h.fetcher.final_block_id(), Some(1));
        assert_eq!(h.buffer.end_frame(), Some(2));
        assert_eq!(h.tick(2000), FetchStatus::Complete);
        assert_eq!(h.transport.segments(), vec![0, 1, 2]);
    }

    #[test]
    fn test_out_of_range_nack_ignored() {
        let mut h = Harness::new(1, 50);
        h.fetcher.start(h.t0);
        h.buffer.start_playing(h.t0);
        h.tick(0);

        let nack = SegmentResponse::nack(h.info.segment_name(0), u64::MAX);
        h.deliver(nack, 10);

        assert_eq!(h.fetcher.stats().nacks, 1);
        assert_eq!(h.fetcher.final_block_id(), None);
        assert_eq!(h.buffer.end_frame(), None);
        let events = h.drain_events();
        assert!(events.contains(&StreamEvent::NackReceived(0)));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::FinalBlockLearned(_))));

        let mut sink: Vec<crate::audio::OutputFrame> = Vec::new();
        assert_eq!(
            h.buffer.tick(h.at(700), &mut sink),
            crate::audio::PlaybackStatus::Playing
        );
        assert_eq!(h.tick(700), FetchStatus::Fetching);
    }

    #[test]
    fn test_bad_response_name_dropped() {
        let mut h = Harness::new(1, 50);
        h.fetcher.start(h.t0);
        h.tick(0);
        let response = SegmentResponse::data(h.info.name.clone().append("x"), Bytes::new());
        h.deliver(response, 10);
        assert_eq!(h.fetcher.stats().data_received, 0);
        assert_eq!(h.fetcher.outstanding(), 1);
    }

    #[test]
    fn test_send_failure_is_not_fatal() {
        let mut h = Harness::new(1, 50);
        h.transport.fail = true;
        h.fetcher.start(h.t0);
        assert_eq!(h.tick(0), FetchStatus::Fetching);
        // the rto timer is the retry path
        assert_eq!(h.fetcher.outstanding(), 1);
        h.tick(640);
        assert_eq!(h.transport.segments()[..2], [0u64, 0]);
    }

    #[test]
    fn test_nothing_sent_after_close() {
        let mut h = Harness::new(1, 50);
        h.fetcher.start(h.t0);
        h.tick(0);
        h.fetcher.close();
        assert_eq!(h.fetcher.next_timer_deadline(), None);
        assert_eq!(h.fetcher.fire_expired_timers(h.at(5000)), 0);
        assert_eq!(h.tick(5000), FetchStatus::Complete);
        assert_eq!(h.transport.segments(), vec![0]);
    }
}
