//! Playback queue
//!
//! Every announced stream starts fetching as soon as it is announced, so
//! its segments are cached by the time it plays. Playback itself is one
//! stream at a time, in announcement order, and never while the local user
//! is recording.
//!
//! Streams live in an arena indexed by [`StreamId`]. Names are only used at
//! the announcement boundary; every event after that is routed by id.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::audio::sink::FrameSink;
use crate::config::ConsumerConfig;
use crate::constants::QUEUE_POLL_INTERVAL_MS;
use crate::consumer::{
    ConsumerEvent, ConsumerStats, EventEmitter, StreamConsumer, StreamConsumerHandle, StreamEvent,
    StreamId,
};
use crate::network::transport::TransportProvider;
use crate::protocol::{Name, StreamInfo};

/// Builds the output sink of a stream about to be consumed
pub type SinkFactory = Box<dyn Fn(StreamId, &StreamInfo) -> Box<dyn FrameSink> + Send>;

struct StreamSlot {
    info: StreamInfo,
    handle: Option<StreamConsumerHandle>,
    fetch_complete: bool,
}

pub struct PlaybackQueue {
    config: ConsumerConfig,
    provider: Arc<dyn TransportProvider>,
    sink_factory: SinkFactory,
    slots: Vec<Option<StreamSlot>>,
    ids: HashMap<Name, StreamId>,
    fetch_queue: VecDeque<StreamId>,
    play_queue: VecDeque<StreamId>,
    playing: Option<StreamId>,
    recording: bool,
    events_tx: Sender<ConsumerEvent>,
    events_rx: Receiver<ConsumerEvent>,
    listener: Option<Sender<ConsumerEvent>>,
}

impl PlaybackQueue {
    pub fn new(
        config: ConsumerConfig,
        provider: Arc<dyn TransportProvider>,
        sink_factory: SinkFactory,
    ) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            config,
            provider,
            sink_factory,
            slots: Vec::new(),
            ids: HashMap::new(),
            fetch_queue: VecDeque::new(),
            play_queue: VecDeque::new(),
            playing: None,
            recording: false,
            events_tx,
            events_rx,
            listener: None,
        }
    }

    /// Forward every consumer event to `listener` as well
    pub fn with_listener(mut self, listener: Sender<ConsumerEvent>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Announce a new stream; repeated announcements return the same id
    pub fn notify_new_stream(&mut self, info: StreamInfo) -> StreamId {
        if let Some(&id) = self.ids.get(&info.name) {
            tracing::debug!("{} already announced as {}", info.name, id);
            return id;
        }
        let id = StreamId(self.slots.len() as u32);
        tracing::info!("New stream {} ({})", info.name, id);
        self.ids.insert(info.name.clone(), id);
        self.slots.push(Some(StreamSlot {
            info,
            handle: None,
            fetch_complete: false,
        }));
        self.fetch_queue.push_back(id);
        self.play_queue.push_back(id);
        id
    }

    /// While recording, no stream starts playing
    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn playing(&self) -> Option<StreamId> {
        self.playing
    }

    pub fn lookup(&self, name: &Name) -> Option<StreamId> {
        self.ids.get(name).copied()
    }

    /// Number of streams not yet released
    pub fn active_streams(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_idle(&self) -> bool {
        self.active_streams() == 0
    }

    pub fn stats(&self, id: StreamId) -> Option<ConsumerStats> {
        self.slot(id)?.handle.as_ref().map(StreamConsumerHandle::stats)
    }

    /// Whether `id` finished fetching
    pub fn fetch_complete(&self, id: StreamId) -> bool {
        self.slot(id).map_or(false, |slot| slot.fetch_complete)
    }

    fn slot(&self, id: StreamId) -> Option<&StreamSlot> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    fn slot_mut(&mut self, id: StreamId) -> Option<&mut StreamSlot> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    /// One work cycle: route events, start fetches, start the next playback
    ///
    /// Must be called from within a tokio runtime.
    pub fn do_work(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }

        while let Some(id) = self.fetch_queue.pop_front() {
            self.start_fetching(id);
        }

        if self.playing.is_none() && !self.recording {
            while let Some(id) = self.play_queue.pop_front() {
                let Some(handle) = self.slot(id).and_then(|slot| slot.handle.as_ref()) else {
                    continue;
                };
                tracing::info!("Playing {} ({})", handle.name(), id);
                handle.start_playing();
                self.playing = Some(id);
                break;
            }
        }
    }

    fn start_fetching(&mut self, id: StreamId) {
        let Some(slot) = self.slot(id) else {
            return;
        };
        let info = slot.info.clone();
        let sink = (self.sink_factory)(id, &info);
        let events = EventEmitter::new(id, self.events_tx.clone());

        match StreamConsumer::spawn(info, &self.config, sink, events, self.provider.as_ref()) {
            Ok(handle) => {
                handle.start_fetching();
                if let Some(slot) = self.slot_mut(id) {
                    slot.handle = Some(handle);
                }
            }
            Err(e) => {
                tracing::warn!("Cannot consume {}: {}", id, e);
                self.release(id);
            }
        }
    }

    fn handle_event(&mut self, event: ConsumerEvent) {
        if let Some(listener) = &self.listener {
            let _ = listener.send(event);
        }
        let id = event.stream;
        let Some(slot) = self.slot_mut(id) else {
            tracing::warn!("Event {:?} for unknown stream {}", event.event, id);
            return;
        };
        match event.event {
            StreamEvent::FetchComplete => {
                tracing::debug!("Fetching of {} finished", slot.info.name);
                slot.fetch_complete = true;
            }
            StreamEvent::BufferingComplete => {
                tracing::info!("Playing of {} finished", slot.info.name);
                self.release(id);
            }
            _ => {}
        }
    }

    fn release(&mut self, id: StreamId) {
        let Some(slot) = self.slots.get_mut(id.0 as usize).and_then(Option::take) else {
            return;
        };
        if let Some(handle) = &slot.handle {
            handle.close();
        }
        self.ids.remove(&slot.info.name);
        self.play_queue.retain(|&queued| queued != id);
        if self.playing == Some(id) {
            self.playing = None;
        }
    }

    /// Close every stream
    pub fn close_all(&mut self) {
        for slot in self.slots.iter().flatten() {
            if let Some(handle) = &slot.handle {
                handle.close();
            }
        }
    }

    /// Run work cycles until every announced stream has been released
    pub async fn run_until_idle(&mut self) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(QUEUE_POLL_INTERVAL_MS));
        loop {
            interval.tick().await;
            self.do_work();
            if self.is_idle() && self.fetch_queue.is_empty() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sink::FrameQueue;
    use crate::codec::adts::test_frame;
    use crate::network::loopback::LoopbackNetwork;
    use bytes::Bytes;

    fn stream(seq: u64) -> StreamInfo {
        StreamInfo::new(
            Name::from_uri("/ndnptt").unwrap().append_sequence_number(seq),
            1,
            8000,
        )
    }

    fn queue(network: &LoopbackNetwork) -> (PlaybackQueue, Receiver<ConsumerEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let queue = PlaybackQueue::new(
            ConsumerConfig::default(),
            Arc::new(network.clone()),
            Box::new(|_: StreamId, _: &StreamInfo| -> Box<dyn FrameSink> {
                Box::new(FrameQueue::new())
            }),
        )
        .with_listener(tx);
        (queue, rx)
    }

    fn publish(network: &LoopbackNetwork, info: &StreamInfo, segments: usize) {
        let producer = network.register_producer(info);
        for i in 0..segments {
            producer.publish_segment(Bytes::from(test_frame(i as u8, 20)));
        }
        producer.finish();
    }

    #[test]
    fn test_repeated_announcement_keeps_id() {
        let network = LoopbackNetwork::default();
        let (mut queue, _rx) = queue(&network);
        let a = queue.notify_new_stream(stream(0));
        let b = queue.notify_new_stream(stream(1));
        assert_eq!(queue.notify_new_stream(stream(0)), a);
        assert_ne!(a, b);
        assert_eq!(queue.lookup(&stream(1).name), Some(b));
        assert_eq!(queue.active_streams(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_play_one_at_a_time() {
        let network = LoopbackNetwork::default();
        let first = stream(0);
        let second = stream(1);
        publish(&network, &first, 3);
        publish(&network, &second, 2);

        let (mut queue, rx) = queue(&network);
        let a = queue.notify_new_stream(first);
        let b = queue.notify_new_stream(second);
        queue.do_work();
        assert_eq!(queue.playing(), Some(a));

        queue.run_until_idle().await;
        assert!(queue.is_idle());

        let events: Vec<ConsumerEvent> = rx.try_iter().collect();
        let position = |id: StreamId, wanted: StreamEvent| {
            events
                .iter()
                .position(|e| e.stream == id && e.event == wanted)
                .unwrap()
        };
        // both fetched up front, second played only after the first ended
        assert!(position(b, StreamEvent::FetchComplete) < position(a, StreamEvent::BufferingComplete));
        assert!(position(a, StreamEvent::BufferingComplete) < position(b, StreamEvent::FramePlayed(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_playback_while_recording() {
        let network = LoopbackNetwork::default();
        let info = stream(4);
        publish(&network, &info, 1);

        let (mut queue, _rx) = queue(&network);
        queue.set_recording(true);
        let id = queue.notify_new_stream(info);
        queue.do_work();
        assert_eq!(queue.playing(), None);

        tokio::time::sleep(Duration::from_millis(500)).await;
        queue.do_work();
        assert!(queue.fetch_complete(id));
        assert_eq!(queue.playing(), None);

        queue.set_recording(false);
        queue.do_work();
        assert_eq!(queue.playing(), Some(id));
    }

    #[test]
    fn test_event_for_unknown_stream_dropped() {
        let network = LoopbackNetwork::default();
        let (mut queue, _rx) = queue(&network);
        queue
            .events_tx
            .send(ConsumerEvent {
                stream: StreamId(9),
                event: StreamEvent::BufferingComplete,
            })
            .unwrap();
        queue.do_work();
        assert!(queue.is_idle());
    }
}
