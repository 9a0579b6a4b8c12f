//! In-process loopback forwarder
//!
//! Hosts simulated producers keyed by stream name and answers segment
//! requests the way a producer behind a forwarder would:
//!
//! | Request for                 | Answer                                    |
//! |-----------------------------|-------------------------------------------|
//! | a published segment         | data (final block id on the last segment) |
//! | a segment past the final    | application NACK carrying the final seg   |
//! | a segment not yet produced  | held as a pending interest until publish  |
//! | an unknown stream           | nothing                                   |
//!
//! Pending interests that outlive their lifetime are reported back as
//! transport timeouts. Deliveries are delayed by a fixed latency; loss is
//! deterministic, by segment number.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::network::transport::{ResponseSender, Transport, TransportEvent, TransportProvider};
use crate::protocol::{Name, SegmentRequest, SegmentResponse, StreamInfo};

/// Fault model of the loopback network
#[derive(Debug, Clone, Default)]
pub struct LoopbackConfig {
    /// One-way delay applied to every response
    pub latency: Duration,
    /// Segments whose first request is lost
    pub drop_first: BTreeSet<u64>,
    /// Segments that are never answered
    pub drop_always: BTreeSet<u64>,
}

struct PendingInterest {
    face: u64,
    segment: u64,
    name: Name,
    expires: Instant,
}

#[derive(Default)]
struct ProducerState {
    segments: Vec<Bytes>,
    final_segment: Option<u64>,
    pending: Vec<PendingInterest>,
}

impl ProducerState {
    fn response(&self, name: Name, segment: u64) -> Option<SegmentResponse> {
        if let Some(content) = self.segments.get(segment as usize) {
            let response = SegmentResponse::data(name, content.clone());
            return Some(match self.final_segment {
                Some(last) if last == segment => response.with_final_block_id(last),
                _ => response,
            });
        }
        match self.final_segment {
            Some(last) if segment > last => Some(SegmentResponse::nack(name, last)),
            _ => None,
        }
    }
}

#[derive(Default)]
struct NetworkState {
    producers: HashMap<Name, ProducerState>,
    faces: HashMap<u64, ResponseSender>,
    next_face: u64,
    requests_seen: HashMap<Name, u32>,
}

/// Shared loopback network; clones refer to the same network
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
    config: Arc<LoopbackConfig>,
}

impl LoopbackNetwork {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState::default())),
            config: Arc::new(config),
        }
    }

    /// Host a producer for `info.name`
    pub fn register_producer(&self, info: &StreamInfo) -> ProducerHandle {
        self.state
            .lock()
            .producers
            .insert(info.name.clone(), ProducerState::default());
        tracing::debug!("loopback: registered producer {}", info.name);
        ProducerHandle {
            network: self.clone(),
            name: info.name.clone(),
        }
    }

    /// Total requests that reached the network, lost ones included
    pub fn requests_seen(&self) -> u32 {
        self.state.lock().requests_seen.values().sum()
    }

    /// Requests that reached the network for one segment
    pub fn requests_for(&self, name: &Name) -> u32 {
        self.state
            .lock()
            .requests_seen
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    fn deliver(&self, tx: &ResponseSender, event: TransportEvent) {
        let latency = self.config.latency;
        if latency.is_zero() {
            let _ = tx.send(event);
            return;
        }
        let tx = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let _ = tx.send(event);
        });
    }

    fn express(&self, face: u64, request: SegmentRequest) -> Result<(), TransportError> {
        let segment = request
            .segment()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let stream = request.name.prefix(request.name.len().saturating_sub(1));

        let mut state = self.state.lock();
        let tx = state.faces.get(&face).cloned().ok_or(TransportError::Closed)?;

        let seen = state.requests_seen.entry(request.name.clone()).or_insert(0);
        *seen += 1;
        let lost = self.config.drop_always.contains(&segment)
            || (*seen == 1 && self.config.drop_first.contains(&segment));
        if lost {
            tracing::debug!("loopback: dropping request {}", request.name);
            return Ok(());
        }

        let Some(producer) = state.producers.get_mut(&stream) else {
            tracing::debug!("loopback: no producer for {}", request.name);
            return Ok(());
        };
        let response = producer.response(request.name.clone(), segment);
        if response.is_none() {
            producer.pending.push(PendingInterest {
                face,
                segment,
                name: request.name,
                expires: Instant::now() + request.lifetime,
            });
        }
        drop(state);

        if let Some(response) = response {
            self.deliver(&tx, TransportEvent::Response(response));
        }
        Ok(())
    }

    /// Answer pending interests that `stream`'s producer can now satisfy
    fn satisfy_pending(&self, stream: &Name) {
        let mut answered = Vec::new();
        {
            let mut state = self.state.lock();
            let NetworkState {
                producers, faces, ..
            } = &mut *state;
            let Some(producer) = producers.get_mut(stream) else {
                return;
            };
            let pending = std::mem::take(&mut producer.pending);
            for interest in pending {
                match producer.response(interest.name.clone(), interest.segment) {
                    Some(response) => {
                        if let Some(tx) = faces.get(&interest.face) {
                            answered.push((tx.clone(), response));
                        }
                    }
                    None => producer.pending.push(interest),
                }
            }
        }
        for (tx, response) in answered {
            self.deliver(&tx, TransportEvent::Response(response));
        }
    }

    fn expire_pending(&self, face: u64, now: Instant) {
        let mut state = self.state.lock();
        let Some(tx) = state.faces.get(&face).cloned() else {
            return;
        };
        for producer in state.producers.values_mut() {
            producer.pending.retain(|interest| {
                if interest.face == face && interest.expires <= now {
                    let _ = tx.send(TransportEvent::Timeout(interest.name.clone()));
                    false
                } else {
                    true
                }
            });
        }
    }

    fn close_face(&self, face: u64) {
        let mut state = self.state.lock();
        state.faces.remove(&face);
        for producer in state.producers.values_mut() {
            producer.pending.retain(|interest| interest.face != face);
        }
    }
}

impl TransportProvider for LoopbackNetwork {
    fn open(&self, responses: ResponseSender) -> Box<dyn Transport> {
        let mut state = self.state.lock();
        let id = state.next_face;
        state.next_face += 1;
        state.faces.insert(id, responses);
        Box::new(LoopbackFace {
            id,
            network: self.clone(),
            closed: false,
        })
    }
}

/// One consumer's attachment to the loopback network
pub struct LoopbackFace {
    id: u64,
    network: LoopbackNetwork,
    closed: bool,
}

impl Transport for LoopbackFace {
    fn express_interest(&mut self, request: SegmentRequest) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.network.express(self.id, request)
    }

    fn process_events(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.network.expire_pending(self.id, Instant::now());
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.network.close_face(self.id);
        }
    }
}

/// Publishing side of one simulated stream
#[derive(Clone)]
pub struct ProducerHandle {
    network: LoopbackNetwork,
    name: Name,
}

impl ProducerHandle {
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Publish the next segment; returns its segment number
    pub fn publish_segment(&self, content: Bytes) -> u64 {
        let segment = {
            let mut state = self.network.state.lock();
            let producer = state.producers.entry(self.name.clone()).or_default();
            producer.segments.push(content);
            producer.segments.len() as u64 - 1
        };
        self.network.satisfy_pending(&self.name);
        segment
    }

    /// Stop producing: the last published segment becomes final
    ///
    /// A stream that published nothing gets one empty segment so that
    /// consumers still find its end.
    pub fn finish(&self) -> u64 {
        let final_segment = {
            let mut state = self.network.state.lock();
            let producer = state.producers.entry(self.name.clone()).or_default();
            if producer.segments.is_empty() {
                producer.segments.push(Bytes::new());
            }
            let last = producer.segments.len() as u64 - 1;
            producer.final_segment = Some(last);
            last
        };
        tracing::debug!("loopback: {} finished at seg {}", self.name, final_segment);
        self.network.satisfy_pending(&self.name);
        final_segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::response_channel;

    fn info() -> StreamInfo {
        StreamInfo::new(
            Name::from_uri("/ndnptt").unwrap().append_sequence_number(3),
            1,
            8000,
        )
    }

    fn request(info: &StreamInfo, segment: u64) -> SegmentRequest {
        SegmentRequest::new(info.segment_name(segment), Duration::from_millis(500))
    }

    fn response(event: TransportEvent) -> SegmentResponse {
        match event {
            TransportEvent::Response(response) => response,
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_published_segment_answered() {
        let network = LoopbackNetwork::default();
        let info = info();
        let producer = network.register_producer(&info);
        producer.publish_segment(Bytes::from_static(b"seg0"));

        let (tx, mut rx) = response_channel();
        let mut face = network.open(tx);
        face.express_interest(request(&info, 0)).unwrap();

        let data = response(rx.recv().await.unwrap());
        assert_eq!(data.segment().unwrap(), 0);
        assert_eq!(data.content, Bytes::from_static(b"seg0"));
        assert!(data.meta.final_block_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_interest_satisfied_on_publish() {
        let network = LoopbackNetwork::new(LoopbackConfig {
            latency: Duration::from_millis(30),
            ..LoopbackConfig::default()
        });
        let info = info();
        let producer = network.register_producer(&info);
        let (tx, mut rx) = response_channel();
        let mut face = network.open(tx);

        face.express_interest(request(&info, 0)).unwrap();
        assert!(rx.try_recv().is_err());
        producer.publish_segment(Bytes::from_static(b"late"));

        let start = Instant::now();
        let data = response(rx.recv().await.unwrap());
        assert_eq!(data.content, Bytes::from_static(b"late"));
        assert_eq!(start.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_marks_final_and_nacks_beyond() {
        let network = LoopbackNetwork::default();
        let info = info();
        let producer = network.register_producer(&info);
        let (tx, mut rx) = response_channel();
        let mut face = network.open(tx);

        producer.publish_segment(Bytes::from_static(b"a"));
        face.express_interest(request(&info, 1)).unwrap();
        assert_eq!(producer.finish(), 0);

        let nack = response(rx.recv().await.unwrap());
        assert!(nack.is_nack());
        assert_eq!(crate::protocol::decode_nack(&nack.content).unwrap(), 0);

        face.express_interest(request(&info, 0)).unwrap();
        let data = response(rx.recv().await.unwrap());
        assert_eq!(data.meta.final_block_id.unwrap().to_segment().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_pending_interest_times_out() {
        let network = LoopbackNetwork::default();
        let info = info();
        network.register_producer(&info);
        let (tx, mut rx) = response_channel();
        let mut face = network.open(tx);

        face.express_interest(request(&info, 0)).unwrap();
        face.process_events().unwrap();
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(500)).await;
        face.process_events().unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::Timeout(info.segment_name(0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_first_loses_only_first_request() {
        let network = LoopbackNetwork::new(LoopbackConfig {
            drop_first: [0].into_iter().collect(),
            ..LoopbackConfig::default()
        });
        let info = info();
        let producer = network.register_producer(&info);
        producer.publish_segment(Bytes::from_static(b"a"));
        let (tx, mut rx) = response_channel();
        let mut face = network.open(tx);

        face.express_interest(request(&info, 0)).unwrap();
        assert!(rx.try_recv().is_err());
        face.express_interest(request(&info, 0)).unwrap();
        assert!(rx.try_recv().is_ok());
        assert_eq!(network.requests_for(&info.segment_name(0)), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_face_rejects_requests() {
        let network = LoopbackNetwork::default();
        let info = info();
        network.register_producer(&info);
        let (tx, _rx) = response_channel();
        let mut face = network.open(tx);
        face.close();
        assert_eq!(
            face.express_interest(request(&info, 0)),
            Err(TransportError::Closed)
        );
        assert_eq!(network.requests_seen(), 0);
    }
}
