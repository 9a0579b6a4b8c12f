//! Push-to-talk consumer demo
//!
//! Publishes a few simulated talk bursts on the loopback network and plays
//! them back through the playback queue, one burst at a time.
//!
//! Usage: `consumer [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ndn_ptt_consumer::{
    audio::{FrameQueue, FrameSink},
    config::AppConfig,
    consumer::StreamId,
    network::{LoopbackConfig, LoopbackNetwork, ProducerHandle},
    protocol::StreamInfo,
    queue::PlaybackQueue,
};

const FRAMES_PER_SEGMENT: u64 = 2;
const SAMPLING_RATE: u32 = 8000;
const FRAME_LEN: usize = 96;

/// One talk burst: `frames` frames published at the real-time cadence
async fn produce(producer: ProducerHandle, frames: u64, segment_duration: Duration) {
    let mut interval = tokio::time::interval(segment_duration);
    let mut remaining = frames;
    while remaining > 0 {
        interval.tick().await;
        let count = remaining.min(FRAMES_PER_SEGMENT);
        let mut payload = Vec::new();
        for _ in 0..count {
            payload.extend(adts_frame(FRAME_LEN));
        }
        producer.publish_segment(Bytes::from(payload));
        remaining -= count;
    }
    let final_segment = producer.finish();
    tracing::info!("{} finished at segment {}", producer.name(), final_segment);
}

/// A mono 8 kHz ADTS frame of `length` bytes with an empty body
fn adts_frame(length: usize) -> Vec<u8> {
    let mut frame = vec![0u8; length];
    frame[..7].copy_from_slice(&[0xff, 0xf1, 0x6c, 0x40, 0x00, 0x1f, 0xfc]);
    frame[3] |= ((length >> 11) & 0x03) as u8;
    frame[4] = ((length >> 3) & 0xff) as u8;
    frame[5] |= ((length & 0x07) as u8) << 5;
    frame
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(AppConfig::default_path);
    let config = match &config_path {
        Some(path) => AppConfig::load_or_default(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::default(),
    };

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_filter.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting NDN push-to-talk consumer");

    let prefix = config.prefix()?;
    let network = LoopbackNetwork::new(LoopbackConfig {
        latency: Duration::from_millis(40),
        drop_first: [3, 7].into_iter().collect(),
        ..LoopbackConfig::default()
    });

    let outputs: Arc<Mutex<Vec<(StreamId, FrameQueue)>>> = Arc::default();
    let sink_outputs = Arc::clone(&outputs);
    let mut queue = PlaybackQueue::new(
        config.consumer.clone(),
        Arc::new(network.clone()),
        Box::new(move |id: StreamId, _: &StreamInfo| -> Box<dyn FrameSink> {
            let sink = FrameQueue::new();
            sink_outputs.lock().push((id, sink.clone()));
            Box::new(sink)
        }),
    );

    for (seq, frames) in [(0u64, 25u64), (1, 12), (2, 31)] {
        let info = StreamInfo::new(
            prefix.clone().append_sequence_number(seq),
            FRAMES_PER_SEGMENT,
            SAMPLING_RATE,
        );
        let timing = config.consumer.timing(&info)?;
        let producer = network.register_producer(&info);
        tokio::spawn(produce(producer, frames, timing.segment_duration()));
        queue.notify_new_stream(info);
    }

    let interrupted = tokio::select! {
        _ = queue.run_until_idle() => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        tracing::info!("Interrupted, closing streams");
        queue.close_all();
    }

    for (id, output) in outputs.lock().iter() {
        tracing::info!(
            "{}: {} frames written, finished: {}",
            id,
            output.frames_written(),
            output.is_finished()
        );
    }
    tracing::info!("Requests seen by the network: {}", network.requests_seen());

    Ok(())
}
