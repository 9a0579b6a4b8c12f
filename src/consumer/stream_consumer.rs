//! Stream consumer actor
//!
//! One tokio task owns the fetcher, the playback buffer, the transport and
//! the sink of a stream. Control commands, transport deliveries,
//! retransmission timers and the periodic tick are all serialized through a
//! single `select!` loop, so fetch and playback state is never touched from
//! two places at once.
//!
//! ```text
//!  handle ──commands──┐
//!  transport ─events──┼──► select! ──► tick: pump I/O → fetcher → buffer → reschedule
//!  rto timer ─────────┤
//!  tick timer ────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::audio::buffer::{PlaybackBuffer, PlaybackStats, PlaybackStatus};
use crate::audio::sink::FrameSink;
use crate::config::ConsumerConfig;
use crate::consumer::events::{EventEmitter, StreamEvent, StreamId};
use crate::error::Result;
use crate::network::fetcher::{FetcherStats, StreamFetcher};
use crate::network::transport::{
    response_channel, ResponseReceiver, Transport, TransportEvent, TransportProvider,
};
use crate::protocol::{Name, StreamInfo};

/// Control messages accepted by a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerCommand {
    StartFetching,
    StartPlaying,
    Close,
}

/// Snapshot of a consumer's counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumerStats {
    pub fetcher: FetcherStats,
    pub playback: PlaybackStats,
    pub avg_rtt: Duration,
    pub rto: Duration,
    pub closed: bool,
}

/// What woke the actor up
enum Wake {
    Command(Option<ConsumerCommand>),
    Transport(TransportEvent),
    RtoTimer,
    Tick,
}

pub struct StreamConsumer {
    name: Name,
    fetcher: StreamFetcher,
    buffer: PlaybackBuffer,
    transport: Box<dyn Transport>,
    responses: ResponseReceiver,
    commands: mpsc::UnboundedReceiver<ConsumerCommand>,
    sink: Box<dyn FrameSink>,
    tick_interval: Duration,
    next_tick: Option<Instant>,
    closed: bool,
    stats: Arc<RwLock<ConsumerStats>>,
    events: EventEmitter,
}

impl StreamConsumer {
    /// Build the consumer for `info` and run it on its own task
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        info: StreamInfo,
        config: &ConsumerConfig,
        sink: Box<dyn FrameSink>,
        events: EventEmitter,
        provider: &dyn TransportProvider,
    ) -> Result<StreamConsumerHandle> {
        config.validate()?;
        let timing = config.timing(&info)?;
        let id = events.stream();
        let name = info.name.clone();

        let (responses_tx, responses) = response_channel();
        let transport = provider.open(responses_tx);
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let stats = Arc::new(RwLock::new(ConsumerStats::default()));

        let consumer = StreamConsumer {
            name: name.clone(),
            fetcher: StreamFetcher::new(info, timing, config, events.clone()),
            buffer: PlaybackBuffer::new(timing, events.clone()),
            transport,
            responses,
            commands,
            sink,
            tick_interval: config.tick_interval(),
            next_tick: None,
            closed: false,
            stats: Arc::clone(&stats),
            events,
        };
        tracing::info!("{}: consuming {}", id, name);
        let task = tokio::spawn(consumer.run());

        Ok(StreamConsumerHandle {
            id,
            name,
            commands: commands_tx,
            stats,
            task,
        })
    }

    async fn run(mut self) {
        self.events.emit(StreamEvent::Initialized);

        while !self.closed {
            let rto_deadline = self.fetcher.next_timer_deadline();
            let next_tick = self.next_tick;

            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                Some(event) = self.responses.recv() => Wake::Transport(event),
                _ = sleep_until_opt(rto_deadline) => Wake::RtoTimer,
                _ = sleep_until_opt(next_tick) => Wake::Tick,
            };

            match wake {
                Wake::Command(Some(command)) => self.handle_command(command),
                Wake::Command(None) => {
                    tracing::debug!("{}: handle dropped", self.events.stream());
                    self.close();
                }
                Wake::Transport(event) => self.handle_transport_event(event),
                Wake::RtoTimer => {
                    self.fetcher.fire_expired_timers(Instant::now());
                }
                Wake::Tick => self.tick(),
            }
            self.publish_stats();
        }
    }

    fn handle_command(&mut self, command: ConsumerCommand) {
        if self.closed {
            return;
        }
        let now = Instant::now();
        match command {
            ConsumerCommand::StartFetching => {
                if !self.fetcher.is_started() {
                    tracing::debug!("{}: start fetching", self.events.stream());
                    self.fetcher.start(now);
                    self.tick();
                }
            }
            ConsumerCommand::StartPlaying => {
                if self.buffer.play_start_time().is_none() {
                    tracing::debug!("{}: start playing", self.events.stream());
                    self.buffer.start_playing(now);
                }
            }
            ConsumerCommand::Close => self.close(),
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.closed {
            return;
        }
        match event {
            TransportEvent::Response(response) => {
                self.fetcher
                    .on_response(&response, Instant::now(), &mut self.buffer);
            }
            TransportEvent::Timeout(name) => {
                tracing::debug!("{}: interest lifetime expired for {}", self.events.stream(), name);
            }
        }
    }

    fn tick(&mut self) {
        if self.closed {
            return;
        }
        let now = Instant::now();

        if let Err(e) = self.transport.process_events() {
            tracing::warn!("{}: transport error: {}", self.events.stream(), e);
        }
        self.fetcher.fire_expired_timers(now);
        self.fetcher
            .tick(now, &self.buffer, self.transport.as_mut());

        if self.buffer.tick(now, self.sink.as_mut()) == PlaybackStatus::Finished {
            self.close();
            return;
        }
        self.next_tick = Some(now + self.tick_interval);
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.fetcher.close();
        self.transport.close();
        self.buffer.close();
        self.next_tick = None;
        self.closed = true;

        let playback = self.buffer.stats();
        tracing::info!(
            "{}: closed {} (played {}, skipped {}, skip rate {:.1}%, late {})",
            self.events.stream(),
            self.name,
            playback.frames_played,
            playback.frames_skipped,
            playback.skip_rate() * 100.0,
            playback.late_frames
        );
        self.events.emit(StreamEvent::BufferingComplete);
    }

    fn publish_stats(&self) {
        let rtt = self.fetcher.rtt();
        *self.stats.write() = ConsumerStats {
            fetcher: self.fetcher.stats(),
            playback: self.buffer.stats(),
            avg_rtt: rtt.avg_rtt(),
            rto: rtt.estimated_rto(),
            closed: self.closed,
        };
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Control handle of a running consumer
///
/// All operations are fire-and-forget and idempotent. Dropping the handle
/// closes the consumer.
pub struct StreamConsumerHandle {
    id: StreamId,
    name: Name,
    commands: mpsc::UnboundedSender<ConsumerCommand>,
    stats: Arc<RwLock<ConsumerStats>>,
    task: JoinHandle<()>,
}

impl StreamConsumerHandle {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn start_fetching(&self) {
        self.send(ConsumerCommand::StartFetching);
    }

    pub fn start_playing(&self) {
        self.send(ConsumerCommand::StartPlaying);
    }

    pub fn close(&self) {
        self.send(ConsumerCommand::Close);
    }

    fn send(&self, command: ConsumerCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!("{}: {:?} after consumer closed", self.id, command);
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.read().clone()
    }

    /// The consumer task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the consumer task to exit
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::warn!("{}: consumer task failed: {}", self.id, e);
        }
    }
}
