//! # NDN Push-to-Talk Consumer
//!
//! Real-time consumption of push-to-talk audio streams published over a
//! named, pull-based request/response network.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                     Playback Queue (queue::manager)                    │
//! │   announce(StreamInfo) ──► arena slot ──► start fetching at once       │
//! │   one stream plays at a time, never while recording                    │
//! └───────────────────────────────┬───────────────────────────────────────┘
//!                                 │ start_fetching / start_playing / close
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │              Stream Consumer task (consumer::stream_consumer)          │
//! │                                                                        │
//! │   ┌──────────────────────┐  responses   ┌──────────────────────────┐   │
//! │   │  Transport           │ ───────────► │  Stream Fetcher          │   │
//! │   │  (network::transport)│ ◄─────────── │  RTT/RTO, cwnd, retx     │   │
//! │   └──────────────────────┘   requests   └────────────┬─────────────┘   │
//! │                                                      │ ADTS frames     │
//! │                                                      ▼                 │
//! │                                         ┌──────────────────────────┐   │
//! │                                         │  Playback Buffer         │   │
//! │                                         │  reorder, pace, silence  │   │
//! │                                         └────────────┬─────────────┘   │
//! └──────────────────────────────────────────────────────┼────────────────┘
//!                                                        ▼
//!                                            Frame sink (audio::sink)
//! ```
//!
//! Progress events from every consumer are multiplexed onto one
//! crossbeam channel as [`consumer::ConsumerEvent`]s.

pub mod audio;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod network;
pub mod protocol;
pub mod queue;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Name prefix under which streams are announced
    pub const DEFAULT_APPLICATION_PREFIX: &str = "/ndnptt";

    /// Frames of delay between play start and the deadline of frame 0
    pub const DEFAULT_JITTER_BUFFER_SIZE: u64 = 5;

    /// Consumer tick period in milliseconds
    pub const DEFAULT_TICK_INTERVAL_MS: u64 = 50;

    /// Request lifetime while the playback deadline is unknown
    pub const DEFAULT_INTEREST_LIFETIME_MS: u64 = 4000;

    /// Ceiling on outstanding requests per stream
    pub const DEFAULT_MAX_CWND: usize = 50;

    /// Floor of the retransmission timeout
    pub const DEFAULT_MIN_RTO_MS: u64 = 200;

    /// RTT samples expected per round trip
    pub const RTT_EXPECTED_SAMPLES: usize = 1;

    /// Playback queue polling period in milliseconds
    pub const QUEUE_POLL_INTERVAL_MS: u64 = 50;
}
