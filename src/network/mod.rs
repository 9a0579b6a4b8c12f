//! Network subsystem: segment fetching over a request/response transport

pub mod cwnd;
pub mod fetcher;
pub mod loopback;
pub mod rtt;
pub mod transport;

pub use cwnd::CongestionWindow;
pub use fetcher::{FetchStatus, FetcherStats, StreamFetcher};
pub use loopback::{LoopbackConfig, LoopbackNetwork, ProducerHandle};
pub use rtt::{RttEstimator, RttEstimatorOptions};
pub use transport::{
    response_channel, ResponseReceiver, ResponseSender, Transport, TransportEvent,
    TransportProvider,
};
