//! Transport adapter contract
//!
//! The transport sends named segment requests and delivers responses from
//! its own execution context. Deliveries go through a [`ResponseSender`]
//! channel so the consumer picks them up on its own task; nothing in the
//! fetcher or the playback buffer is ever touched from the transport side.

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::{Name, SegmentRequest, SegmentResponse};

/// Asynchronous delivery from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Response(SegmentResponse),
    /// The request's lifetime expired without a response
    Timeout(Name),
}

pub type ResponseSender = mpsc::UnboundedSender<TransportEvent>;
pub type ResponseReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the channel a transport delivers into
pub fn response_channel() -> (ResponseSender, ResponseReceiver) {
    mpsc::unbounded_channel()
}

/// Non-blocking request/response transport
pub trait Transport: Send {
    /// Send one request; never blocks on the network
    fn express_interest(&mut self, request: SegmentRequest) -> Result<(), TransportError>;

    /// Pump pending I/O; called once at the start of every tick
    fn process_events(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Stop sending and drop pending deliveries
    fn close(&mut self);
}

/// Opens one transport per stream consumer
pub trait TransportProvider: Send + Sync {
    fn open(&self, responses: ResponseSender) -> Box<dyn Transport>;
}
