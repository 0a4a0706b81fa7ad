use thiserror::Error;

use crate::xhci::{EndpointId, EndpointState, RequestId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The ring cannot take the TRBs, and may not grow any further.
    #[error("no room on ring for {needed} TRBs")]
    NoRoom { needed: usize },

    /// The endpoint context state does not allow queueing.
    #[error("endpoint is in state {0:?}")]
    InvalidState(EndpointState),

    #[error("no endpoint {0}")]
    NoEndpoint(EndpointId),

    #[error("endpoint {0} already exists")]
    EndpointExists(EndpointId),

    #[error("no outstanding request {0}")]
    NoRequest(RequestId),

    #[error("invalid transfer request: {0}")]
    InvalidRequest(&'static str),

    #[error("failed to allocate {0} bytes of DMA memory")]
    DmaAlloc(usize),

    #[error("host controller died")]
    HostDied,

    #[error("command aborted")]
    CommandAborted,

    #[error("a Set TR Dequeue Pointer command is already pending on endpoint {0}")]
    Busy(EndpointId),

    /// An event or ring does not match the driver's view of the rings.
    #[error("ring corruption: {0}")]
    Corrupt(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Final status of a transfer request that did not complete successfully.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum TransferError {
    #[error("endpoint stalled")]
    Stall,
    #[error("USB transaction error")]
    Transaction,
    #[error("babble detected")]
    Babble,
    #[error("TRB error")]
    TrbError,
    #[error("data buffer error")]
    DataBuffer,
    #[error("short packet")]
    ShortPacket,
    #[error("missed service interval")]
    MissedService,
    #[error("bandwidth overrun")]
    BandwidthOverrun,
    #[error("isochronous buffer overrun")]
    BufferOverrun,
    #[error("cancelled")]
    Cancelled,
    #[error("endpoint shut down")]
    Shutdown,
    #[error("host controller died")]
    HostDied,
    #[error("completion code {0}")]
    Other(u8),
}
