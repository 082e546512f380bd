use std::io;
use thiserror::Error;

/// Error kinds surfaced by the messaging layer. Per-datagram failures
///  (malformed headers, unknown opcodes) are logged and counted rather than
///  propagated out of the driver; these variants reach callers through the
///  build/send API and through `TemplateRegistry` construction.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message template {0:?}")]
    UnknownTemplate(String),

    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("message build operation out of order: {0}")]
    BuildState(String),

    #[error("circuit table is full ({max} circuits)")]
    CapacityExceeded { max: usize },

    #[error("send rejected by throttle")]
    Throttled,

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(&'static str),

    #[error("invalid template catalogue: {0}")]
    InvalidCatalogue(String),
}
