/// Errors raised while decoding inbound frames.
///
/// These never produce a reply: the runtime logs them and drops the frame.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}
