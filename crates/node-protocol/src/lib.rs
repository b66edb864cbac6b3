//! Galaxy node protocol: envelope model, device wire envelope, transport
//! form adapter and stream sequencing.
//!
//! Pure value types. Nothing here performs I/O.

pub mod adapter;
pub mod device;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod node_message;
pub mod stream;

pub use adapter::SimpleEnvelope;
pub use device::{
    Command, CommandResult, DeviceMessage, DeviceMessageType, ResultStatus, TaskStatus,
    PROTOCOL_VERSION,
};
pub use envelope::{
    new_message_id, now_millis, Message, MessageHeader, MessagePriority, MessageType, Payload,
    Reply, BROADCAST_TARGET, DEFAULT_TTL_SECS, SELF_TARGET,
};
pub use error::ProtocolError;
pub use frame::{check_frame_size, decode_frame, Frame};
pub use node_message::{NodeMessage, DEFAULT_NODE_PRIORITY};
pub use stream::{StreamError, StreamMessage, StreamReceiver, StreamSession};
