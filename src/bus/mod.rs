pub mod events;
pub mod queue;

pub use events::{InboundMessage, MediaAttachment, OutboundMessage};
pub use queue::MessageBus;
