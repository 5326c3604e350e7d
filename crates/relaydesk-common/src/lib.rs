pub mod error;
pub mod message;
pub mod types;

pub use error::{Error, Result};
pub use message::{ChannelType, NormalizedMessage, SenderRole};
pub use types::{AgentId, ConnectionId, ConversationId, MessageId, SessionId, TenantId};
