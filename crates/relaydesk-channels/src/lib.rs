pub mod email;
mod http;
pub mod messenger;
pub mod registry;
pub mod retry;
pub mod telegram;
pub mod traits;
pub mod whatsapp;

pub use email::EmailAdapter;
pub use messenger::MessengerAdapter;
pub use registry::ChannelRegistry;
pub use retry::{RetryPolicy, send_with_retry};
pub use telegram::TelegramAdapter;
pub use traits::{ChannelAdapter, ChannelStatus, DeliveryResult, InboundRequest, SendOptions};
pub use whatsapp::WhatsAppAdapter;
