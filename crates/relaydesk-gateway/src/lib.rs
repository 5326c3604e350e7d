pub mod api;
pub mod audit;
pub mod bootstrap;
pub mod error;
pub mod hub;
pub mod ingest;
pub mod resolver;
pub mod router;
pub mod server;
pub mod state;
pub mod webhooks;
pub mod ws;

pub use error::ApiError;
pub use hub::BroadcastHub;
pub use server::GatewayServer;
pub use state::{AppState, SharedState};
