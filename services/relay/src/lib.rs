pub mod config;
pub mod consumer;
pub mod handlers;
pub mod http_api;
pub mod hub;

pub use config::RelayConfig;
pub use consumer::{Consumer, LinkState, MessageHandler};
pub use http_api::{ApiState, build_router};
pub use hub::HubHandle;
