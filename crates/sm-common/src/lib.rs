pub mod config;
pub mod events;

pub use config::ServerConfig;
pub use events::EventBus;
