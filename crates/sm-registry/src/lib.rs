pub mod dispatch;
pub mod handlers;
pub mod orchestration;
pub mod protocol;
pub mod state;

pub use dispatch::{DispatchConfig, Dispatcher};
pub use handlers::{route_message, HandlerContext};
pub use protocol::Envelope;
pub use state::{ConnectionManager, SessionInfo};
