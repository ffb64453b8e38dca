pub mod enums;
pub mod messages;
pub mod operations;
pub mod stats;

pub use enums::{Priority, QueueDirection, QueueStatus};
pub use messages::create_command_message;
pub use operations::{EnqueueRequest, QueueError, QueueOps, QueueResult};
pub use stats::QueueStatsSnapshot;
