pub mod children;
pub mod hosts;
pub mod inventory;
pub mod models;
pub mod orchestrations;
pub mod schema;
pub mod store;
pub mod updates;

pub use models::*;
pub use store::{fmt_ts, now_ts, parse_ts, Store, StoreError, StoreResult};
