pub mod error;
pub mod row;
pub mod signal;
pub mod value;

pub use error::{Result, SyncError};
pub use row::{QueryResult, Row};
pub use signal::{Signal, SignalSubscription};
pub use value::Value;
