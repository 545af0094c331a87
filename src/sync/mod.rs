pub mod feed;
pub mod http;
pub mod memory;
pub mod synchronizer;

pub use feed::{ChangeFeed, FeedEvent, FeedRequest, FeedStream, TrackedTable};
pub use http::{HttpChangeFeed, SHAPE_HANDLE_HEADER, SHAPE_OFFSET_HEADER};
pub use memory::MemoryChangeFeed;
pub use synchronizer::{SyncSession, Synchronizer, TableSubscription};
