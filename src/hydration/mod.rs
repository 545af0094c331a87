pub mod cache;
mod entry;
pub mod state;

pub use cache::{Hydrated, HydrationCache, HydrationSubscription};
pub use state::{CacheKey, HydratableQuery, HydrationState, Provenance, SsrSnapshot};
