pub mod item;
pub mod store;

pub use item::{CacheItem, CacheKey};
pub use store::{CacheStats, EntityCache};
