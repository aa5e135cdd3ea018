//! Caching mechanisms for ShardFS
//!
//! Servers keep every directory's partition map in a pinned [`DirectoryCache`];
//! clients memoize name lookups in a TTL-bounded [`NameCache`].

pub mod directory_cache;
pub mod name_cache;
pub mod policy;

pub use directory_cache::{
    CacheEntry, DirPin, DirectoryCache, DirectoryCacheStats, SplitInProgress, SplitSlot,
};
pub use name_cache::{NameCache, NameCacheValue};
pub use policy::CachePolicy;
