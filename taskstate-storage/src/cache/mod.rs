//! Named caches: typed key/value views over store partitions.
//!
//! Each named cache is backed by one partition of the persistent store and
//! fronted by exactly one [`InMemoryOverlay`], shared by every
//! [`NamedCache`] handle declared under that name.
//!
//! ```text
//! NamedCache<K, V> ──→ InMemoryOverlay<K, V> ──→ ValueCodec<V> ──→ RawPartition
//!                         (write-through)         (ByType/ByCodec)    (bytes)
//! ```

pub mod codec;
pub mod named;
pub mod overlay;
pub(crate) mod registry;

pub use codec::{CacheKey, CacheValue, CodecError, JsonCodec, ValueCodec, ValueSerialization};
pub use named::NamedCache;
pub use overlay::{InMemoryOverlay, OverlayStats};
