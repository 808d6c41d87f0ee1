//! Typed index store.
//!
//! Records live in [`Table`]s: named namespaces with an order-preserving key
//! encoding and a compact value encoding. Backends only deal in raw bytes
//! ([`IndexStore`]); the typed surface ([`IndexRead`], [`IndexTransaction`])
//! is layered on top so every backend gets it for free.
//!
//! Writes are buffered in an [`IndexTransaction`] and applied atomically on
//! commit. Nothing is visible to other readers before then.

mod codec;
mod memory;
pub mod migration;
mod store;
mod table;
mod transaction;

pub use codec::{Compress, Decode, Decompress, Encode, FixedSize, Key, Value};
pub use memory::MemoryStore;
pub use store::{IndexRead, IndexStore, RawRead, WriteBatch};
pub use table::{Query, Table};
pub use transaction::IndexTransaction;

#[doc(hidden)]
pub mod __private {
    pub use postcard;
}

/// Number of entries fetched from a backend per iteration page.
pub const ITERATE_PAGE_SIZE: usize = 256;

/// Database error type.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DatabaseError {
    /// Failed to decode a key or value from a table.
    #[error("failed to decode an entry from a table")]
    Decode,
    /// Failed to encode a value for a table.
    #[error("failed to encode a value: {0}")]
    Encode(String),
    /// Underlying I/O failed; the operation may succeed if retried.
    #[error("io error: {0}")]
    Io(String),
    /// The store has been closed.
    #[error("store is closed")]
    Closed,
    /// Other unspecified error.
    #[error("{_0}")]
    Other(String),
}

impl DatabaseError {
    /// Whether retrying the failed operation can succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Declares zero-sized [`Table`] types.
///
/// ```ignore
/// tables! {
///     /// Schema version marker.
///     pub SchemaVersion: () => u64 = "schema_version";
/// }
/// ```
#[macro_export]
macro_rules! tables {
    ($( $(#[$meta:meta])* $vis:vis $name:ident : $key:ty => $value:ty = $table:literal; )*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, Default)]
            $vis struct $name;

            impl $crate::Table for $name {
                const NAME: &'static str = $table;
                type Key = $key;
                type Value = $value;
            }
        )*
    };
}
