//! Encrypted metadata index: the source of truth for CloudFS.
//!
//! `EncryptedStore` owns the SQLCipher-backed connection, `Index` exposes
//! typed operations over the schema, and `Journal` is the write-ahead log
//! that every mutation narrates through.

pub mod index;
pub mod journal;
pub mod schema;
pub mod store;

pub use index::{Index, NewEntry, NewPlacement, NewProvider, NewVersion};
pub use journal::{Journal, OpId};
pub use store::{map_sqlite, EncryptedStore, SqlExt};
