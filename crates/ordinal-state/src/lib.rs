//! Ordinal State - key-value storage for consensus persistence
//!
//! Backends stage writes and apply them atomically on commit. Callers group
//! related writes into a [`WriteBatch`] so that a crash never leaves a
//! partially applied transition behind.

pub mod error;
pub mod storage;

pub use error::StateError;
pub use storage::{BatchOp, FileStorage, MemoryStorage, Storage, WriteBatch};
