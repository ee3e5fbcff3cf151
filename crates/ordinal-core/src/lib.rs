//! Ordinal Core - hashes, keys, signatures, and the value types shared by
//! the consensus and node crates.

pub mod crypto;
pub mod error;
pub mod serialize;
pub mod types;

pub use crypto::{hash_blake3, hash_tagged, sign, verify, Hash, KeyPair, PublicKey, SecretKey, Sig};
pub use error::CoreError;
pub use types::*;
