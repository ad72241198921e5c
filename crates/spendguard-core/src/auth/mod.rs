//! Authentication state: credentials, expiry checks and the session store.
//!
//! This module provides:
//! - `credential`: offline decoding of bearer tokens
//! - `expiry`: advisory "is it expired or about to be" checks
//! - `SessionStore`: the single owner of the access/refresh token pair
//! - `SessionPersistence`: file, keychain and in-memory backends
//!
//! Tokens are replaced as a pair; readers always see a consistent snapshot.

pub mod credential;
pub mod expiry;
pub mod persistence;
pub mod session;

pub use credential::{CredentialError, DecodedCredential};
pub use persistence::{FilePersistence, KeyringPersistence, MemoryPersistence, SessionPersistence};
pub use session::{Session, SessionStore};
