//! Authentication module for managing the dashboard session.
//!
//! This module provides:
//! - `SessionStore`: the session state machine and listener registry
//! - `CredentialStore`: durable storage of the session token
//!
//! The session store is the only component that writes the credential store.

pub mod credentials;
pub mod session;

pub use credentials::{
    CredentialBackend, CredentialRecord, CredentialStore, FileBackend, KeyringBackend,
    MemoryBackend,
};
pub use session::{
    Identity, LoginAttempt, Session, SessionStatus, SessionStore, SessionSummary, Subscription,
    TransitionError, User,
};
