//! Core library for the netpulse monitoring dashboard.
//!
//! Everything the dashboard needs to decide *who is logged in* lives here:
//!
//! - `auth`: the session state machine and durable token storage
//! - `api`: the HTTP client for the authentication endpoints
//! - `guard`: guest-only and authenticated-only route decisions
//! - `form`: validation and the async submission controller for auth forms
//! - `context`: wiring of the above from a `Config`
//!
//! The session store is the single source of truth. Forms drive it through
//! the auth client, guards observe it, and only the credential store touches
//! durable storage.

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod form;
pub mod guard;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{AuthApi, AuthClient, AuthError, ErrorKind};
pub use auth::{CredentialStore, Identity, Session, SessionStatus, SessionStore, User};
pub use config::Config;
pub use context::AuthContext;
pub use guard::{AuthenticatedOnly, GuardDecision, GuestOnly, Route, RouteGuard};
