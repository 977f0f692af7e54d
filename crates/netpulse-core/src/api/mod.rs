//! REST client module for the netpulse authentication API.
//!
//! This module provides the `AuthClient` for the login, registration,
//! password-reset and logout endpoints, plus the `AuthError` vocabulary
//! every failure is normalized into before it reaches a form or the
//! session store.
//!
//! Authenticated calls use a bearer token issued by `POST /auth/login`.

pub mod client;
pub mod error;

pub use client::{Acknowledgement, AuthApi, AuthClient, AuthResponse, Credentials, Registration};
pub use error::{AuthError, ErrorKind};
