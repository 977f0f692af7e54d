//! The session state machine.
//!
//! ```text
//! anonymous      --begin_login-->    authenticating
//! authenticating --complete_login--> authenticated
//! authenticating --fail_login-->     error
//! error          --begin_login-->    authenticating
//! any            --logout-->         anonymous
//! ```
//!
//! `SessionStore` is created once per process and shared by cloning. It is
//! the only writer of `Session` and the only caller of the credential store.
//! Listeners run synchronously after each transition, in registration order,
//! outside the internal lock. A listener must not drive another transition on
//! the same store; such calls are rejected with `TransitionError::Reentrant`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{AuthError, ErrorKind};

use super::CredentialStore;

// ============================================================================
// Session Data
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionStatus {
    Anonymous,
    Authenticating,
    Authenticated,
    Error,
}

impl SessionStatus {
    /// `authenticated` and `anonymous` are the only states a session rests in.
    pub fn is_stable(&self) -> bool {
        matches!(self, SessionStatus::Anonymous | SessionStatus::Authenticated)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Anonymous => "anonymous",
            SessionStatus::Authenticating => "authenticating",
            SessionStatus::Authenticated => "authenticated",
            SessionStatus::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            name: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.id)
    }
}

/// Who the token belongs to.
///
/// A token restored from storage is trusted optimistically before the user
/// record behind it has been fetched; that window is `Pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "user", rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum Identity {
    Pending,
    Known(User),
}

/// Snapshot of the authentication state.
///
/// Only `SessionStore` constructs these, so `user` and `token` are either
/// both present (authenticated) or both absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    status: SessionStatus,
    user: Option<Identity>,
    token: Option<String>,
    last_error: Option<AuthError>,
    established_at: Option<DateTime<Utc>>,
}

impl Session {
    fn anonymous() -> Self {
        Self {
            status: SessionStatus::Anonymous,
            user: None,
            token: None,
            last_error: None,
            established_at: None,
        }
    }

    fn authenticating() -> Self {
        Self {
            status: SessionStatus::Authenticating,
            ..Self::anonymous()
        }
    }

    fn authenticated(identity: Identity, token: String, established_at: DateTime<Utc>) -> Self {
        Self {
            status: SessionStatus::Authenticated,
            user: Some(identity),
            token: Some(token),
            last_error: None,
            established_at: Some(established_at),
        }
    }

    fn failed(error: AuthError) -> Self {
        Self {
            status: SessionStatus::Error,
            last_error: Some(error),
            ..Self::anonymous()
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_authenticated(&self) -> bool {
        self.status == SessionStatus::Authenticated
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.user.as_ref()
    }

    /// The user record, once known
    pub fn user(&self) -> Option<&User> {
        match self.user {
            Some(Identity::Known(ref user)) => Some(user),
            _ => None,
        }
    }

    /// Authenticated with a token whose user has not been fetched yet
    pub fn identity_pending(&self) -> bool {
        matches!(self.user, Some(Identity::Pending))
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn last_error(&self) -> Option<&AuthError> {
        self.last_error.as_ref()
    }

    pub fn established_at(&self) -> Option<DateTime<Utc>> {
        self.established_at
    }

    /// Checks the snapshot invariants: authenticated iff a non-empty token and
    /// an identity are both present, and an error only in the error state.
    pub fn is_consistent(&self) -> bool {
        let has_token = self.token.as_deref().is_some_and(|t| !t.is_empty());
        let has_user = match self.user {
            Some(Identity::Known(ref user)) => !user.id.is_empty(),
            Some(Identity::Pending) => true,
            None => false,
        };
        let credentials_ok = match self.status {
            SessionStatus::Authenticated => has_token && has_user,
            _ => self.token.is_none() && self.user.is_none(),
        };
        let error_ok = (self.status == SessionStatus::Error) == self.last_error.is_some();
        credentials_ok && error_ok
    }

    /// Serializable view without the token, for the front end and the CLI.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            status: self.status,
            user: self.user().cloned(),
            identity_pending: self.identity_pending(),
            last_error: self.last_error.as_ref().map(AuthError::kind),
            established_at: self.established_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionSummary {
    pub status: SessionStatus,
    pub user: Option<User>,
    pub identity_pending: bool,
    pub last_error: Option<ErrorKind>,
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub established_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Errors
// ============================================================================

/// A transition the store refused. The session is unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("{operation} not allowed while {from}")]
    NotAllowed {
        operation: &'static str,
        from: SessionStatus,
    },

    #[error("{operation} requested from inside a session listener")]
    Reentrant { operation: &'static str },

    #[error("{operation} belongs to an attempt or token that is no longer current")]
    Superseded { operation: &'static str },

    #[error("{operation} requires a user id")]
    EmptyIdentity { operation: &'static str },
}

// ============================================================================
// SessionStore
// ============================================================================

type Listener = Arc<dyn Fn(&Session) + Send + Sync>;

struct Inner {
    session: Session,
    initialized: bool,
    in_flight: u32,
    /// Incremented by every `begin_login`; ties a `LoginAttempt` to its attempt
    attempt_id: u64,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
    /// Threads currently running listeners for this store
    notifying: Vec<ThreadId>,
}

struct Shared {
    inner: Mutex<Inner>,
    credentials: CredentialStore,
    token_max_age_minutes: Option<i64>,
}

/// Process-wide authentication state. Clones share the same state.
#[derive(Clone)]
pub struct SessionStore {
    shared: Arc<Shared>,
}

impl SessionStore {
    pub fn new(credentials: CredentialStore) -> Self {
        Self::with_token_max_age(credentials, None)
    }

    /// Store that discards persisted tokens older than `max_age_minutes`
    /// when initializing.
    pub fn with_token_max_age(credentials: CredentialStore, max_age_minutes: Option<i64>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    session: Session::anonymous(),
                    initialized: false,
                    in_flight: 0,
                    attempt_id: 0,
                    listeners: Vec::new(),
                    next_listener_id: 0,
                    notifying: Vec::new(),
                }),
                credentials,
                token_max_age_minutes: max_age_minutes,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking listener runs outside the lock, so poisoning can only
        // come from a panic mid-transition; the session is still whole.
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `apply` under the lock, then notify listeners with the result.
    fn transition<F>(&self, operation: &'static str, apply: F) -> Result<Session, TransitionError>
    where
        F: FnOnce(&mut Inner, &Shared) -> Result<(), TransitionError>,
    {
        let current = thread::current().id();
        let (snapshot, listeners) = {
            let mut inner = self.lock();
            if inner.notifying.contains(&current) {
                warn!(operation, "Session transition attempted from a listener, rejected");
                return Err(TransitionError::Reentrant { operation });
            }
            let from = inner.session.status;
            apply(&mut *inner, &*self.shared)?;
            debug_assert!(inner.session.is_consistent());
            debug!(operation, %from, to = %inner.session.status, "Session transition");

            inner.notifying.push(current);
            let listeners: Vec<Listener> = inner.listeners.iter().map(|(_, l)| l.clone()).collect();
            (inner.session.clone(), listeners)
        };

        let _notifying = NotifyingGuard {
            store: self,
            thread: current,
        };
        for listener in &listeners {
            listener(&snapshot);
        }
        Ok(snapshot)
    }

    /// Restore the session from the credential store.
    ///
    /// A persisted token yields `authenticated` with a `Pending` identity; no
    /// network call is made. Only the first call has any effect; later calls
    /// return the current session without notifying listeners.
    pub fn initialize(&self) -> Session {
        let result = self.transition("initialize", |inner, shared| {
            if inner.initialized {
                return Err(TransitionError::NotAllowed {
                    operation: "initialize",
                    from: inner.session.status,
                });
            }
            inner.initialized = true;

            let record = match shared.credentials.load_record() {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "Failed to read persisted token, starting anonymous");
                    None
                }
            };

            inner.session = match record {
                Some(record) if record.token.is_empty() => Session::anonymous(),
                Some(record)
                    if shared
                        .token_max_age_minutes
                        .is_some_and(|max| record.age_minutes() > max) =>
                {
                    info!(age_minutes = record.age_minutes(), "Persisted token expired, discarding");
                    if let Err(e) = shared.credentials.clear() {
                        warn!(error = %e, "Failed to clear expired token");
                    }
                    Session::anonymous()
                }
                Some(record) => {
                    debug!("Restored persisted token, identity pending");
                    Session::authenticated(Identity::Pending, record.token, record.saved_at)
                }
                None => Session::anonymous(),
            };
            Ok(())
        });
        result.unwrap_or_else(|_| self.current_session())
    }

    /// `anonymous | error -> authenticating`. At most one attempt may be in
    /// flight; a second call is refused and leaves the session untouched.
    pub fn begin_login(&self) -> Result<Session, TransitionError> {
        self.begin().map(|(session, _)| session)
    }

    /// `begin_login` returning a guard that fails the attempt if it is
    /// dropped before being resolved.
    pub fn begin_attempt(&self) -> Result<LoginAttempt, TransitionError> {
        let (_, attempt_id) = self.begin()?;
        Ok(LoginAttempt {
            store: self.clone(),
            attempt_id,
            resolved: false,
        })
    }

    fn begin(&self) -> Result<(Session, u64), TransitionError> {
        let mut attempt_id = 0;
        let session = self.transition("begin_login", |inner, _| {
            match inner.session.status {
                SessionStatus::Anonymous | SessionStatus::Error => {}
                from => {
                    return Err(TransitionError::NotAllowed {
                        operation: "begin_login",
                        from,
                    })
                }
            }
            inner.attempt_id += 1;
            inner.in_flight = 1;
            inner.session = Session::authenticating();
            attempt_id = inner.attempt_id;
            Ok(())
        })?;
        Ok((session, attempt_id))
    }

    /// `authenticating -> authenticated`, persisting the token.
    ///
    /// A response missing the user id or token cannot authenticate; the
    /// attempt resolves to `error` instead.
    pub fn complete_login(
        &self,
        user: User,
        token: impl Into<String>,
    ) -> Result<Session, TransitionError> {
        self.complete(None, user, token.into())
    }

    fn complete(
        &self,
        attempt: Option<u64>,
        user: User,
        token: String,
    ) -> Result<Session, TransitionError> {
        self.transition("complete_login", |inner, shared| {
            Self::require_attempt(inner, "complete_login", attempt)?;
            inner.in_flight = 0;

            if user.id.trim().is_empty() || token.is_empty() {
                warn!("Login response missing user id or token");
                Self::clear_credentials(shared);
                inner.session = Session::failed(AuthError::ServerError(
                    "Login response missing user or token".to_string(),
                ));
                return Ok(());
            }

            if let Err(e) = shared.credentials.save(&token) {
                warn!(error = %e, "Failed to persist session token");
            }
            info!(user_id = %user.id, "Login successful");
            inner.session = Session::authenticated(Identity::Known(user), token, Utc::now());
            Ok(())
        })
    }

    /// `authenticating -> error`. Any stale persisted token is cleared.
    pub fn fail_login(&self, error: AuthError) -> Result<Session, TransitionError> {
        self.fail_with(None, error)
    }

    fn fail_with(&self, attempt: Option<u64>, error: AuthError) -> Result<Session, TransitionError> {
        self.transition("fail_login", |inner, shared| {
            Self::require_attempt(inner, "fail_login", attempt)?;
            Self::fail(inner, shared, error);
            Ok(())
        })
    }

    fn fail(inner: &mut Inner, shared: &Shared, error: AuthError) {
        inner.in_flight = 0;
        Self::clear_credentials(shared);
        info!(kind = ?error.kind(), "Login failed");
        inner.session = Session::failed(error);
    }

    /// Any state `-> anonymous`, clearing the persisted token. Idempotent.
    ///
    /// Called from inside a listener it is refused and the current session is
    /// returned unchanged.
    pub fn logout(&self) -> Session {
        self.reset("logout")
    }

    /// The backend refused the current token. Same effect as `logout`.
    pub fn reject_credential(&self) -> Session {
        info!("Credential rejected by server, resetting session");
        self.reset("reject_credential")
    }

    fn reset(&self, operation: &'static str) -> Session {
        let result = self.transition(operation, |inner, shared| {
            inner.in_flight = 0;
            Self::clear_credentials(shared);
            inner.session = Session::anonymous();
            Ok(())
        });
        result.unwrap_or_else(|_| self.current_session())
    }

    /// `reject_credential` scoped to `token`. Refused with `Superseded` when
    /// the session no longer holds that token, so a late rejection of an old
    /// token cannot log out a newer session.
    pub fn reject_token(&self, token: &str) -> Result<Session, TransitionError> {
        self.transition("reject_credential", |inner, shared| {
            Self::require_token(inner, "reject_credential", token)?;
            info!("Credential rejected by server, resetting session");
            inner.in_flight = 0;
            Self::clear_credentials(shared);
            inner.session = Session::anonymous();
            Ok(())
        })
    }

    /// Replace the identity of an authenticated session, typically resolving
    /// a `Pending` identity after the user record was fetched with `token`.
    ///
    /// Refused with `Superseded` if the session changed hands while the
    /// record was being fetched.
    pub fn refresh_user(&self, token: &str, user: User) -> Result<Session, TransitionError> {
        self.transition("refresh_user", |inner, _| {
            Self::require_token(inner, "refresh_user", token)?;
            if user.id.trim().is_empty() {
                return Err(TransitionError::EmptyIdentity {
                    operation: "refresh_user",
                });
            }
            inner.session.user = Some(Identity::Known(user));
            Ok(())
        })
    }

    pub fn current_session(&self) -> Session {
        self.lock().session.clone()
    }

    /// Authentication attempts in flight (0 or 1)
    pub fn in_flight(&self) -> u32 {
        self.lock().in_flight
    }

    /// Register a listener called after every transition.
    ///
    /// The listener stays registered until the returned `Subscription` is
    /// dropped or `unsubscribe`d.
    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        Subscription {
            shared: Arc::downgrade(&self.shared),
            id,
            active: true,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// The session must be authenticating and, when resolving through a
    /// `LoginAttempt`, still on that attempt.
    fn require_attempt(
        inner: &Inner,
        operation: &'static str,
        attempt: Option<u64>,
    ) -> Result<(), TransitionError> {
        if inner.session.status != SessionStatus::Authenticating {
            return Err(TransitionError::NotAllowed {
                operation,
                from: inner.session.status,
            });
        }
        match attempt {
            Some(id) if id != inner.attempt_id => Err(TransitionError::Superseded { operation }),
            _ => Ok(()),
        }
    }

    /// The session must be authenticated with exactly `token`.
    fn require_token(
        inner: &Inner,
        operation: &'static str,
        token: &str,
    ) -> Result<(), TransitionError> {
        if inner.session.status != SessionStatus::Authenticated {
            return Err(TransitionError::NotAllowed {
                operation,
                from: inner.session.status,
            });
        }
        if inner.session.token.as_deref() != Some(token) {
            return Err(TransitionError::Superseded { operation });
        }
        Ok(())
    }

    fn clear_credentials(shared: &Shared) {
        if let Err(e) = shared.credentials.clear() {
            warn!(error = %e, "Failed to clear persisted token");
        }
    }
}

/// Clears the reentrancy marker even if a listener panics.
struct NotifyingGuard<'a> {
    store: &'a SessionStore,
    thread: ThreadId,
}

impl Drop for NotifyingGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.store.lock();
        if let Some(pos) = inner.notifying.iter().position(|t| *t == self.thread) {
            inner.notifying.swap_remove(pos);
        }
    }
}

/// Handle returned by `SessionStore::subscribe`.
pub struct Subscription {
    shared: Weak<Shared>,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(shared) = self.shared.upgrade() {
            let mut inner = shared
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// An authentication attempt in flight.
///
/// Resolve it with `complete` or `fail`. If it is dropped unresolved (the
/// request future was cancelled or panicked) the session moves to `error`
/// instead of staying stranded in `authenticating`.
pub struct LoginAttempt {
    store: SessionStore,
    attempt_id: u64,
    resolved: bool,
}

impl LoginAttempt {
    pub fn complete(mut self, user: User, token: impl Into<String>) -> Result<Session, TransitionError> {
        self.resolved = true;
        self.store.complete(Some(self.attempt_id), user, token.into())
    }

    pub fn fail(mut self, error: AuthError) -> Result<Session, TransitionError> {
        self.resolved = true;
        self.store.fail_with(Some(self.attempt_id), error)
    }
}

impl Drop for LoginAttempt {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let aborted = AuthError::ServerError("Login attempt aborted".to_string());
        if self.store.fail_with(Some(self.attempt_id), aborted).is_ok() {
            warn!("Login attempt dropped before resolving");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
