//! Route guards.
//!
//! A guard is a pure decision over a session snapshot: render the protected
//! content, show a neutral pending state, or redirect. `MountedGuard` keeps a
//! guard attached to the session store so the decision is re-evaluated on
//! every transition while the route is shown.
//!
//! Redirects are routine and silent: nothing here produces a user-facing error.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{Session, SessionStatus, SessionStore, Subscription};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Route(String);

impl Route {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Route {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "target", rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum GuardDecision {
    /// Show the guarded content
    Render,
    /// Show a neutral placeholder; an authentication attempt is in flight
    Pending,
    /// Navigate elsewhere instead of rendering
    Redirect(Route),
}

/// Guard configuration. The redirect target is never hard-coded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardOptions {
    pub redirect_to: Route,
}

impl GuardOptions {
    pub fn redirect_to(route: impl Into<String>) -> Self {
        Self {
            redirect_to: Route::new(route),
        }
    }
}

pub trait RouteGuard: Send + Sync {
    fn decide(&self, session: &Session) -> GuardDecision;

    /// Short name for logging
    fn name(&self) -> &'static str;
}

/// For pages only a visitor without a session should see (login, register,
/// forgot password). An authenticated visitor is sent to the dashboard.
#[derive(Debug, Clone)]
pub struct GuestOnly {
    options: GuardOptions,
}

impl GuestOnly {
    pub fn new(options: GuardOptions) -> Self {
        Self { options }
    }
}

impl RouteGuard for GuestOnly {
    fn decide(&self, session: &Session) -> GuardDecision {
        match session.status() {
            SessionStatus::Authenticated => {
                GuardDecision::Redirect(self.options.redirect_to.clone())
            }
            _ => GuardDecision::Render,
        }
    }

    fn name(&self) -> &'static str {
        "guest_only"
    }
}

/// For dashboard pages. Anonymous and failed sessions go to the login page;
/// an in-flight attempt shows the pending state to avoid redirect flicker.
#[derive(Debug, Clone)]
pub struct AuthenticatedOnly {
    options: GuardOptions,
}

impl AuthenticatedOnly {
    pub fn new(options: GuardOptions) -> Self {
        Self { options }
    }
}

impl RouteGuard for AuthenticatedOnly {
    fn decide(&self, session: &Session) -> GuardDecision {
        match session.status() {
            SessionStatus::Authenticated => GuardDecision::Render,
            SessionStatus::Authenticating => GuardDecision::Pending,
            SessionStatus::Anonymous | SessionStatus::Error => {
                GuardDecision::Redirect(self.options.redirect_to.clone())
            }
        }
    }

    fn name(&self) -> &'static str {
        "authenticated_only"
    }
}

/// Performs navigation when a mounted guard decides to redirect.
///
/// Called from inside a session listener, so it must not drive session
/// transitions itself.
pub trait Navigator: Send + Sync {
    fn navigate(&self, to: &Route);
}

impl<F> Navigator for F
where
    F: Fn(&Route) + Send + Sync,
{
    fn navigate(&self, to: &Route) {
        self(to)
    }
}

/// A guard attached to the session store for as long as it is alive.
pub struct MountedGuard {
    decision: Arc<Mutex<Option<GuardDecision>>>,
    _subscription: Subscription,
}

impl MountedGuard {
    pub fn mount<G, N>(store: &SessionStore, guard: G, navigator: N) -> Self
    where
        G: RouteGuard + 'static,
        N: Navigator + 'static,
    {
        let decision = Arc::new(Mutex::new(None));
        let evaluator = Arc::new(Evaluator {
            guard,
            navigator,
            decision: decision.clone(),
        });

        // Subscribe before the first evaluation so no transition is missed
        let listener = evaluator.clone();
        let subscription = store.subscribe(move |session| listener.evaluate(session));
        evaluator.evaluate(&store.current_session());

        Self {
            decision,
            _subscription: subscription,
        }
    }

    /// The latest decision
    pub fn decision(&self) -> GuardDecision {
        self.decision
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .unwrap_or(GuardDecision::Pending)
    }

    pub fn unmount(self) {}
}

struct Evaluator<G, N> {
    guard: G,
    navigator: N,
    decision: Arc<Mutex<Option<GuardDecision>>>,
}

impl<G: RouteGuard, N: Navigator> Evaluator<G, N> {
    /// Store the new decision; navigate only when it changed to a redirect.
    fn evaluate(&self, session: &Session) {
        let next = self.guard.decide(session);
        {
            let mut current = self
                .decision
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if current.as_ref() == Some(&next) {
                return;
            }
            *current = Some(next.clone());
        }

        debug!(guard = self.guard.name(), status = %session.status(), decision = ?next, "Guard re-evaluated");
        if let GuardDecision::Redirect(ref route) = next {
            self.navigator.navigate(route);
        }
    }
}
