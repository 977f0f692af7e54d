//! Submission controller for the auth forms.
//!
//! `FormFlow` owns the visible form state (values, `submitting`, field errors,
//! the banner message) and runs one submission at a time:
//!
//! 1. clear the previous attempt's errors and validate locally
//! 2. mark the form as submitting
//! 3. call the auth API through the form's `FormAction`, which also drives
//!    the session store for login and registration
//! 4. write the outcome back to the form and clear `submitting`
//!
//! A submission holds only a weak reference to the form state. If the form
//! is dropped while a request is in flight, the result is still applied to
//! the session store but the torn-down form is left alone.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::api::{Acknowledgement, AuthApi, AuthError, AuthResponse, Credentials, Registration};
use crate::auth::{Session, SessionStatus, SessionStore, TransitionError};

use super::validation::{
    FieldErrors, FormValues, Rule, Ruleset, MAX_EMAIL_LENGTH, MAX_PASSWORD_LENGTH,
    MIN_PASSWORD_LENGTH,
};

/// Fields wiped from the form after every attempt.
const SECRET_FIELDS: &[&str] = &["password", "confirm_password"];

const RESET_NOTICE: &str = "If an account exists for that email, a reset link is on its way.";

const BUSY_MESSAGE: &str = "A sign-in attempt is already in progress.";

const SIGNED_IN_MESSAGE: &str = "You are already signed in. Sign out first to switch accounts.";

// ============================================================================
// Outcomes and State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubmitStatus {
    #[default]
    Idle,
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Success {
    /// Login or registration completed; the session snapshot after it
    Authenticated(Session),
    ResetRequested(Acknowledgement),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Local validation failed; nothing was sent
    Invalid(FieldErrors),
    /// Another submission or authentication attempt is already in flight
    Busy,
    /// The session is already authenticated; nothing was sent
    AlreadySignedIn,
    /// The form was torn down before the submission started
    Cancelled,
    Succeeded(Success),
    Failed(AuthError),
}

/// Everything a form view renders.
#[derive(Debug, Clone, Default)]
pub struct FormState {
    pub values: FormValues,
    pub submitting: bool,
    pub status: SubmitStatus,
    pub field_errors: FieldErrors,
    /// Single top-level error banner for the last attempt
    pub submit_error: Option<String>,
    /// Informational message after success (e.g. reset link sent)
    pub notice: Option<String>,
}

// ============================================================================
// Actions
// ============================================================================

/// What a particular form does on submit.
#[async_trait]
pub trait FormAction: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn rules(&self) -> Ruleset;

    /// Perform the request. Never returns `Invalid` or `Cancelled`.
    async fn perform(
        &self,
        api: &dyn AuthApi,
        session: &SessionStore,
        values: &FormValues,
    ) -> SubmitOutcome;
}

pub struct LoginAction;

#[async_trait]
impl FormAction for LoginAction {
    fn name(&self) -> &'static str {
        "login"
    }

    fn rules(&self) -> Ruleset {
        Ruleset::new()
            .field("email", [Rule::Required, Rule::Email, Rule::MaxLength(MAX_EMAIL_LENGTH)])
            .field("password", [Rule::Required, Rule::MaxLength(MAX_PASSWORD_LENGTH)])
    }

    async fn perform(
        &self,
        api: &dyn AuthApi,
        session: &SessionStore,
        values: &FormValues,
    ) -> SubmitOutcome {
        let credentials = Credentials {
            email: values.trimmed("email").to_string(),
            password: values.get("password").to_string(),
        };
        authenticate(session, api.login(&credentials)).await
    }
}

pub struct RegisterAction;

impl RegisterAction {
    const KNOWN_FIELDS: &'static [&'static str] =
        &["email", "password", "confirm_password", "name"];

    fn registration(values: &FormValues) -> Registration {
        let name = values.trimmed("name");
        Registration {
            email: values.trimmed("email").to_string(),
            password: values.get("password").to_string(),
            name: (!name.is_empty()).then(|| name.to_string()),
            extra: values
                .others(Self::KNOWN_FIELDS)
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl FormAction for RegisterAction {
    fn name(&self) -> &'static str {
        "register"
    }

    fn rules(&self) -> Ruleset {
        Ruleset::new()
            .field("email", [Rule::Required, Rule::Email, Rule::MaxLength(MAX_EMAIL_LENGTH)])
            .field(
                "password",
                [
                    Rule::Required,
                    Rule::MinLength(MIN_PASSWORD_LENGTH),
                    Rule::MaxLength(MAX_PASSWORD_LENGTH),
                ],
            )
            .field("confirm_password", [Rule::Required, Rule::Matches("password")])
            .field("name", [Rule::MaxLength(100)])
    }

    async fn perform(
        &self,
        api: &dyn AuthApi,
        session: &SessionStore,
        values: &FormValues,
    ) -> SubmitOutcome {
        let registration = Self::registration(values);
        authenticate(session, api.register(&registration)).await
    }
}

pub struct PasswordResetAction;

#[async_trait]
impl FormAction for PasswordResetAction {
    fn name(&self) -> &'static str {
        "forgot_password"
    }

    fn rules(&self) -> Ruleset {
        Ruleset::new().field("email", [Rule::Required, Rule::Email, Rule::MaxLength(MAX_EMAIL_LENGTH)])
    }

    async fn perform(
        &self,
        api: &dyn AuthApi,
        _session: &SessionStore,
        values: &FormValues,
    ) -> SubmitOutcome {
        match api.request_password_reset(values.trimmed("email")).await {
            Ok(ack) => SubmitOutcome::Succeeded(Success::ResetRequested(ack)),
            Err(err) => SubmitOutcome::Failed(err),
        }
    }
}

/// Run an authentication request inside a session login attempt.
///
/// The attempt is opened before the request is sent, so a second concurrent
/// attempt is refused without touching the network. If this future is
/// dropped mid-request the attempt guard fails the session.
async fn authenticate<F>(session: &SessionStore, request: F) -> SubmitOutcome
where
    F: Future<Output = Result<AuthResponse, AuthError>>,
{
    let attempt = match session.begin_attempt() {
        Ok(attempt) => attempt,
        Err(
            e @ TransitionError::NotAllowed {
                from: SessionStatus::Authenticated,
                ..
            },
        ) => {
            debug!(error = %e, "Authentication attempt refused, already signed in");
            return SubmitOutcome::AlreadySignedIn;
        }
        Err(e) => {
            debug!(error = %e, "Authentication attempt refused");
            return SubmitOutcome::Busy;
        }
    };

    match request.await {
        Ok(response) => match attempt.complete(response.user, response.token) {
            Ok(snapshot) if snapshot.is_authenticated() => {
                SubmitOutcome::Succeeded(Success::Authenticated(snapshot))
            }
            Ok(snapshot) => SubmitOutcome::Failed(
                snapshot
                    .last_error()
                    .cloned()
                    .unwrap_or_else(|| AuthError::ServerError("Login incomplete".to_string())),
            ),
            // Logged out while the request was in flight; the response is stale
            Err(e) => SubmitOutcome::Failed(AuthError::ServerError(e.to_string())),
        },
        Err(err) => {
            if let Err(e) = attempt.fail(err.clone()) {
                debug!(error = %e, "Attempt superseded before failure was recorded");
            }
            SubmitOutcome::Failed(err)
        }
    }
}

// ============================================================================
// FormFlow
// ============================================================================

pub struct FormFlow<A: FormAction> {
    action: Arc<A>,
    api: Arc<dyn AuthApi>,
    session: SessionStore,
    rules: Ruleset,
    state: Arc<Mutex<FormState>>,
}

impl<A: FormAction> FormFlow<A> {
    pub fn new(action: A, api: Arc<dyn AuthApi>, session: SessionStore) -> Self {
        let rules = action.rules();
        Self::with_rules(action, rules, api, session)
    }

    /// Use a custom ruleset instead of the action's default
    pub fn with_rules(action: A, rules: Ruleset, api: Arc<dyn AuthApi>, session: SessionStore) -> Self {
        Self {
            action: Arc::new(action),
            api,
            session,
            rules,
            state: Arc::new(Mutex::new(FormState::default())),
        }
    }

    pub fn set_value(&self, field: &str, value: impl Into<String>) {
        lock(&self.state).values.set(field, value);
    }

    /// Snapshot of the form state
    pub fn state(&self) -> FormState {
        lock(&self.state).clone()
    }

    pub fn is_submitting(&self) -> bool {
        lock(&self.state).submitting
    }

    /// Submit and wait for the outcome.
    ///
    /// Dropping the returned future mid-flight clears `submitting` and fails
    /// any open login attempt.
    pub async fn submit(&self) -> SubmitOutcome {
        self.submission().run().await
    }

    /// Submit on the tokio runtime. The task outlives the form if needed.
    pub fn spawn_submit(&self) -> JoinHandle<SubmitOutcome> {
        tokio::spawn(self.submission().run())
    }

    fn submission(&self) -> Submission<A> {
        Submission {
            action: self.action.clone(),
            api: self.api.clone(),
            session: self.session.clone(),
            rules: self.rules.clone(),
            state: Arc::downgrade(&self.state),
        }
    }

    #[cfg(test)]
    fn state_handle(&self) -> Weak<Mutex<FormState>> {
        Arc::downgrade(&self.state)
    }
}

fn lock(state: &Mutex<FormState>) -> MutexGuard<'_, FormState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything one submission needs, detached from the form's lifetime.
struct Submission<A: FormAction> {
    action: Arc<A>,
    api: Arc<dyn AuthApi>,
    session: SessionStore,
    rules: Ruleset,
    state: Weak<Mutex<FormState>>,
}

impl<A: FormAction> Submission<A> {
    async fn run(self) -> SubmitOutcome {
        let name = self.action.name();

        let values = {
            let Some(state) = self.state.upgrade() else {
                return SubmitOutcome::Cancelled;
            };
            let mut state = lock(&state);
            if state.submitting {
                debug!(form = name, "Submission ignored, already submitting");
                return SubmitOutcome::Busy;
            }

            // Errors never carry over from a previous attempt
            state.field_errors = FieldErrors::new();
            state.submit_error = None;
            state.notice = None;

            if let Err(errors) = self.rules.validate(&state.values) {
                debug!(form = name, fields = errors.len(), "Local validation failed");
                state.field_errors = errors.clone();
                state.status = SubmitStatus::Failed;
                return SubmitOutcome::Invalid(errors);
            }

            state.submitting = true;
            state.status = SubmitStatus::Pending;
            state.values.clone()
        };

        let _submitting = SubmittingGuard {
            state: self.state.clone(),
        };

        let outcome = self
            .action
            .perform(self.api.as_ref(), &self.session, &values)
            .await;

        match outcome {
            SubmitOutcome::Succeeded(_) => info!(form = name, "Submission succeeded"),
            SubmitOutcome::Failed(ref err) => error!(form = name, error = %err, "Submission failed"),
            _ => debug!(form = name, outcome = ?outcome, "Submission finished"),
        }

        match self.state.upgrade() {
            Some(state) => apply_outcome(&mut lock(&state), &outcome),
            None => debug!(form = name, "Form torn down before submission resolved"),
        }
        outcome
    }
}

fn apply_outcome(state: &mut FormState, outcome: &SubmitOutcome) {
    state.submitting = false;
    for field in SECRET_FIELDS {
        state.values.clear(field);
    }

    match outcome {
        SubmitOutcome::Succeeded(Success::Authenticated(_)) => {
            state.status = SubmitStatus::Succeeded;
        }
        SubmitOutcome::Succeeded(Success::ResetRequested(ack)) => {
            state.status = SubmitStatus::Succeeded;
            state.notice = Some(ack.message.clone().unwrap_or_else(|| RESET_NOTICE.to_string()));
        }
        SubmitOutcome::Failed(err) => {
            state.status = SubmitStatus::Failed;
            if let AuthError::ValidationFailed(fields) = err {
                state.field_errors = fields.clone();
            }
            state.submit_error = Some(err.user_message());
        }
        SubmitOutcome::Busy => {
            state.status = SubmitStatus::Failed;
            state.submit_error = Some(BUSY_MESSAGE.to_string());
        }
        SubmitOutcome::AlreadySignedIn => {
            state.status = SubmitStatus::Failed;
            state.submit_error = Some(SIGNED_IN_MESSAGE.to_string());
        }
        SubmitOutcome::Invalid(_) | SubmitOutcome::Cancelled => {
            state.status = SubmitStatus::Idle;
        }
    }
}

/// Clears `submitting` however the submission ends, including cancellation
/// and panics inside the request.
struct SubmittingGuard {
    state: Weak<Mutex<FormState>>,
}

impl Drop for SubmittingGuard {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            let mut state = lock(&state);
            if state.submitting {
                state.submitting = false;
                if state.status == SubmitStatus::Pending {
                    state.status = SubmitStatus::Idle;
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
