//! Wiring of the session subsystem from a `Config`.
//!
//! `AuthContext` is created once at startup. It owns the process-wide
//! `SessionStore` (initialized from the credential store on construction)
//! and hands out guards and forms bound to it.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::api::{AuthApi, AuthClient, AuthError};
use crate::auth::{CredentialStore, Session, SessionStore};
use crate::config::Config;
use crate::form::{FormFlow, LoginAction, PasswordResetAction, RegisterAction};
use crate::guard::{AuthenticatedOnly, GuardOptions, GuestOnly};

pub struct AuthContext {
    config: Config,
    session: SessionStore,
    api: Arc<dyn AuthApi>,
}

impl AuthContext {
    /// Build the credential store and HTTP client selected by `config`
    pub fn from_config(config: Config) -> Result<Self> {
        let credentials = CredentialStore::from_config(&config)?;
        let api: Arc<dyn AuthApi> = Arc::new(AuthClient::new(&config)?);
        Ok(Self::with_parts(config, credentials, api))
    }

    pub fn with_parts(config: Config, credentials: CredentialStore, api: Arc<dyn AuthApi>) -> Self {
        let session = SessionStore::with_token_max_age(credentials, config.token_max_age_minutes);
        let restored = session.initialize();
        debug!(status = %restored.status(), "Session initialized");

        Self {
            config,
            session,
            api,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn api(&self) -> Arc<dyn AuthApi> {
        self.api.clone()
    }

    /// Guard for the login, register and forgot-password pages
    pub fn guest_only(&self) -> GuestOnly {
        GuestOnly::new(GuardOptions::redirect_to(self.config.dashboard_route.clone()))
    }

    /// Guard for dashboard pages
    pub fn authenticated_only(&self) -> AuthenticatedOnly {
        AuthenticatedOnly::new(GuardOptions::redirect_to(self.config.login_route.clone()))
    }

    pub fn login_form(&self) -> FormFlow<LoginAction> {
        FormFlow::new(LoginAction, self.api.clone(), self.session.clone())
    }

    pub fn register_form(&self) -> FormFlow<RegisterAction> {
        FormFlow::new(RegisterAction, self.api.clone(), self.session.clone())
    }

    pub fn password_reset_form(&self) -> FormFlow<PasswordResetAction> {
        FormFlow::new(PasswordResetAction, self.api.clone(), self.session.clone())
    }

    /// Log out locally, then tell the server. The server call cannot undo or
    /// block the local logout.
    pub async fn logout(&self) -> Session {
        let token = self.session.current_session().token().map(str::to_string);
        let session = self.session.logout();
        if let Some(token) = token {
            self.api.logout(&token).await;
        }
        session
    }

    /// Resolve a `Pending` identity restored from storage.
    ///
    /// A rejected token resets the session to anonymous. Other failures keep
    /// the optimistic session so a transient outage does not log anyone out.
    /// A response for a token the session no longer holds is discarded.
    pub async fn refresh_identity(&self) -> Result<Session, AuthError> {
        let current = self.session.current_session();
        let Some(token) = current.token().filter(|_| current.identity_pending()) else {
            return Ok(current);
        };

        match self.api.fetch_current_user(token).await {
            Ok(user) => match self.session.refresh_user(token, user) {
                Ok(session) => Ok(session),
                Err(e) => {
                    debug!(error = %e, "Session changed while fetching identity");
                    Ok(self.session.current_session())
                }
            },
            Err(AuthError::InvalidCredentials) => match self.session.reject_token(token) {
                Ok(_) => Err(AuthError::InvalidCredentials),
                Err(e) => {
                    debug!(error = %e, "Session changed while fetching identity");
                    Ok(self.session.current_session())
                }
            },
            Err(err) => {
                warn!(error = %err, "Could not resolve identity, keeping restored session");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;

    use crate::auth::{SessionStatus, User};
    use crate::guard::{GuardDecision, Route, RouteGuard};
    use crate::testing::{wait_until, FakeApi};

    fn context(api: FakeApi, credentials: &CredentialStore) -> (AuthContext, Arc<FakeApi>) {
        let api = Arc::new(api);
        let ctx = AuthContext::with_parts(Config::default(), credentials.clone(), api.clone());
        (ctx, api)
    }

    #[test]
    fn test_fresh_start_is_anonymous_and_guarded() {
        let credentials = CredentialStore::memory();
        let (ctx, _) = context(FakeApi::succeeding(), &credentials);
        let session = ctx.session().current_session();

        assert_eq!(session.status(), SessionStatus::Anonymous);
        assert_eq!(ctx.guest_only().decide(&session), GuardDecision::Render);
        assert_eq!(
            ctx.authenticated_only().decide(&session),
            GuardDecision::Redirect(Route::from("/login"))
        );
    }

    #[test]
    fn test_guard_targets_follow_config() {
        let credentials = CredentialStore::memory();
        credentials.save("tok").expect("save");
        let config = Config {
            dashboard_route: "/status".to_string(),
            ..Config::default()
        };
        let ctx = AuthContext::with_parts(config, credentials, Arc::new(FakeApi::succeeding()));

        let session = ctx.session().current_session();
        assert_eq!(
            ctx.guest_only().decide(&session),
            GuardDecision::Redirect(Route::from("/status"))
        );
    }

    #[tokio::test]
    async fn test_login_form_then_logout() {
        let credentials = CredentialStore::memory();
        let (ctx, api) = context(FakeApi::succeeding(), &credentials);

        let form = ctx.login_form();
        form.set_value("email", "ops@example.com");
        form.set_value("password", "pw");
        form.submit().await;
        assert!(ctx.session().current_session().is_authenticated());

        let session = ctx.logout().await;
        assert_eq!(session.status(), SessionStatus::Anonymous);
        assert!(!credentials.has_token());
        assert_eq!(api.logouts(), 1);

        // Already anonymous: no server call, still anonymous
        ctx.logout().await;
        assert_eq!(api.logouts(), 1);
        assert_eq!(ctx.session().current_session().status(), SessionStatus::Anonymous);
    }

    #[tokio::test]
    async fn test_refresh_identity_resolves_pending_user() {
        let credentials = CredentialStore::memory();
        credentials.save("restored").expect("save");
        let (ctx, _) = context(FakeApi::succeeding(), &credentials);
        assert!(ctx.session().current_session().identity_pending());

        let session = ctx.refresh_identity().await.expect("refresh");
        assert_eq!(session.user().map(|u| u.id.as_str()), Some("u1"));
        assert_eq!(session.token(), Some("restored"));
    }

    #[tokio::test]
    async fn test_refresh_identity_rejected_token_logs_out() {
        let credentials = CredentialStore::memory();
        credentials.save("revoked").expect("save");
        let (ctx, _) = context(FakeApi::failing(AuthError::InvalidCredentials), &credentials);

        let result = ctx.refresh_identity().await;
        assert_eq!(result.map(|s| s.status()), Err(AuthError::InvalidCredentials));
        assert_eq!(ctx.session().current_session().status(), SessionStatus::Anonymous);
        assert!(!credentials.has_token());
    }

    #[tokio::test]
    async fn test_refresh_identity_outage_keeps_session() {
        let credentials = CredentialStore::memory();
        credentials.save("restored").expect("save");
        let (ctx, _) = context(
            FakeApi::failing(AuthError::NetworkError("offline".to_string())),
            &credentials,
        );

        assert!(ctx.refresh_identity().await.is_err());
        let session = ctx.session().current_session();
        assert!(session.is_authenticated());
        assert!(session.identity_pending());
        assert!(credentials.has_token());
    }

    #[tokio::test]
    async fn test_late_identity_does_not_replace_newer_session() {
        let gate = Arc::new(Notify::new());
        let credentials = CredentialStore::memory();
        credentials.save("old-token").expect("save");
        let (ctx, api) = context(FakeApi::succeeding().gated(gate.clone()), &credentials);

        let relogin = async {
            wait_until(|| api.calls() == 1).await;
            let store = ctx.session();
            store.logout();
            store.begin_login().expect("begin_login");
            store
                .complete_login(User::new("u2"), "new-token")
                .expect("complete_login");
            gate.notify_one();
        };
        let (refreshed, ()) = tokio::join!(ctx.refresh_identity(), relogin);

        let refreshed = refreshed.expect("stale response is not an error");
        assert_eq!(refreshed.user().map(|u| u.id.as_str()), Some("u2"));
        let session = ctx.session().current_session();
        assert_eq!(session.token(), Some("new-token"));
        assert_eq!(session.user().map(|u| u.id.as_str()), Some("u2"));
    }

    #[tokio::test]
    async fn test_late_rejection_does_not_log_out_newer_session() {
        let gate = Arc::new(Notify::new());
        let credentials = CredentialStore::memory();
        credentials.save("old-token").expect("save");
        let (ctx, api) = context(
            FakeApi::failing(AuthError::InvalidCredentials).gated(gate.clone()),
            &credentials,
        );

        let relogin = async {
            wait_until(|| api.calls() == 1).await;
            let store = ctx.session();
            store.logout();
            store.begin_login().expect("begin_login");
            store
                .complete_login(User::new("u2"), "new-token")
                .expect("complete_login");
            gate.notify_one();
        };
        let (refreshed, ()) = tokio::join!(ctx.refresh_identity(), relogin);

        assert!(refreshed.is_ok());
        assert!(ctx.session().current_session().is_authenticated());
        assert_eq!(credentials.load().expect("load").as_deref(), Some("new-token"));
    }

    #[tokio::test]
    async fn test_refresh_identity_noop_when_known() {
        let credentials = CredentialStore::memory();
        let (ctx, api) = context(FakeApi::succeeding(), &credentials);

        ctx.refresh_identity().await.expect("anonymous is fine");
        assert_eq!(api.calls(), 0);
    }
}
