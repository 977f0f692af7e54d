//! Scripted `AuthApi` double shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::api::{Acknowledgement, AuthApi, AuthError, AuthResponse, Credentials, Registration};
use crate::auth::User;

pub struct FakeApi {
    auth_result: Result<AuthResponse, AuthError>,
    reset_result: Result<Acknowledgement, AuthError>,
    me_result: Result<User, AuthError>,
    gate: Option<Arc<Notify>>,
    calls: AtomicUsize,
    logouts: AtomicUsize,
    last_registration: Mutex<Option<Registration>>,
    last_credentials: Mutex<Option<Credentials>>,
}

impl FakeApi {
    /// Every call succeeds; login and register return user `u1` with `tok123`.
    pub fn succeeding() -> Self {
        Self {
            auth_result: Ok(AuthResponse {
                user: User::new("u1"),
                token: "tok123".to_string(),
            }),
            reset_result: Ok(Acknowledgement::default()),
            me_result: Ok(User::new("u1")),
            gate: None,
            calls: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
            last_registration: Mutex::new(None),
            last_credentials: Mutex::new(None),
        }
    }

    pub fn failing(error: AuthError) -> Self {
        Self {
            auth_result: Err(error.clone()),
            reset_result: Err(error.clone()),
            me_result: Err(error),
            ..Self::succeeding()
        }
    }

    /// Hold every request until `gate` is notified
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    pub fn last_registration(&self) -> Option<Registration> {
        self.last_registration.lock().expect("lock").clone()
    }

    pub fn last_credentials(&self) -> Option<Credentials> {
        self.last_credentials.lock().expect("lock").clone()
    }

    async fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ref gate) = self.gate {
            gate.notified().await;
        }
    }
}

#[async_trait]
impl AuthApi for FakeApi {
    async fn login(&self, credentials: &Credentials) -> Result<AuthResponse, AuthError> {
        *self.last_credentials.lock().expect("lock") = Some(credentials.clone());
        self.enter().await;
        self.auth_result.clone()
    }

    async fn register(&self, registration: &Registration) -> Result<AuthResponse, AuthError> {
        *self.last_registration.lock().expect("lock") = Some(registration.clone());
        self.enter().await;
        self.auth_result.clone()
    }

    async fn request_password_reset(&self, _email: &str) -> Result<Acknowledgement, AuthError> {
        self.enter().await;
        self.reset_result.clone()
    }

    async fn fetch_current_user(&self, _token: &str) -> Result<User, AuthError> {
        self.enter().await;
        self.me_result.clone()
    }

    async fn logout(&self, _token: &str) {
        self.logouts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Yield to the runtime until `condition` holds (bounded).
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
