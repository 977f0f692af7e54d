//! Auth form handling.
//!
//! - `validation`: declarative per-field rules checked before any request
//! - `flow`: the submission controller shared by the login, registration and
//!   forgot-password forms

pub mod flow;
pub mod validation;

pub use flow::{
    FormAction, FormFlow, FormState, LoginAction, PasswordResetAction, RegisterAction,
    SubmitOutcome, SubmitStatus, Success,
};
pub use validation::{FieldErrors, FormValues, Rule, Ruleset};
