use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::form::FieldErrors;

/// Failure vocabulary shared by the auth client, the forms and the session.
///
/// `Clone` so the last failure can be kept on the session snapshot; transport
/// errors are flattened to their message for the same reason.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Validation failed: {0}")]
    ValidationFailed(FieldErrors),

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Account not found")]
    NotFound,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Server error: {0}")]
    ServerError(String),
}

/// Fieldless mirror of `AuthError` for matching and for the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum ErrorKind {
    ValidationFailed,
    InvalidCredentials,
    Conflict,
    NotFound,
    NetworkError,
    ServerError,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Error payload the backend may attach to a non-2xx response.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    #[serde(default)]
    errors: BTreeMap<String, serde_json::Value>,
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            AuthError::InvalidCredentials => ErrorKind::InvalidCredentials,
            AuthError::Conflict(_) => ErrorKind::Conflict,
            AuthError::NotFound => ErrorKind::NotFound,
            AuthError::NetworkError(_) => ErrorKind::NetworkError,
            AuthError::ServerError(_) => ErrorKind::ServerError,
        }
    }

    /// The single top-level banner shown on a form after a failed attempt.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::ValidationFailed(errors) => errors
                .first_message()
                .map(str::to_string)
                .unwrap_or_else(|| "Please correct the highlighted fields.".to_string()),
            AuthError::InvalidCredentials => "Invalid email or password".to_string(),
            AuthError::Conflict(msg) if !msg.is_empty() => msg.clone(),
            AuthError::Conflict(_) => "An account with this email already exists.".to_string(),
            AuthError::NotFound => "No account found for that email.".to_string(),
            AuthError::NetworkError(_) => {
                "Unable to connect to server. Check your internet connection.".to_string()
            }
            AuthError::ServerError(_) => {
                "Something went wrong on our end. Please try again.".to_string()
            }
        }
    }

    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        let message = parsed.message.clone().unwrap_or_default();

        match status.as_u16() {
            401 | 403 => AuthError::InvalidCredentials,
            404 => AuthError::NotFound,
            409 => AuthError::Conflict(message),
            400 | 422 => AuthError::ValidationFailed(Self::field_errors(&parsed)),
            500..=599 => AuthError::ServerError(Self::truncate_body(body)),
            _ => AuthError::ServerError(format!(
                "Status {}: {}",
                status,
                Self::truncate_body(body)
            )),
        }
    }

    /// Server-side field errors arrive either as `{"field": "msg"}` or
    /// `{"field": ["msg", ...]}`; only the first message per field is kept.
    fn field_errors(body: &ErrorBody) -> FieldErrors {
        let mut errors = FieldErrors::new();
        for (field, value) in &body.errors {
            let message = match value {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Array(items) => {
                    items.iter().find_map(|v| v.as_str().map(str::to_string))
                }
                _ => None,
            };
            if let Some(message) = message {
                errors.insert(field, message);
            }
        }
        if errors.is_empty() {
            if let Some(ref message) = body.message {
                errors.insert(FieldErrors::FORM_FIELD, message.clone());
            }
        }
        errors
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AuthError::ServerError(format!("Unexpected response shape: {}", err))
        } else {
            AuthError::NetworkError(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_from_status_maps_auth_failures() {
        assert_eq!(
            AuthError::from_status(StatusCode::UNAUTHORIZED, ""),
            AuthError::InvalidCredentials
        );
        assert_eq!(
            AuthError::from_status(StatusCode::FORBIDDEN, "{}"),
            AuthError::InvalidCredentials
        );
        assert_eq!(AuthError::from_status(StatusCode::NOT_FOUND, ""), AuthError::NotFound);
    }

    #[test]
    fn test_from_status_conflict_keeps_server_message() {
        let err = AuthError::from_status(
            StatusCode::CONFLICT,
            r#"{"message": "Email already registered"}"#,
        );
        assert_eq!(err, AuthError::Conflict("Email already registered".to_string()));
        assert_eq!(err.user_message(), "Email already registered");

        let bare = AuthError::from_status(StatusCode::CONFLICT, "");
        assert_eq!(bare.user_message(), "An account with this email already exists.");
    }

    #[test]
    fn test_from_status_parses_field_errors() {
        let body = r#"{"message": "Invalid input", "errors": {"email": ["is taken", "x"], "password": "too short"}}"#;
        let err = AuthError::from_status(StatusCode::UNPROCESSABLE_ENTITY, body);
        let AuthError::ValidationFailed(fields) = err else {
            panic!("expected ValidationFailed");
        };
        assert_eq!(fields.get("email"), Some("is taken"));
        assert_eq!(fields.get("password"), Some("too short"));
    }

    #[test]
    fn test_from_status_falls_back_to_form_message() {
        let err = AuthError::from_status(StatusCode::BAD_REQUEST, r#"{"message": "Bad payload"}"#);
        assert_eq!(err.user_message(), "Bad payload");
    }

    #[test]
    fn test_from_status_server_errors() {
        assert_eq!(
            AuthError::from_status(StatusCode::BAD_GATEWAY, "upstream down").kind(),
            ErrorKind::ServerError
        );
        // Unexpected statuses are treated as server errors too
        assert_eq!(
            AuthError::from_status(StatusCode::IM_A_TEAPOT, "").kind(),
            ErrorKind::ServerError
        );
    }

    #[test]
    fn test_truncate_body() {
        let short = "short body";
        assert_eq!(AuthError::truncate_body(short), short);

        let long = "é".repeat(400); // 800 bytes, multi-byte chars
        let truncated = AuthError::truncate_body(&long);
        assert!(truncated.contains("(truncated, 800 total bytes)"));
    }

    #[test]
    fn test_user_messages_hide_internal_detail() {
        let err = AuthError::ServerError("stack trace".to_string());
        assert!(!err.user_message().contains("stack trace"));
        let err = AuthError::NetworkError("dns failure".to_string());
        assert!(err.user_message().contains("internet connection"));
    }
}
