use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// Maximum length for email input (RFC 5321 path limit).
pub const MAX_EMAIL_LENGTH: usize = 254;

/// 128 chars accommodates password managers and passphrases.
pub const MAX_PASSWORD_LENGTH: usize = 128;

pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Field-level messages, at most one per field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, String>);

impl FieldErrors {
    /// Pseudo-field for messages that belong to the whole form
    pub const FORM_FIELD: &'static str = "_form";

    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message for `field` unless it already has one.
    pub fn insert(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_insert_with(|| message.into());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The form-wide message if present, otherwise the first field's.
    pub fn first_message(&self) -> Option<&str> {
        self.get(Self::FORM_FIELD)
            .or_else(|| self.0.values().next().map(String::as_str))
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
        f.write_str(&parts.join("; "))
    }
}

/// Raw input of a form, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormValues(BTreeMap<String, String>);

impl FormValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, value: impl Into<String>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: &str, value: impl Into<String>) {
        self.0.insert(field.to_string(), value.into());
    }

    /// Value of `field`; a missing field reads as empty
    pub fn get(&self, field: &str) -> &str {
        self.0.get(field).map(String::as_str).unwrap_or("")
    }

    /// Trimmed value, for fields like email where whitespace is noise
    pub fn trimmed(&self, field: &str) -> &str {
        self.get(field).trim()
    }

    pub fn clear(&mut self, field: &str) {
        self.0.remove(field);
    }

    /// Fields not in `known`, in name order
    pub fn others<'a>(&'a self, known: &'a [&'a str]) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.0
            .iter()
            .filter(move |(k, _)| !known.contains(&k.as_str()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Required,
    /// Looks like `local@domain.tld`
    Email,
    MinLength(usize),
    MaxLength(usize),
    /// Must equal the value of another field (password confirmation)
    Matches(&'static str),
}

impl Rule {
    /// The message for `value` failing this rule, if it does.
    fn check(&self, label: &str, value: &str, values: &FormValues) -> Option<String> {
        match self {
            Rule::Required => value
                .trim()
                .is_empty()
                .then(|| format!("{} is required", label)),
            Rule::Email => (!is_email_shaped(value.trim()))
                .then(|| "Enter a valid email address".to_string()),
            Rule::MinLength(min) => (value.chars().count() < *min)
                .then(|| format!("{} must be at least {} characters", label, min)),
            Rule::MaxLength(max) => (value.chars().count() > *max)
                .then(|| format!("{} must be at most {} characters", label, max)),
            Rule::Matches(other) => (value != values.get(other))
                .then(|| format!("{} does not match {}", label, field_label(other).to_lowercase())),
        }
    }
}

/// Ordered rules per field.
#[derive(Debug, Clone, Default)]
pub struct Ruleset {
    fields: Vec<(String, Vec<Rule>)>,
}

impl Ruleset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, rules: impl IntoIterator<Item = Rule>) -> Self {
        self.fields.push((name.to_string(), rules.into_iter().collect()));
        self
    }

    /// Check every field. The first failing rule per field wins; an empty
    /// value only fails `Required`, so optional fields may be left blank.
    pub fn validate(&self, values: &FormValues) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();
        for (field, rules) in &self.fields {
            let value = values.get(field);
            let label = field_label(field);
            for rule in rules {
                if value.trim().is_empty() && *rule != Rule::Required {
                    continue;
                }
                if let Some(message) = rule.check(&label, value, values) {
                    errors.insert(field.as_str(), message);
                    break;
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// `confirm_password` -> `Confirm password`
fn field_label(field: &str) -> String {
    let spaced = field.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn is_email_shaped(value: &str) -> bool {
    if value.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login_rules() -> Ruleset {
        Ruleset::new()
            .field("email", [Rule::Required, Rule::Email, Rule::MaxLength(MAX_EMAIL_LENGTH)])
            .field("password", [Rule::Required])
    }

    #[test]
    fn test_required_field_blocks() {
        let values = FormValues::new().with("email", "").with("password", "secret");
        let errors = login_rules().validate(&values).expect_err("empty email must fail");
        assert_eq!(errors.get("email"), Some("Email is required"));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_whitespace_only_counts_as_missing() {
        let values = FormValues::new().with("email", "   ");
        let errors = login_rules().validate(&values).expect_err("must fail");
        assert_eq!(errors.get("email"), Some("Email is required"));
        assert_eq!(errors.get("password"), Some("Password is required"));
    }

    #[test]
    fn test_email_shape() {
        assert!(is_email_shaped("ops@example.com"));
        assert!(is_email_shaped("a.b+tag@sub.example.io"));
        assert!(!is_email_shaped("ops@example"));
        assert!(!is_email_shaped("@example.com"));
        assert!(!is_email_shaped("ops@@example.com"));
        assert!(!is_email_shaped("ops@.com"));
        assert!(!is_email_shaped("ops @example.com"));
        assert!(!is_email_shaped("plainaddress"));
    }

    #[test]
    fn test_first_failing_rule_wins() {
        let rules = Ruleset::new().field("email", [Rule::Email, Rule::MaxLength(5)]);
        let values = FormValues::new().with("email", "not-an-email-at-all");
        let errors = rules.validate(&values).expect_err("must fail");
        assert_eq!(errors.get("email"), Some("Enter a valid email address"));
    }

    #[test]
    fn test_length_rules_count_chars() {
        let rules = Ruleset::new().field("password", [Rule::MinLength(3), Rule::MaxLength(4)]);
        assert!(rules.validate(&FormValues::new().with("password", "ééé")).is_ok());
        assert_eq!(
            rules
                .validate(&FormValues::new().with("password", "ab"))
                .expect_err("too short")
                .get("password"),
            Some("Password must be at least 3 characters")
        );
        assert!(rules.validate(&FormValues::new().with("password", "abcde")).is_err());
    }

    #[test]
    fn test_matches_rule() {
        let rules = Ruleset::new().field("confirm_password", [Rule::Required, Rule::Matches("password")]);
        let ok = FormValues::new().with("password", "hunter22").with("confirm_password", "hunter22");
        assert!(rules.validate(&ok).is_ok());

        let bad = FormValues::new().with("password", "hunter22").with("confirm_password", "hunter23");
        assert_eq!(
            rules.validate(&bad).expect_err("mismatch").get("confirm_password"),
            Some("Confirm password does not match password")
        );
    }

    #[test]
    fn test_optional_field_may_be_blank() {
        let rules = Ruleset::new().field("name", [Rule::MaxLength(10)]);
        assert!(rules.validate(&FormValues::new()).is_ok());
    }

    #[test]
    fn test_field_errors_keep_first_message() {
        let mut errors = FieldErrors::new();
        errors.insert("email", "first");
        errors.insert("email", "second");
        assert_eq!(errors.get("email"), Some("first"));
        assert_eq!(errors.first_message(), Some("first"));

        errors.insert(FieldErrors::FORM_FIELD, "form level");
        assert_eq!(errors.first_message(), Some("form level"));
        assert_eq!(errors.to_string(), "_form: form level; email: first");
    }

    #[test]
    fn test_field_label() {
        assert_eq!(field_label("confirm_password"), "Confirm password");
        assert_eq!(field_label("email"), "Email");
        assert_eq!(field_label(""), "");
    }

    #[test]
    fn test_other_fields() {
        let values = FormValues::new()
            .with("email", "a@b.co")
            .with("organization", "acme")
            .with("password", "x");
        let others: Vec<_> = values.others(&["email", "password"]).collect();
        assert_eq!(others, vec![("organization", "acme")]);
    }
}
