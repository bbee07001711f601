//! Double-submit CSRF token issuance and validation for the operator HTTP
//! surface, per `SPEC_FULL.md` §4.9 and grounded on the original
//! `csrf_protection.py` module's token lifecycle.
//!
//! Tokens are 256 bits of randomness, hex-encoded, bound to a session with
//! an issue timestamp. A token remains valid for [`TOKEN_LIFETIME`]; on
//! rotation the previous token stays valid for [`ROTATION_GRACE`] so an
//! in-flight request issued just before rotation doesn't get rejected.

use std::collections::HashMap;
use std::time::Duration;

use architect_types::CoreError;
use chrono::{DateTime, Utc};
use rand::RngCore;

/// Bytes of entropy in a generated token (256 bits).
pub const TOKEN_BYTES: usize = 32;
/// How long an issued token remains valid without rotation.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(3600);
/// Grace period during which a just-rotated token is still accepted.
pub const ROTATION_GRACE: Duration = Duration::from_secs(300);

pub const HEADER_NAME: &str = "X-CSRF-Token";
pub const FORM_FIELD: &str = "csrf_token";
pub const COOKIE_NAME: &str = "csrf_double_submit";

/// HTTP methods that require a valid CSRF token.
pub const PROTECTED_METHODS: &[&str] = &["POST", "PUT", "DELETE", "PATCH"];

/// Exact-path routes exempt from CSRF checks (API-key-authenticated or
/// public, per the original module).
pub const EXEMPT_PATHS: &[&str] = &["/login", "/api/errors", "/api/nodes", "/health", "/api/health"];

/// Path prefixes exempt from CSRF checks.
pub const EXEMPT_PREFIXES: &[&str] = &["/api/webhooks/", "/api/external/", "/api/tasks/monitor/", "/api/todos"];

pub fn is_exempt(path: &str) -> bool {
    EXEMPT_PATHS.contains(&path) || EXEMPT_PREFIXES.iter().any(|p| path.starts_with(p))
}

pub fn requires_csrf(method: &str, path: &str) -> bool {
    PROTECTED_METHODS.contains(&method) && !is_exempt(path)
}

struct SessionTokens {
    current: String,
    current_issued: DateTime<Utc>,
    previous: Option<String>,
    previous_issued: Option<DateTime<Utc>>,
}

/// Per-session CSRF token store. One instance lives behind the operator
/// HTTP surface's shared state.
#[derive(Default)]
pub struct CsrfStore {
    sessions: HashMap<String, SessionTokens>,
}

impl CsrfStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session's current token, minting one if absent or
    /// expired. Pass `force_new` to rotate even a still-valid token.
    pub fn issue(&mut self, session_id: &str, force_new: bool) -> String {
        let now = Utc::now();
        if !force_new {
            if let Some(tokens) = self.sessions.get(session_id) {
                let age = now - tokens.current_issued;
                if age < chrono::Duration::from_std(TOKEN_LIFETIME).unwrap() {
                    return tokens.current.clone();
                }
            }
        }

        let new_token = generate_token();
        let previous = self.sessions.remove(session_id);
        self.sessions.insert(
            session_id.to_string(),
            SessionTokens {
                current: new_token.clone(),
                current_issued: now,
                previous: previous.as_ref().map(|p| p.current.clone()),
                previous_issued: previous.map(|p| p.current_issued),
            },
        );
        new_token
    }

    /// Validate `token` against the session's current (or, within the
    /// grace period, previous) token using a constant-time comparison.
    pub fn validate(&self, session_id: &str, token: Option<&str>) -> Result<(), CoreError> {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return Err(CoreError::Security("CSRF token missing".into()));
        };
        let Some(tokens) = self.sessions.get(session_id) else {
            return Err(CoreError::Security("no CSRF token issued for session".into()));
        };

        if constant_time_eq(token.as_bytes(), tokens.current.as_bytes()) {
            return Ok(());
        }

        if let (Some(prev), Some(prev_issued)) = (&tokens.previous, tokens.previous_issued) {
            let age = Utc::now() - prev_issued;
            if age < chrono::Duration::from_std(ROTATION_GRACE).unwrap()
                && constant_time_eq(token.as_bytes(), prev.as_bytes())
            {
                return Ok(());
            }
        }

        Err(CoreError::Security("CSRF token invalid".into()))
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Pull the submitted token from whichever of header/form/body carried it,
/// per the original module's precedence order.
pub fn extract_token<'a>(header: Option<&'a str>, form_field: Option<&'a str>, json_field: Option<&'a str>) -> Option<&'a str> {
    header.or(form_field).or(json_field).filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_reuses_token_within_lifetime() {
        let mut store = CsrfStore::new();
        let t1 = store.issue("s1", false);
        let t2 = store.issue("s1", false);
        assert_eq!(t1, t2);
    }

    #[test]
    fn issue_force_new_rotates_token() {
        let mut store = CsrfStore::new();
        let t1 = store.issue("s1", false);
        let t2 = store.issue("s1", true);
        assert_ne!(t1, t2);
    }

    #[test]
    fn validate_accepts_current_token() {
        let mut store = CsrfStore::new();
        let token = store.issue("s1", false);
        assert!(store.validate("s1", Some(&token)).is_ok());
    }

    #[test]
    fn validate_rejects_missing_token() {
        let mut store = CsrfStore::new();
        store.issue("s1", false);
        assert!(store.validate("s1", None).is_err());
    }

    #[test]
    fn validate_rejects_wrong_token() {
        let mut store = CsrfStore::new();
        store.issue("s1", false);
        assert!(store.validate("s1", Some("bogus")).is_err());
    }

    #[test]
    fn validate_accepts_previous_token_within_grace_period() {
        let mut store = CsrfStore::new();
        let old = store.issue("s1", false);
        let new = store.issue("s1", true);
        assert_ne!(old, new);
        assert!(store.validate("s1", Some(&old)).is_ok());
        assert!(store.validate("s1", Some(&new)).is_ok());
    }

    #[test]
    fn validate_rejects_unknown_session() {
        let store = CsrfStore::new();
        assert!(store.validate("nonexistent", Some("anything")).is_err());
    }

    #[test]
    fn requires_csrf_excludes_exempt_paths_and_safe_methods() {
        assert!(requires_csrf("POST", "/api/tasks"));
        assert!(!requires_csrf("GET", "/api/tasks"));
        assert!(!requires_csrf("POST", "/login"));
        assert!(!requires_csrf("POST", "/api/webhooks/incoming"));
    }

    #[test]
    fn extract_token_prefers_header_then_form_then_json() {
        assert_eq!(extract_token(Some("h"), Some("f"), Some("j")), Some("h"));
        assert_eq!(extract_token(None, Some("f"), Some("j")), Some("f"));
        assert_eq!(extract_token(None, None, Some("j")), Some("j"));
        assert_eq!(extract_token(None, None, None), None);
    }

    #[test]
    fn constant_time_eq_matches_equal_length_and_content() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
