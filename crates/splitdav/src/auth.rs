//! HTTP Basic authentication of proxy clients.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hyper::header::{AUTHORIZATION, HeaderMap};
use subtle::ConstantTimeEq;

use crate::error::{ProxyError, ProxyResult};

/// The single credential pair clients must present.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Checks the `Authorization` header of a request.
    pub fn check(&self, headers: &HeaderMap) -> ProxyResult<()> {
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_basic)
            .ok_or(ProxyError::AuthFailure)?;
        if self.matches(&presented.0, &presented.1) {
            Ok(())
        } else {
            Err(ProxyError::AuthFailure)
        }
    }

    /// Constant-time comparison of both fields. Both are always compared so
    /// timing does not reveal which one was wrong.
    fn matches(&self, username: &str, password: &str) -> bool {
        let user_ok = self.username.as_bytes().ct_eq(username.as_bytes());
        let pass_ok = self.password.as_bytes().ct_eq(password.as_bytes());
        (user_ok & pass_ok).into()
    }
}

/// Splits a `Basic` authorization value into username and password.
fn parse_basic(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn basic(user: &str, pass: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
    }

    #[test]
    fn test_accepts_matching_credentials() {
        let creds = Credentials::new("alice", "s3cret:with:colons");
        assert!(creds.check(&headers(&basic("alice", "s3cret:with:colons"))).is_ok());
    }

    #[test]
    fn test_rejects_wrong_password_or_user() {
        let creds = Credentials::new("alice", "secret");
        assert!(matches!(
            creds.check(&headers(&basic("alice", "wrong"))),
            Err(ProxyError::AuthFailure)
        ));
        assert!(creds.check(&headers(&basic("bob", "secret"))).is_err());
        assert!(creds.check(&headers(&basic("alic", "secret"))).is_err());
    }

    #[test]
    fn test_rejects_missing_or_malformed_header() {
        let creds = Credentials::new("alice", "secret");
        assert!(creds.check(&HeaderMap::new()).is_err());
        assert!(creds.check(&headers("Bearer abc")).is_err());
        assert!(creds.check(&headers("Basic !!!not-base64")).is_err());
        assert!(creds.check(&headers(&format!("Basic {}", STANDARD.encode("nocolon")))).is_err());
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        let creds = Credentials::new("alice", "secret");
        let value = basic("alice", "secret").replacen("Basic", "basic", 1);
        assert!(creds.check(&headers(&value)).is_ok());
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::new("alice", "secret");
        assert!(!format!("{creds:?}").contains("secret"));
    }
}
