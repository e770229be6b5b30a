//! Credential extraction from inbound requests.
//!
//! Browsers authenticate with a session cookie; scripts and other services
//! send `Authorization: Bearer <token>`. [`CookieOrBearer`] checks the cookie
//! first and falls back to the bearer header.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use axum_extra::extract::cookie::CookieJar;
use axum_extra::headers::{authorization::Bearer, Authorization, HeaderMapExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scheme reported for credentials read from the session cookie.
pub const COOKIE_SCHEME: &str = "cookie";

/// Scheme reported for credentials read from the `Authorization` header.
pub const BEARER_SCHEME: &str = "Bearer";

/// A token and where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthCredentials {
    /// `"cookie"` or `"Bearer"`. Bearer tokens always report the canonical
    /// `"Bearer"` spelling, whatever case the client used in the header.
    pub scheme: String,
    /// The raw token.
    pub credentials: String,
}

/// User record returned by the authentication service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericUser {
    /// Federal ID (login name).
    pub fedid: String,
    /// Person ID in the LIMS database.
    pub id: String,
    /// Surname.
    pub family_name: String,
    /// Honorific such as `Dr`.
    pub title: String,
    /// First name.
    pub given_name: String,
    /// Permission groups granted to the user.
    pub permissions: Vec<String>,
}

/// Why a request could not be authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Neither the cookie nor an `Authorization` header was present.
    #[error("not authenticated")]
    NotAuthenticated,

    /// An `Authorization` header was present but was not a bearer token.
    #[error("invalid authentication credentials")]
    InvalidCredentials,
}

/// Resolves credentials from a named cookie, falling back to a bearer token.
#[derive(Debug, Clone)]
pub struct CookieOrBearer {
    cookie_key: String,
    auto_error: bool,
}

impl CookieOrBearer {
    /// Looks for the cookie named `cookie_key` and rejects requests that carry
    /// no usable credentials.
    pub fn new(cookie_key: impl Into<String>) -> Self {
        Self {
            cookie_key: cookie_key.into(),
            auto_error: true,
        }
    }

    /// When `false`, missing or malformed credentials resolve to `Ok(None)`
    /// instead of an error.
    pub fn with_auto_error(mut self, auto_error: bool) -> Self {
        self.auto_error = auto_error;
        self
    }

    /// The cookie this extractor reads.
    pub fn cookie_key(&self) -> &str {
        &self.cookie_key
    }

    /// Resolves the request's credentials. The scheme of a bearer token is
    /// normalised to `"Bearer"`.
    ///
    /// # Errors
    ///
    /// With auto-error enabled, returns `AuthError::NotAuthenticated` when no
    /// credentials are present and `AuthError::InvalidCredentials` when the
    /// `Authorization` header is not a bearer token.
    pub fn resolve(&self, headers: &HeaderMap) -> Result<Option<AuthCredentials>, AuthError> {
        let jar = CookieJar::from_headers(headers);
        if let Some(cookie) = jar.get(&self.cookie_key) {
            return Ok(Some(AuthCredentials {
                scheme: COOKIE_SCHEME.to_string(),
                credentials: cookie.value().to_string(),
            }));
        }

        let failure = if headers.contains_key(AUTHORIZATION) {
            match headers.typed_get::<Authorization<Bearer>>() {
                Some(bearer) if !bearer.token().is_empty() => {
                    return Ok(Some(AuthCredentials {
                        scheme: BEARER_SCHEME.to_string(),
                        credentials: bearer.token().to_string(),
                    }));
                }
                _ => AuthError::InvalidCredentials,
            }
        } else {
            AuthError::NotAuthenticated
        };

        if self.auto_error {
            Err(failure)
        } else {
            Ok(None)
        }
    }
}
