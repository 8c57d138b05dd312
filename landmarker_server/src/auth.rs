use std::{env, sync::Arc};

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine};
use landmarker_shared::log::{trace, warn};
use sha2::{Digest, Sha512};

pub const SALT_ENV_VAR: &str = "LANDMARKERIO_SALT";
pub const DEFAULT_SALT: &str = "DEFAULT_LANDMARKERIO_SALT";

/// Reads the salt from [`SALT_ENV_VAR`] and falls back to [`DEFAULT_SALT`].
pub fn salt_from_env() -> String {
    match env::var(SALT_ENV_VAR) {
        Ok(salt) if !salt.is_empty() => salt,
        _ => {
            warn!("Change the default salt by setting '{SALT_ENV_VAR}' before deploying to production");
            DEFAULT_SALT.to_owned()
        }
    }
}

/// Hex encoded SHA-512 of the password followed by the salt.
pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Credentials of the single user that may access the API.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password_hash: String,
    pub salt: String,
}

impl BasicAuth {
    pub fn from_password(username: impl Into<String>, password: &str, salt: impl Into<String>) -> Self {
        let salt = salt.into();
        Self {
            username: username.into(),
            password_hash: hash_password(&salt, password),
            salt,
        }
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        username == self.username && hash_password(&self.salt, password) == self.password_hash
    }

    /// Checks the `Authorization` header of a request.
    pub fn verify_headers(&self, headers: &HeaderMap) -> bool {
        let Some((username, password)) = basic_credentials(headers) else {
            return false;
        };
        self.verify(&username, &password)
    }
}

/// Extracts user name and password from a `Basic` authorization header.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_owned(), password.to_owned()))
}

/// Middleware that rejects requests without valid credentials.
pub async fn require_basic_auth(State(auth): State<Arc<BasicAuth>>, request: Request, next: Next) -> Response {
    if auth.verify_headers(request.headers()) {
        return next.run(request).await;
    }
    trace!("Rejected unauthorized request to {}", request.uri());
    let mut response = (StatusCode::UNAUTHORIZED, "Unauthorized Access").into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"Authentication Required\""),
    );
    response
}
