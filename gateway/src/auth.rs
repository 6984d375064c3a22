use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

pub type AuthResult<T> = Result<T, AuthError>;

/// Claims carried by tokens issued by the dashboard login endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub username: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
}

/// Verifies bearer credentials. Verification happens once, when a
/// connection or request is admitted.
pub trait AuthorizationGate: Send + Sync {
    fn verify(&self, token: &str) -> AuthResult<Claims>;
}

/// HS256 verifier keyed by the shared secret the login endpoint signs with.
pub struct JwtGate {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtGate {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl AuthorizationGate for JwtGate {
    fn verify(&self, token: &str) -> AuthResult<Claims> {
        if token.trim().is_empty() {
            return Err(AuthError::MissingToken);
        }
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        Ok(data.claims)
    }
}

/// Pulls the token out of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
