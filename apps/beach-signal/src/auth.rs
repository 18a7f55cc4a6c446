use std::time::Duration;

use axum::http::{header, HeaderMap};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signaling::{Identity, Role};

/// Identity and role extracted from a verified credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub identity: Identity,
    pub role: Role,
    pub name: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("token validation failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token missing subject")]
    MissingSubject,
    #[error("token carries unknown role '{0}'")]
    InvalidRole(String),
    #[error("refresh tokens cannot open a signaling connection")]
    RefreshTokenRejected,
    #[error("token is not a refresh token")]
    NotRefreshToken,
}

impl AuthError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::InvalidToken(_) => "invalid_token",
            AuthError::MissingSubject => "missing_subject",
            AuthError::InvalidRole(_) => "invalid_role",
            AuthError::RefreshTokenRejected => "refresh_token",
            AuthError::NotRefreshToken => "not_refresh_token",
        }
    }
}

/// Admission check run before a socket upgrade.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError>;
}

/// Subject claim. Issued tokens carry numeric user ids; string subjects are
/// accepted too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Subject {
    Numeric(serde_json::Number),
    Text(String),
}

impl Subject {
    fn into_identity(self) -> Option<Identity> {
        let raw = match self {
            Subject::Numeric(number) => number.to_string(),
            Subject::Text(text) => text,
        };
        let identity = Identity::from(raw.trim());
        (!identity.is_blank()).then_some(identity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalClaims {
    pub sub: Subject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub role: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub refresh: bool,
}

/// HS256 verifier over a shared secret.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Issued subjects are numeric; jsonwebtoken only recognises string
        // `sub` values, so presence is checked by `Subject::into_identity`.
        validation.set_required_spec_claims(&["exp"]);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    fn decode_claims(&self, token: &str) -> Result<SignalClaims, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::MissingToken);
        }
        Ok(decode::<SignalClaims>(token, &self.key, &self.validation)?.claims)
    }

    fn identity_from(claims: SignalClaims) -> Result<VerifiedIdentity, AuthError> {
        let role = claims
            .role
            .parse::<Role>()
            .map_err(|_| AuthError::InvalidRole(claims.role.clone()))?;
        let identity = claims
            .sub
            .into_identity()
            .ok_or(AuthError::MissingSubject)?;
        Ok(VerifiedIdentity {
            identity,
            role,
            name: claims.name,
        })
    }
}

impl CredentialVerifier for TokenVerifier {
    fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        let claims = self.decode_claims(token)?;
        if claims.refresh {
            return Err(AuthError::RefreshTokenRejected);
        }
        Self::identity_from(claims)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Development token issuer sharing the verifier's secret.
#[derive(Clone)]
pub struct TokenIssuer {
    key: EncodingKey,
    verifier: TokenVerifier,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &[u8], access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            key: EncodingKey::from_secret(secret),
            verifier: TokenVerifier::new(secret),
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn issue_pair(&self, user_id: u64, role: Role) -> Result<TokenPair, AuthError> {
        let subject = Subject::Numeric(user_id.into());
        let name = Some(user_id.to_string());
        Ok(TokenPair {
            access_token: self.sign(subject.clone(), name.clone(), role, false)?,
            refresh_token: self.sign(subject, name, role, true)?,
        })
    }

    /// Exchanges a refresh token for a new access token.
    pub fn refresh(&self, refresh_token: &str) -> Result<String, AuthError> {
        let claims = self.verifier.decode_claims(refresh_token)?;
        if !claims.refresh {
            return Err(AuthError::NotRefreshToken);
        }
        let subject = claims.sub.clone();
        let verified = TokenVerifier::identity_from(claims)?;
        self.sign(subject, verified.name, verified.role, false)
    }

    fn sign(
        &self,
        sub: Subject,
        name: Option<String>,
        role: Role,
        refresh: bool,
    ) -> Result<String, AuthError> {
        let ttl = if refresh { self.refresh_ttl } else { self.access_ttl };
        let now = Utc::now().timestamp();
        let claims = SignalClaims {
            sub,
            name,
            role: role.as_str().to_string(),
            iat: now,
            exp: now + ttl.as_secs() as i64,
            refresh,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.key)?)
    }
}

/// Bearer token from the `Authorization` header, falling back to the
/// `token` query parameter browsers use for WebSocket upgrades.
pub fn extract_bearer(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).trim().to_string());

    from_header.or_else(|| {
        query_token
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}

/// Random 256-bit key, hex encoded.
pub fn generate_secret_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
