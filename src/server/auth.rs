//! Accounts and bearer tokens.
//!
//! Passwords are hashed with argon2id (PHC strings, salt embedded). Tokens
//! are 32 random alphanumerics handed to the client once; the server keeps
//! only their SHA-256 digest and verifies presented tokens by constant-time
//! digest comparison.

use std::collections::HashMap;
use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::http::{header, HeaderMap};
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use super::store::{AuthStore, TokenRecord, UserRecord};
use crate::state::now_ms;

/// Default name of the cookie checked when no bearer token or query token
/// is present.
pub const SESSION_COOKIE: &str = "taskdeck_session";

const TOKEN_LENGTH: usize = 32;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Store error: {0}")]
    Store(#[from] super::store::StoreError),

    #[error("Email already registered")]
    EmailTaken,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Password hashing failed: {0}")]
    Hash(String),
}

pub type Result<T> = std::result::Result<T, AuthError>;

#[derive(Clone)]
pub struct AuthService {
    store: Arc<dyn AuthStore>,
}

impl AuthService {
    pub fn new(store: Arc<dyn AuthStore>) -> Self {
        Self { store }
    }

    /// Create an account and return its first token.
    pub async fn register(&self, email: &str, password: &str) -> Result<String> {
        let email = canonical_email(email);
        if self.store.load_user(&email).await?.is_some() {
            return Err(AuthError::EmailTaken);
        }
        let user = UserRecord {
            email: email.clone(),
            password_hash: hash_password(password)?,
            created_at: now_ms(),
        };
        self.store.save_user(&user).await?;
        self.issue_token(&email).await
    }

    /// Verify credentials and return a fresh token.
    pub async fn login(&self, email: &str, password: &str) -> Result<String> {
        let email = canonical_email(email);
        let Some(user) = self.store.load_user(&email).await? else {
            return Err(AuthError::InvalidCredentials);
        };
        if !verify_password(password, &user.password_hash)? {
            return Err(AuthError::InvalidCredentials);
        }
        self.issue_token(&email).await
    }

    /// Revoke a token. Unknown tokens revoke to the same end state.
    pub async fn logout(&self, token: &str) -> Result<()> {
        self.store.revoke_token(&token_digest(token)).await?;
        Ok(())
    }

    /// Resolve a presented token to its account email.
    pub async fn verify_token(&self, token: &str) -> Result<Option<String>> {
        let presented = token_digest(token);
        let tokens = self.store.list_tokens().await?;
        for record in tokens {
            let matches: bool = presented
                .as_bytes()
                .ct_eq(record.digest.as_bytes())
                .into();
            if matches {
                return Ok(Some(record.email));
            }
        }
        Ok(None)
    }

    async fn issue_token(&self, email: &str) -> Result<String> {
        let token: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(TOKEN_LENGTH)
            .map(char::from)
            .collect();
        let record = TokenRecord {
            digest: token_digest(&token),
            email: email.to_string(),
            created_at: now_ms(),
        };
        self.store.save_token(&record).await?;
        Ok(token)
    }
}

fn canonical_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| AuthError::Hash(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Pull the credential out of a request: Authorization bearer first, then
/// a `token` query parameter, then the named session cookie.
pub fn extract_token(
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    cookie_name: &str,
) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    if let Some(token) = query.get("token").filter(|t| !t.is_empty()) {
        return Some(token.clone());
    }
    let cookies = headers.get(header::COOKIE).and_then(|v| v.to_str().ok())?;
    for part in cookies.split(';') {
        if let Some(value) = part.trim().strip_prefix(cookie_name) {
            if let Some(token) = value.strip_prefix('=') {
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }
    None
}
