//! Verifies the bearer credential presented at connection establishment.
//!
//! Grounded on the teacher's `daemon/src/ipc/auth.rs` token file: a
//! single shared secret, compared in constant time, with no notion of
//! per-user tokens at the daemon level. This module generalizes that
//! one-token-per-daemon model to one-token-per-user, since alarmd's
//! authorization model is meaningless without knowing which user is
//! connecting.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AlarmError;

/// Identity handed back once a credential checks out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    pub user_id: String,
    pub username: String,
}

/// The external boundary between alarmd and whatever issues/stores
/// credentials. Kept as a trait so the IPC layer never depends on a
/// concrete credential store.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AlarmError>;
}

/// Constant-time compare, mirroring the teacher's `tokens_equal` — token
/// comparisons must not leak timing information about where the first
/// mismatched byte falls.
fn tokens_equal(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Fixed token-to-identity table. Used by integration tests and as a
/// minimal standalone deployment mode; a real deployment would back
/// this with the `users` table and a per-session signed token instead
/// of a static map.
pub struct StaticCredentialVerifier {
    tokens: HashMap<String, VerifiedIdentity>,
}

impl StaticCredentialVerifier {
    pub fn new() -> Self {
        Self { tokens: HashMap::new() }
    }

    pub fn with_user(mut self, token: impl Into<String>, user_id: impl Into<String>, username: impl Into<String>) -> Self {
        self.tokens.insert(
            token.into(),
            VerifiedIdentity { user_id: user_id.into(), username: username.into() },
        );
        self
    }
}

impl Default for StaticCredentialVerifier {
    fn default() -> Self {
        Self::new()
    }
}

/// On-disk token map, `{data_dir}/tokens.json`, written with mode 0600
/// like the teacher's `auth_token` file. A real deployment would replace
/// this with signed, expiring tokens; spec.md places that out of scope.
pub fn load_token_file(path: &Path) -> HashMap<String, VerifiedIdentity> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn save_token_file(path: &Path, tokens: &HashMap<String, VerifiedIdentity>) -> std::io::Result<()> {
    let body = serde_json::to_string_pretty(tokens).unwrap_or_default();
    std::fs::write(path, body)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Mint a fresh token for `user_id`/`username`, persisting it into the
/// token file at `path` alongside whatever tokens already exist there.
pub fn issue_token(path: &Path, user_id: &str, username: &str) -> std::io::Result<String> {
    let mut tokens = load_token_file(path);
    let token = uuid::Uuid::new_v4().simple().to_string();
    tokens.insert(
        token.clone(),
        VerifiedIdentity { user_id: user_id.to_string(), username: username.to_string() },
    );
    save_token_file(path, &tokens)?;
    Ok(token)
}

pub fn verifier_from_file(path: &Path) -> StaticCredentialVerifier {
    let tokens = load_token_file(path);
    let mut verifier = StaticCredentialVerifier::new();
    for (token, identity) in tokens {
        verifier = verifier.with_user(token, identity.user_id, identity.username);
    }
    verifier
}

#[async_trait]
impl CredentialVerifier for StaticCredentialVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AlarmError> {
        for (candidate, identity) in &self.tokens {
            if tokens_equal(candidate, token) {
                return Ok(identity.clone());
            }
        }
        Err(AlarmError::AuthenticationFailure)
    }
}
