// SPDX-License-Identifier: MIT
//! Identity-token verification.
//!
//! The identity layer is an external collaborator: it authenticates users
//! and mints tokens of the form `{userId}.{hmac}` where the tag is
//! HMAC-SHA256 over the user id with a secret shared with this daemon. The
//! hub verifies the tag and records only the user id — it never sees
//! credentials. An empty secret disables verification (local development
//! only), in which case the token is taken verbatim as the user id.

use crate::error::{SyncError, SyncResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub struct TokenVerifier {
    secret: Vec<u8>,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.secret.is_empty()
    }

    /// Verify a token and return the user id it asserts.
    pub fn verify(&self, token: &str) -> SyncResult<String> {
        if !self.enabled() {
            if token.is_empty() {
                return Err(SyncError::Auth("empty token".to_string()));
            }
            return Ok(token.to_string());
        }
        let (user_id, tag_hex) = token
            .rsplit_once('.')
            .ok_or_else(|| SyncError::Auth("malformed token".to_string()))?;
        if user_id.is_empty() {
            return Err(SyncError::Auth("malformed token".to_string()));
        }
        let tag = hex::decode(tag_hex).map_err(|_| SyncError::Auth("malformed token".to_string()))?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| SyncError::Auth(e.to_string()))?;
        mac.update(user_id.as_bytes());
        // Constant-time comparison via the Mac trait.
        mac.verify_slice(&tag)
            .map_err(|_| SyncError::Auth("invalid token".to_string()))?;
        Ok(user_id.to_string())
    }

    /// Mint a token for `user_id`. The identity layer does this in
    /// production; tests and the bot adapter use it directly.
    pub fn mint(&self, user_id: &str) -> String {
        if !self.enabled() {
            return user_id.to_string();
        }
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(user_id.as_bytes());
        let tag = hex::encode(mac.finalize().into_bytes());
        format!("{user_id}.{tag}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_token_verifies() {
        let verifier = TokenVerifier::new("shared-secret");
        let token = verifier.mint("alice");
        assert_eq!(verifier.verify(&token).unwrap(), "alice");
    }

    #[test]
    fn tampered_user_id_is_rejected() {
        let verifier = TokenVerifier::new("shared-secret");
        let token = verifier.mint("alice");
        let (_, tag) = token.rsplit_once('.').unwrap();
        let forged = format!("mallory.{tag}");
        assert!(matches!(
            verifier.verify(&forged),
            Err(SyncError::Auth(_))
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let minter = TokenVerifier::new("secret-a");
        let verifier = TokenVerifier::new("secret-b");
        assert!(verifier.verify(&minter.mint("alice")).is_err());
    }

    #[test]
    fn disabled_verifier_passes_token_through() {
        let verifier = TokenVerifier::new("");
        assert_eq!(verifier.verify("alice").unwrap(), "alice");
        assert!(verifier.verify("").is_err());
    }
}
