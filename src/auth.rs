//! Device authentication.
//!
//! Kobo devices cannot present credentials interactively, so each user gets
//! a per-device token embedded in the API path. The token is the sole
//! authentication factor.

use crate::db::{Database, User};
use crate::error::{AppError, Result};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;

/// Generate a secure random device token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Resolve the user behind a device token from the request path.
pub fn authenticate_device(db: &Database, token: &str) -> Result<User> {
    db.get_user_by_token(token)?
        .ok_or_else(|| AppError::Unauthorized("Unknown device token".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_token() {
        let token1 = generate_token();
        let token2 = generate_token();

        assert_eq!(token1.len(), 43); // Base64 of 32 bytes
        assert_ne!(token1, token2);
    }

    #[test]
    fn test_unknown_token_is_unauthorized() {
        let db = Database::open_memory().unwrap();
        let err = authenticate_device(&db, "no-such-token").unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }
}
