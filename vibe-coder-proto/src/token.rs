//! Bearer tokens: a small HMAC-SHA256-signed envelope, not a JWT.
//!
//! `base64url(json(payload)) . base64url(hmac_sha256(session_secret, payload_b64))`
//!
//! Mirrors the teacher's own preference for hand-rolled HMAC signing
//! (`derive_key_from_signing` in the reference server) over pulling in a
//! JWT library for something this small.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPayload {
    pub session_id: String,
    pub host_id: String,
    /// Unix seconds.
    pub exp: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token payload is not valid JSON")]
    BadPayload,
    #[error("token is expired")]
    Expired,
}

/// Sign `payload` with `secret`, returning the bearer token string.
pub fn issue(payload: &TokenPayload, secret: &[u8]) -> String {
    let payload_json = serde_json::to_vec(payload).expect("TokenPayload always serializes");
    let payload_b64 = URL_SAFE_NO_PAD.encode(&payload_json);
    let sig = sign(payload_b64.as_bytes(), secret);
    format!("{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig))
}

fn sign(data: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Decode and verify the signature of `token`. Does not check expiry or
/// session existence — callers combine this with session-table lookups.
pub fn decode(token: &str, secret: &[u8]) -> Result<TokenPayload, TokenError> {
    let (payload_b64, sig_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;
    let sig = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| TokenError::Malformed)?;
    let expected = sign(payload_b64.as_bytes(), secret);
    if !constant_time_eq(&sig, &expected) {
        return Err(TokenError::BadSignature);
    }
    let payload_json = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| TokenError::Malformed)?;
    serde_json::from_slice(&payload_json).map_err(|_| TokenError::BadPayload)
}

/// Decode, verify, and check `now < exp`.
pub fn verify(token: &str, secret: &[u8], now: i64) -> Result<TokenPayload, TokenError> {
    let payload = decode(token, secret)?;
    if now >= payload.exp {
        return Err(TokenError::Expired);
    }
    Ok(payload)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Generate a random signing secret of at least 32 characters.
pub fn generate_session_secret() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..48)
        .map(|_| CHARSET[rng.r#gen::<usize>() % CHARSET.len()] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(exp: i64) -> TokenPayload {
        TokenPayload {
            session_id: "ABCD1234".into(),
            host_id: "12345678".into(),
            exp,
        }
    }

    #[test]
    fn issued_token_verifies() {
        let secret = generate_session_secret();
        let token = issue(&payload(2_000_000_000), secret.as_bytes());
        let decoded = verify(&token, secret.as_bytes(), 1_000_000_000).unwrap();
        assert_eq!(decoded.session_id, "ABCD1234");
    }

    #[test]
    fn tampered_token_is_rejected() {
        let secret = generate_session_secret();
        let mut token = issue(&payload(2_000_000_000), secret.as_bytes());
        token.push('x');
        assert_eq!(
            verify(&token, secret.as_bytes(), 1_000_000_000),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn expired_token_is_rejected() {
        let secret = generate_session_secret();
        let token = issue(&payload(1_000_000_000), secret.as_bytes());
        assert_eq!(
            verify(&token, secret.as_bytes(), 2_000_000_000),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let secret = generate_session_secret();
        let other = generate_session_secret();
        let token = issue(&payload(2_000_000_000), secret.as_bytes());
        assert_eq!(
            verify(&token, other.as_bytes(), 1_000_000_000),
            Err(TokenError::BadSignature)
        );
    }
}
