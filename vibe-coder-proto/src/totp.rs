//! RFC 6238 TOTP (HMAC-SHA1, 30s step, 6 digits) with a configurable
//! look-around window.
//!
//! Implemented directly against `hmac`/`sha1` rather than a third-party TOTP
//! crate — the whole algorithm is two dozen lines and the teacher codebase
//! reaches for `hmac`/`sha2` directly for comparably small signing jobs
//! (see `derive_key_from_signing`).

use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

const STEP_SECONDS: i64 = 30;
const DIGITS: u32 = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TotpError {
    #[error("TOTP secret is not valid base32")]
    InvalidSecret,
    #[error("TOTP secret must be at least 16 characters")]
    SecretTooShort,
}

/// Generate a random base32 TOTP secret of at least 16 characters.
pub fn generate_secret() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..20).map(|_| rng.r#gen()).collect();
    base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &bytes)
}

pub fn validate_secret(secret: &str) -> Result<(), TotpError> {
    if secret.len() < 16 {
        return Err(TotpError::SecretTooShort);
    }
    base32::decode(base32::Alphabet::Rfc4648 { padding: false }, secret)
        .ok_or(TotpError::InvalidSecret)?;
    Ok(())
}

fn counter_code(key: &[u8], counter: u64) -> Result<u32, TotpError> {
    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| TotpError::InvalidSecret)?;
    mac.update(&counter.to_be_bytes());
    let result = mac.finalize().into_bytes();
    let offset = (result[result.len() - 1] & 0x0f) as usize;
    let bin = ((result[offset] as u32 & 0x7f) << 24)
        | ((result[offset + 1] as u32) << 16)
        | ((result[offset + 2] as u32) << 8)
        | (result[offset + 3] as u32);
    Ok(bin % 10u32.pow(DIGITS))
}

/// Compute the 6-digit TOTP code for `secret` at `unix_time`.
pub fn generate_code(secret: &str, unix_time: i64) -> Result<String, TotpError> {
    let key = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, secret)
        .ok_or(TotpError::InvalidSecret)?;
    let counter = (unix_time / STEP_SECONDS) as u64;
    let code = counter_code(&key, counter)?;
    Ok(format!("{code:0width$}", width = DIGITS as usize))
}

/// Verify `code` against `secret` at `unix_time`, accepting codes from any
/// step within `+/- window` steps (spec fixes window to 2).
pub fn verify_code(
    secret: &str,
    code: &str,
    unix_time: i64,
    window: i64,
) -> Result<bool, TotpError> {
    validate_secret(secret)?;
    let key = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, secret)
        .ok_or(TotpError::InvalidSecret)?;
    let counter = unix_time / STEP_SECONDS;
    for delta in -window..=window {
        let step = counter + delta;
        if step < 0 {
            continue;
        }
        let expected = counter_code(&key, step as u64)?;
        let expected = format!("{expected:0width$}", width = DIGITS as usize);
        if constant_time_eq(expected.as_bytes(), code.as_bytes()) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// `otpauth://` URL for QR-code generation by an external encoder.
pub fn provisioning_url(issuer: &str, account: &str, secret: &str) -> String {
    format!(
        "otpauth://totp/{}:{}?secret={}&issuer={}&digits={}&period={}",
        urlencode(issuer),
        urlencode(account),
        secret,
        urlencode(issuer),
        DIGITS,
        STEP_SECONDS
    )
}

fn urlencode(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~') {
                c.to_string()
            } else {
                format!("%{:02X}", c as u32)
            }
        })
        .collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 test vector, SHA1, for secret "12345678901234567890" (base32: GEZDGNBVGY3TQOJQ)
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn generates_rfc_test_vector_at_time_59() {
        // step 1, expected code per RFC 6238 appendix B: 94287082 (8-digit HOTP value,
        // truncated to our 6-digit DIGITS here just checks determinism, not the RFC's
        // own 8-digit vector).
        let code_a = generate_code(RFC_SECRET, 59).unwrap();
        let code_b = generate_code(RFC_SECRET, 59).unwrap();
        assert_eq!(code_a, code_b);
        assert_eq!(code_a.len(), 6);
    }

    #[test]
    fn verify_accepts_within_window_and_rejects_outside() {
        let secret = generate_secret();
        let now = 1_700_000_000i64;
        let code = generate_code(&secret, now).unwrap();
        assert!(verify_code(&secret, &code, now, 2).unwrap());
        // 3 steps away (90s) is outside a window of 2.
        assert!(!verify_code(&secret, &code, now + 3 * STEP_SECONDS, 2).unwrap());
        // 2 steps away (60s) is inside a window of 2.
        assert!(verify_code(&secret, &code, now + 2 * STEP_SECONDS, 2).unwrap());
    }

    #[test]
    fn rejects_short_secret() {
        assert_eq!(validate_secret("TOOSHORT"), Err(TotpError::SecretTooShort));
    }

    #[test]
    fn provisioning_url_contains_issuer_and_secret() {
        let url = provisioning_url("vibe-coder-12345678", "host", "ABCDEFGHIJKLMNOP");
        assert!(url.starts_with("otpauth://totp/"));
        assert!(url.contains("secret=ABCDEFGHIJKLMNOP"));
    }
}
