//! CSPRNG identifier generators. Spec.md pins exact shapes for each id:
//! host id (8 decimal digits), session id (8-char upper alphanumeric),
//! connection id (opaque, collision-resistant).

use rand::Rng;

const SESSION_ID_LEN: usize = 8;
const SESSION_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// 8-char upper-alphanumeric session id, generated server-side.
/// Collisions are assumed impossible by generator contract (36^8 ≈ 2.8e12
/// possibilities); callers that want a hard guarantee should still check
/// the session table before accepting a freshly generated id.
pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_ID_LEN)
        .map(|_| SESSION_ID_ALPHABET[rng.r#gen::<usize>() % SESSION_ID_ALPHABET.len()] as char)
        .collect()
}

/// 8-decimal-digit host identity.
pub fn generate_host_id() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| char::from(b'0' + rng.gen_range(0..10)))
        .collect()
}

/// Opaque connection id for a peer channel.
pub fn generate_connection_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.r#gen();
    hex::encode(bytes)
}

/// Opaque client id, used by clients joining a rendezvous session.
pub fn generate_client_id() -> String {
    generate_connection_id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_has_expected_shape() {
        let id = generate_session_id();
        assert_eq!(id.len(), SESSION_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn host_id_is_eight_decimal_digits() {
        let id = generate_host_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn connection_ids_are_distinct() {
        let a = generate_connection_id();
        let b = generate_connection_id();
        assert_ne!(a, b);
    }
}
