use rand::rngs::OsRng;
use rand::Rng;

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Identifier length used for flow, replay, bundle and event ids. 62^8
/// makes collision within one daemon lifetime negligible.
pub const DEFAULT_LENGTH: usize = 8;

/// Generate a base62 identifier from OS entropy.
pub fn generate(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
