//! Identifier generation.
//!
//! The original seeds libc's `random()` from the time of day xored with a
//! stack address and formats three `%08lx` words. We draw straight from
//! `rand`'s thread-local CSPRNG instead -- same 24-hex-digit shape, better
//! entropy, and no reliance on a seed that two near-simultaneous callers
//! could plausibly collide on.

use rand::RngCore;

pub fn gen_id() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(24);
    for b in &bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_like_24_hex_digits() {
        let id = gen_id();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn two_calls_differ() {
        assert_ne!(gen_id(), gen_id());
    }
}
