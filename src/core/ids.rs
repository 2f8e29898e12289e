//! Identifier codec
//!
//! Internal row ids and pagination markers are plain integers. Handing them
//! to clients verbatim would leak insert rates and invite guessing, so every
//! externally visible token (message id, claim id, continuation marker) is a
//! reversible obfuscation of the underlying `u64`. This is not a security
//! boundary; it only keeps the tokens opaque.
//!
//! The permutation is a fixed-key 4-round Feistel network over the two
//! 32-bit halves, rendered as 16 hex digits. Malformed tokens decode to
//! `None`; callers translate that into their operation's absent-id behavior
//! (idempotent deletes return silently, lookups report does-not-exist).

const ROUND_KEYS: [u32; 4] = [0x9e37_79b9, 0x7f4a_7c15, 0x85eb_ca6b, 0xc2b2_ae35];

fn round(half: u32, key: u32) -> u32 {
    let x = half.wrapping_mul(0x85eb_ca6b) ^ key;
    x.rotate_left(13).wrapping_mul(0xc2b2_ae35)
}

/// Encode an internal id as an opaque 16-digit token.
pub fn encode(id: u64) -> String {
    let mut left = (id >> 32) as u32;
    let mut right = id as u32;

    for key in ROUND_KEYS {
        let next = left ^ round(right, key);
        left = right;
        right = next;
    }

    format!("{left:08x}{right:08x}")
}

/// Decode a token back into the internal id, or `None` if the token is
/// malformed (wrong length or non-hex input).
pub fn decode(token: &str) -> Option<u64> {
    if token.len() != 16 {
        return None;
    }

    let mut left = u32::from_str_radix(&token[..8], 16).ok()?;
    let mut right = u32::from_str_radix(&token[8..], 16).ok()?;

    for key in ROUND_KEYS.iter().rev() {
        let prev = right ^ round(left, *key);
        right = left;
        left = prev;
    }

    Some(((left as u64) << 32) | right as u64)
}
