//! Constant-time comparisons.
//!
//! Used wherever secret-derived values (key fingerprints, tags) are compared.

use subtle::ConstantTimeEq;

/// Compare two byte slices in time independent of their contents.
///
/// Slices of different length compare unequal immediately; length is not
/// treated as secret.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Constant-time comparison of 32-byte values.
#[must_use]
#[inline(never)]
pub fn verify_32(a: &[u8; 32], b: &[u8; 32]) -> bool {
    ct_eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"abcd"));
        assert!(ct_eq(b"", b""));
    }

    #[test]
    fn test_verify_32() {
        let a = [7u8; 32];
        let mut b = a;
        assert!(verify_32(&a, &b));
        b[31] = 8;
        assert!(!verify_32(&a, &b));
    }
}
