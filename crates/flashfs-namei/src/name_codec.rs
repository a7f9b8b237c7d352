//! Name hashing and comparison for directory lookups, and the on-disk
//! encodings of symlink targets.
//!
//! Case-insensitive directories treat a name and the same name with any
//! number of trailing dots as identical, and fold ASCII case before hashing
//! or comparing.
//!
//! Encrypted symlink targets are stored as `{len: u16 le, bytes[len]}`
//! followed by a NUL, and must fit in one block.

use crate::error::{NamespaceError, Result};
use crate::types::NamePolicy;

/// Size of the length prefix of the encrypted symlink container.
pub const SYMLINK_LEN_PREFIX: usize = 2;

/// Length of `name` once trailing `.` characters are removed.
pub fn striptail_len(name: &[u8]) -> usize {
    let mut len = name.len();
    while len > 0 && name[len - 1] == b'.' {
        len -= 1;
    }
    len
}

/// Hashes a name under the given policy.
pub fn name_hash(name: &str, policy: NamePolicy) -> u64 {
    let bytes = name.as_bytes();
    let mut hasher = blake3::Hasher::new();
    match policy {
        NamePolicy::Exact => {
            hasher.update(bytes);
        }
        NamePolicy::CaseInsensitive => {
            let folded: Vec<u8> = bytes[..striptail_len(bytes)]
                .iter()
                .map(u8::to_ascii_lowercase)
                .collect();
            hasher.update(&folded);
        }
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

/// Compares two names under the given policy.
pub fn names_equal(a: &str, b: &str, policy: NamePolicy) -> bool {
    match policy {
        NamePolicy::Exact => a == b,
        NamePolicy::CaseInsensitive => {
            let (a, b) = (a.as_bytes(), b.as_bytes());
            let alen = striptail_len(a);
            let blen = striptail_len(b);
            alen == blen && a[..alen].eq_ignore_ascii_case(&b[..blen])
        }
    }
}

/// Encodes a plaintext symlink target as stored in its data page.
pub fn encode_plain_symlink(target: &str) -> Vec<u8> {
    let mut page = Vec::with_capacity(target.len() + 1);
    page.extend_from_slice(target.as_bytes());
    page.push(0);
    page
}

/// Decodes a plaintext symlink page, stopping at the first NUL.
pub fn decode_plain_symlink(page: &[u8]) -> &[u8] {
    let end = page.iter().position(|b| *b == 0).unwrap_or(page.len());
    &page[..end]
}

/// Wraps ciphertext into the encrypted symlink container.
///
/// Fails with `NameTooLong` when the container plus its terminator would
/// not fit in one block.
pub fn encode_encrypted_symlink(ciphertext: &[u8], block_size: usize) -> Result<Vec<u8>> {
    let total = SYMLINK_LEN_PREFIX + ciphertext.len() + 1;
    if total > block_size || ciphertext.len() > u16::MAX as usize {
        return Err(NamespaceError::NameTooLong {
            len: total,
            max: block_size,
        });
    }
    let mut page = Vec::with_capacity(total);
    page.extend_from_slice(&(ciphertext.len() as u16).to_le_bytes());
    page.extend_from_slice(ciphertext);
    page.push(0);
    Ok(page)
}

/// Extracts the ciphertext from an encrypted symlink container.
///
/// A zero length yields an empty slice; the caller reports that as a broken
/// link. The stored length is checked against the block size and the page
/// before the ciphertext is handed out.
pub fn decode_encrypted_symlink(page: &[u8], block_size: usize) -> Result<&[u8]> {
    if page.len() < SYMLINK_LEN_PREFIX {
        return Err(NamespaceError::Corrupted(format!(
            "symlink container of {} bytes",
            page.len()
        )));
    }
    let len = u16::from_le_bytes([page[0], page[1]]) as usize;
    if len == 0 {
        return Ok(&[]);
    }
    let end = SYMLINK_LEN_PREFIX + len;
    if end > block_size || end > page.len() {
        return Err(NamespaceError::Corrupted(format!(
            "symlink container length {} exceeds page",
            len
        )));
    }
    Ok(&page[SYMLINK_LEN_PREFIX..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_striptail() {
        assert_eq!(striptail_len(b"foo"), 3);
        assert_eq!(striptail_len(b"foo."), 3);
        assert_eq!(striptail_len(b"foo.."), 3);
        assert_eq!(striptail_len(b"f.o"), 3);
        assert_eq!(striptail_len(b"..."), 0);
        assert_eq!(striptail_len(b""), 0);
    }

    #[test]
    fn test_case_insensitive_equal() {
        let ci = NamePolicy::CaseInsensitive;
        assert!(names_equal("FOO", "foo", ci));
        assert!(names_equal("foo", "foo.", ci));
        assert!(names_equal("FOO", "foo..", ci));
        assert!(!names_equal("foo", "fo", ci));
        assert!(!names_equal("foo.a", "foo", ci));
        assert!(names_equal("..", "...", ci));
    }

    #[test]
    fn test_exact_policy() {
        assert!(!names_equal("FOO", "foo", NamePolicy::Exact));
        assert!(!names_equal("foo", "foo.", NamePolicy::Exact));
        assert_ne!(
            name_hash("FOO", NamePolicy::Exact),
            name_hash("foo", NamePolicy::Exact)
        );
    }

    #[test]
    fn test_case_insensitive_hash_agrees() {
        let ci = NamePolicy::CaseInsensitive;
        assert_eq!(name_hash("FOO", ci), name_hash("foo", ci));
        assert_eq!(name_hash("Foo.", ci), name_hash("foo", ci));
        assert_ne!(name_hash("foo", ci), name_hash("bar", ci));
    }

    #[test]
    fn test_plain_symlink_page() {
        let page = encode_plain_symlink("/a/b/c");
        assert_eq!(page.last(), Some(&0));
        assert_eq!(decode_plain_symlink(&page), b"/a/b/c");
        assert_eq!(decode_plain_symlink(b"\0garbage"), b"");
    }

    #[test]
    fn test_encrypted_container_layout() {
        let page = encode_encrypted_symlink(b"\x01\x02\x03", 4096).unwrap();
        assert_eq!(page, vec![3, 0, 1, 2, 3, 0]);
        assert_eq!(decode_encrypted_symlink(&page, 4096).unwrap(), b"\x01\x02\x03");
    }

    #[test]
    fn test_encrypted_container_too_long() {
        let cipher = vec![7u8; 4094];
        match encode_encrypted_symlink(&cipher, 4096) {
            Err(NamespaceError::NameTooLong { len, max }) => {
                assert_eq!(len, 4097);
                assert_eq!(max, 4096);
            }
            other => panic!("expected NameTooLong, got {:?}", other),
        }
        assert!(encode_encrypted_symlink(&vec![7u8; 4093], 4096).is_ok());
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut page = vec![0u8; 64];
        page[..2].copy_from_slice(&5000u16.to_le_bytes());
        assert!(matches!(
            decode_encrypted_symlink(&page, 4096),
            Err(NamespaceError::Corrupted(_))
        ));
        page[..2].copy_from_slice(&100u16.to_le_bytes());
        assert!(matches!(
            decode_encrypted_symlink(&page, 4096),
            Err(NamespaceError::Corrupted(_))
        ));
    }

    #[test]
    fn test_decode_zero_length() {
        assert!(decode_encrypted_symlink(&[0, 0, 0], 4096).unwrap().is_empty());
        assert!(decode_encrypted_symlink(&[0], 4096).is_err());
    }

    proptest! {
        #[test]
        fn prop_trailing_dots_ignored(name in "[a-zA-Z0-9_]{1,32}", dots in 0usize..4) {
            let padded = format!("{}{}", name, ".".repeat(dots));
            let upper = name.to_ascii_uppercase();
            prop_assert!(names_equal(&padded, &upper, NamePolicy::CaseInsensitive));
            prop_assert_eq!(
                name_hash(&padded, NamePolicy::CaseInsensitive),
                name_hash(&upper, NamePolicy::CaseInsensitive)
            );
        }

        #[test]
        fn prop_container_never_exceeds_block(len in 0usize..5000, block in 64usize..4097) {
            let cipher = vec![0xabu8; len];
            match encode_encrypted_symlink(&cipher, block) {
                Ok(page) => {
                    prop_assert!(page.len() <= block);
                    prop_assert_eq!(decode_encrypted_symlink(&page, block).unwrap(), &cipher[..]);
                }
                Err(NamespaceError::NameTooLong { .. }) => {
                    prop_assert!(len + SYMLINK_LEN_PREFIX + 1 > block);
                }
                Err(e) => prop_assert!(false, "unexpected error {:?}", e),
            }
        }
    }
}
