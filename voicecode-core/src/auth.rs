//! Shared-secret bootstrap and constant-time comparison (§4.6).

use std::path::Path;

use rand::RngCore;
use subtle::ConstantTimeEq;

const KEY_PREFIX: &str = "voice-code-";
const KEY_HEX_LEN: usize = 32;

/// `^voice-code-[0-9a-f]{32}$` exactly.
pub fn is_valid_key_format(key: &str) -> bool {
    match key.strip_prefix(KEY_PREFIX) {
        Some(hex_part) => {
            hex_part.len() == KEY_HEX_LEN && hex_part.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        }
        None => false,
    }
}

fn generate_key() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    format!("{KEY_PREFIX}{}", hex::encode(bytes))
}

/// Load the key at `path`, generating and persisting a fresh one if the
/// file is absent, empty, or does not match [`is_valid_key_format`]. The
/// bootstrap is idempotent: a valid existing key is returned unchanged.
pub fn load_or_bootstrap_key(path: &Path) -> std::io::Result<String> {
    if let Ok(contents) = std::fs::read_to_string(path) {
        let trimmed = contents.trim();
        if is_valid_key_format(trimmed) {
            return Ok(trimmed.to_string());
        }
    }

    let key = generate_key();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_key_file(path, &key)?;
    Ok(key)
}

#[cfg(unix)]
fn write_key_file(path: &Path, key: &str) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    use std::io::Write;
    file.write_all(key.as_bytes())
}

#[cfg(not(unix))]
fn write_key_file(path: &Path, key: &str) -> std::io::Result<()> {
    std::fs::write(path, key)
}

/// Constant-time key comparison: different lengths are rejected
/// immediately (length itself is not secret), equal lengths are compared
/// in constant time regardless of where the first difference falls
/// (§8 invariant 7).
pub fn keys_match(candidate: &str, expected: &str) -> bool {
    if candidate.len() != expected.len() {
        return false;
    }
    bool::from(candidate.as_bytes().ct_eq(expected.as_bytes()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generated_key_has_valid_format() {
        let key = generate_key();
        assert!(is_valid_key_format(&key));
        assert_eq!(key.len(), "voice-code-".len() + 32);
    }

    #[test]
    fn uppercase_or_other_characters_are_invalid() {
        assert!(!is_valid_key_format("voice-code-ABCDEF0000000000000000000000000"));
        assert!(!is_valid_key_format("voice-code-tooshort"));
        assert!(!is_valid_key_format("not-even-the-right-prefix-000000000000000000000000"));
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("key");
        let first = load_or_bootstrap_key(&path).unwrap();
        let second = load_or_bootstrap_key(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn malformed_existing_file_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("key");
        std::fs::write(&path, "garbage").unwrap();
        let key = load_or_bootstrap_key(&path).unwrap();
        assert!(is_valid_key_format(&key));
    }

    #[test]
    fn keys_match_rejects_different_lengths_immediately() {
        assert!(!keys_match("short", "longer-string"));
    }

    #[test]
    fn keys_match_accepts_equal_keys() {
        let key = generate_key();
        assert!(keys_match(&key, &key));
    }

    #[test]
    fn keys_match_rejects_single_byte_difference() {
        let key = generate_key();
        let mut mismatched = key.clone();
        mismatched.replace_range(key.len() - 1..key.len(), "0");
        if mismatched == key {
            mismatched.replace_range(key.len() - 1..key.len(), "1");
        }
        assert!(!keys_match(&mismatched, &key));
    }
}
