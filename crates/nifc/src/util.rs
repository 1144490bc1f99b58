use std::path::{Component, Path};

use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_lower(&hasher.finalize())
}

pub fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(nybble_to_hex((b >> 4) & 0x0f));
        out.push(nybble_to_hex(b & 0x0f));
    }
    out
}

/// True for a relative path that stays below its base directory.
pub fn is_safe_relative_path(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn nybble_to_hex(n: u8) -> char {
    match n {
        0..=9 => (b'0' + n) as char,
        10..=15 => (b'a' + (n - 10)) as char,
        _ => '0',
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn relative_paths_must_stay_inside() {
        assert!(is_safe_relative_path(Path::new("gen/nif.rs")));
        assert!(is_safe_relative_path(Path::new("./nif.h")));
        assert!(!is_safe_relative_path(Path::new("../nif.rs")));
        assert!(!is_safe_relative_path(Path::new("/tmp/nif.rs")));
        assert!(!is_safe_relative_path(Path::new("")));
    }
}
