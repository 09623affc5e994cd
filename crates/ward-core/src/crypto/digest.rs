//! SHA-256 helpers and key masks.

use sha2::{Digest, Sha256};

pub type Digest256 = [u8; 32];

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> Digest256 {
    Sha256::digest(data).into()
}

/// SHA-256 over several parts, each prefixed with its length so that
/// different splits of the same bytes hash differently.
pub fn sha256_parts(parts: &[&[u8]]) -> Digest256 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Mask bound to a module name and a domain label. Key material stored in a
/// module is XOR-ed with this, so the tables only work in the module they
/// were built for.
pub fn module_mask(module_name: &str, domain: &str) -> Digest256 {
    sha256_parts(&[b"ward.mask".as_slice(), domain.as_bytes(), module_name.as_bytes()])
}

/// XOR `data` with `mask`, repeating the mask.
pub fn xor_mask(data: &mut [u8], mask: &[u8]) {
    if mask.is_empty() {
        return;
    }
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= mask[i % mask.len()];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        let d = sha256(b"abc");
        assert_eq!(d[0], 0xBA);
        assert_eq!(d[31], 0xAD);
    }

    #[test]
    fn parts_are_length_prefixed() {
        assert_ne!(
            sha256_parts(&[b"ab".as_slice(), b"c".as_slice()]),
            sha256_parts(&[b"a".as_slice(), b"bc".as_slice()])
        );
    }

    #[test]
    fn mask_depends_on_module_and_domain() {
        assert_ne!(module_mask("a", "x"), module_mask("b", "x"));
        assert_ne!(module_mask("a", "x"), module_mask("a", "y"));
    }

    #[test]
    fn xor_mask_is_involution() {
        let mut data = vec![1u8, 2, 3, 4, 5];
        xor_mask(&mut data, &[0xF0, 0x0F]);
        assert_eq!(data, vec![0xF1, 0x0D, 0xF3, 0x0B, 0xF5]);
        xor_mask(&mut data, &[0xF0, 0x0F]);
        assert_eq!(data, vec![1, 2, 3, 4, 5]);
    }
}
