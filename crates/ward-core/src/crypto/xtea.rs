//! XTEA block cipher (64-bit block, 128-bit key, 32 Feistel cycles) and a
//! counter-mode keystream over it.
//!
//! Used by the JIT anti-tamper mode to encrypt individual method bodies
//! under a per-method nonce. CTR mode means encrypt and decrypt are the
//! same operation and the body length is preserved.

const DELTA: u32 = 0x9E37_79B9;
const ROUNDS: u32 = 32;

/// 128-bit XTEA key.
pub type XteaKey = [u32; 4];

/// Encrypt one 64-bit block.
pub fn encrypt_block(block: u64, key: &XteaKey) -> u64 {
    let mut v0 = block as u32;
    let mut v1 = (block >> 32) as u32;
    let mut sum: u32 = 0;

    for _ in 0..ROUNDS {
        v0 = v0.wrapping_add(
            (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1))
                ^ (sum.wrapping_add(key[(sum & 3) as usize])),
        );
        sum = sum.wrapping_add(DELTA);
        v1 = v1.wrapping_add(
            (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                ^ (sum.wrapping_add(key[((sum >> 11) & 3) as usize])),
        );
    }

    (v0 as u64) | ((v1 as u64) << 32)
}

/// Decrypt one 64-bit block.
#[cfg(test)]
fn decrypt_block(block: u64, key: &XteaKey) -> u64 {
    let mut v0 = block as u32;
    let mut v1 = (block >> 32) as u32;
    let mut sum: u32 = DELTA.wrapping_mul(ROUNDS);

    for _ in 0..ROUNDS {
        v1 = v1.wrapping_sub(
            (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                ^ (sum.wrapping_add(key[((sum >> 11) & 3) as usize])),
        );
        sum = sum.wrapping_sub(DELTA);
        v0 = v0.wrapping_sub(
            (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1))
                ^ (sum.wrapping_add(key[(sum & 3) as usize])),
        );
    }

    (v0 as u64) | ((v1 as u64) << 32)
}

/// XOR `data` in place with the keystream `E(key, nonce + i)`.
///
/// Applying it twice with the same key and nonce restores the input.
pub fn ctr_apply(data: &mut [u8], key: &XteaKey, nonce: u64) {
    for (i, chunk) in data.chunks_mut(8).enumerate() {
        let stream = encrypt_block(nonce.wrapping_add(i as u64), key).to_le_bytes();
        for (b, k) in chunk.iter_mut().zip(stream.iter()) {
            *b ^= k;
        }
    }
}

/// Serialize a key to 16 little-endian bytes.
pub fn key_to_bytes(key: &XteaKey) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (i, word) in key.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    out
}

/// Inverse of [`key_to_bytes`].
pub fn key_from_bytes(bytes: &[u8; 16]) -> XteaKey {
    let mut key = [0u32; 4];
    for (i, word) in key.iter_mut().enumerate() {
        *word = u32::from_le_bytes([
            bytes[i * 4],
            bytes[i * 4 + 1],
            bytes[i * 4 + 2],
            bytes[i * 4 + 3],
        ]);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_inverse() {
        let key = [0x01234567, 0x89ABCDEF, 0xFEDCBA98, 0x76543210];
        for pt in [0u64, 1, 0xDEAD_BEEF_CAFE_F00D, u64::MAX] {
            let ct = encrypt_block(pt, &key);
            assert_ne!(ct, pt);
            assert_eq!(decrypt_block(ct, &key), pt);
        }
    }

    #[test]
    fn avalanche() {
        let key = [0xAAAAAAAA, 0xBBBBBBBB, 0xCCCCCCCC, 0xDDDDDDDD];
        let diff = (encrypt_block(0, &key) ^ encrypt_block(1, &key)).count_ones();
        assert!(diff >= 20, "only {} bits differ", diff);
    }

    #[test]
    fn ctr_restores_odd_length_input() {
        let key = [1, 2, 3, 4];
        let original: Vec<u8> = (0..21u8).collect();
        let mut data = original.clone();
        ctr_apply(&mut data, &key, 0x55);
        assert_ne!(data, original);
        ctr_apply(&mut data, &key, 0x55);
        assert_eq!(data, original);
    }

    #[test]
    fn ctr_nonce_changes_keystream() {
        let key = [9, 9, 9, 9];
        let mut a = vec![0u8; 16];
        let mut b = vec![0u8; 16];
        ctr_apply(&mut a, &key, 1);
        ctr_apply(&mut b, &key, 2);
        assert_ne!(a, b);
    }

    #[test]
    fn key_bytes_layout() {
        let key = [0x0403_0201, 0, 0, 0x1000_0000];
        let bytes = key_to_bytes(&key);
        assert_eq!(&bytes[..4], &[1, 2, 3, 4]);
        assert_eq!(key_from_bytes(&bytes), key);
    }
}
