//! Cascade integrity chain.
//!
//! Seals an ordered list of chunks (method bodies, for the Normal
//! anti-tamper mode) so that each chunk's key is derived from the
//! digest of the *next* chunk's ciphertext:
//!
//!   Chunk[N-1] encrypted with the random tail key
//!   Chunk[i]   encrypted with K_i = sha256(ciphertext[i+1], i, tail key)
//!   Digest[i]  = sha256(ciphertext[i])
//!   Root       = sha256(Digest[0] .. Digest[N-1], sha256(tail key))
//!
//! Editing chunk i is caught by its digest. An attacker who also rewrites
//! the digest table breaks the root, and one who rewrites the root still
//! gets garbage out of chunk i-1, whose key no longer matches.

use crate::crypto::digest::{sha256, sha256_parts, Digest256};

/// A sealed chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeChain {
    /// Ciphertext, in plaintext order.
    pub chunks: Vec<Vec<u8>>,
    /// `sha256(chunks[i])`.
    pub digests: Vec<Digest256>,
    /// Digest over the digest table.
    pub root: Digest256,
    /// Key of the last chunk.
    pub tail_key: Digest256,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CascadeError {
    #[error("chain root does not match the digest table")]
    RootMismatch,
    #[error("chunk {0} does not match its digest")]
    ChunkCorrupted(usize),
    #[error("chain has {chunks} chunks but {digests} digests")]
    Shape { chunks: usize, digests: usize },
}

/// XOR `data` with a keystream expanded from `key` in 32-byte blocks.
fn keystream_xor(data: &mut [u8], key: &Digest256) {
    for (block, chunk) in data.chunks_mut(32).enumerate() {
        let pad = sha256_parts(&[key.as_slice(), (block as u64).to_le_bytes().as_slice()]);
        for (b, k) in chunk.iter_mut().zip(pad.iter()) {
            *b ^= k;
        }
    }
}

/// Key of chunk `index`. The position and the tail key are mixed in so that
/// an empty successor still links the chunk to the rest of the chain.
fn link_key(chunks: &[Vec<u8>], index: usize, tail_key: &Digest256) -> Digest256 {
    match chunks.get(index + 1) {
        Some(next) => sha256_parts(&[
            next.as_slice(),
            (index as u64).to_le_bytes().as_slice(),
            tail_key.as_slice(),
        ]),
        None => *tail_key,
    }
}

fn root_of(digests: &[Digest256], tail_key: &Digest256) -> Digest256 {
    let key_check = sha256(tail_key);
    let mut parts: Vec<&[u8]> = digests.iter().map(|d| d.as_slice()).collect();
    parts.push(key_check.as_slice());
    sha256_parts(&parts)
}

/// Seal `plain` from tail to head.
pub fn seal(plain: &[&[u8]], tail_key: Digest256) -> CascadeChain {
    let n = plain.len();
    let mut chunks: Vec<Vec<u8>> = vec![Vec::new(); n];

    for i in (0..n).rev() {
        let key = link_key(&chunks, i, &tail_key);
        let mut ct = plain[i].to_vec();
        keystream_xor(&mut ct, &key);
        chunks[i] = ct;
    }

    let digests: Vec<Digest256> = chunks.iter().map(|c| sha256(c)).collect();
    let root = root_of(&digests, &tail_key);

    CascadeChain {
        chunks,
        digests,
        root,
        tail_key,
    }
}

impl CascadeChain {
    /// Verify every link, then decrypt. Nothing is decrypted unless the
    /// whole chain verifies.
    pub fn open(&self) -> Result<Vec<Vec<u8>>, CascadeError> {
        let n = self.chunks.len();
        if self.digests.len() != n {
            return Err(CascadeError::Shape {
                chunks: n,
                digests: self.digests.len(),
            });
        }
        if root_of(&self.digests, &self.tail_key) != self.root {
            return Err(CascadeError::RootMismatch);
        }
        for (i, chunk) in self.chunks.iter().enumerate() {
            if sha256(chunk) != self.digests[i] {
                return Err(CascadeError::ChunkCorrupted(i));
            }
        }

        Ok(self.open_unchecked())
    }

    /// Decrypt without verifying anything. Tampered chunks, and the chunk
    /// in front of each, come out as garbage.
    pub fn open_unchecked(&self) -> Vec<Vec<u8>> {
        let n = self.chunks.len();
        let mut plain = Vec::with_capacity(n);
        for i in 0..n {
            let key = link_key(&self.chunks, i, &self.tail_key);
            let mut pt = self.chunks[i].clone();
            keystream_xor(&mut pt, &key);
            plain.push(pt);
        }
        plain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bodies() -> Vec<Vec<u8>> {
        vec![
            b"first method body".to_vec(),
            (0..100u8).collect(),
            Vec::new(),
            b"last".to_vec(),
        ]
    }

    fn sealed() -> CascadeChain {
        let plain = bodies();
        let refs: Vec<&[u8]> = plain.iter().map(|b| b.as_slice()).collect();
        seal(&refs, [7u8; 32])
    }

    #[test]
    fn test_open_recovers_bodies() {
        assert_eq!(sealed().open().unwrap(), bodies());
    }

    #[test]
    fn test_ciphertext_hides_plaintext() {
        let chain = sealed();
        assert_ne!(chain.chunks[0], bodies()[0]);
        assert_ne!(chain.chunks[1], bodies()[1]);
    }

    #[test]
    fn test_empty_chain() {
        let chain = seal(&[], [0u8; 32]);
        assert!(chain.open().unwrap().is_empty());
    }

    #[test]
    fn test_middle_chunk_tamper_detected() {
        let mut chain = sealed();
        chain.chunks[1][10] ^= 0x01;
        assert_eq!(chain.open(), Err(CascadeError::ChunkCorrupted(1)));
    }

    #[test]
    fn test_digest_rewrite_breaks_root() {
        let mut chain = sealed();
        chain.chunks[3][0] ^= 0x80;
        chain.digests[3] = sha256(&chain.chunks[3]);
        assert_eq!(chain.open(), Err(CascadeError::RootMismatch));
    }

    #[test]
    fn test_full_rewrite_still_corrupts_neighbour() {
        let mut chain = sealed();
        chain.chunks[1][0] ^= 0x80;
        chain.digests[1] = sha256(&chain.chunks[1]);
        chain.root = root_of(&chain.digests, &chain.tail_key);
        let opened = chain.open().unwrap();
        // Chunk 0 was keyed on the original ciphertext of chunk 1.
        assert_ne!(opened[0], bodies()[0]);
        assert_eq!(opened[2], bodies()[2]);
    }

    #[test]
    fn test_tail_key_changes_every_chunk() {
        let plain = bodies();
        let refs: Vec<&[u8]> = plain.iter().map(|b| b.as_slice()).collect();
        let a = seal(&refs, [1u8; 32]);
        let b = seal(&refs, [2u8; 32]);
        assert_ne!(a.chunks[0], b.chunks[0]);
        assert_ne!(a.root, b.root);
    }

    #[test]
    fn test_empty_chunk_keeps_the_chain_linked() {
        let plain: Vec<&[u8]> = vec![b"head", b"", b"", b"tail"];
        let a = seal(&plain, [1u8; 32]);
        let b = seal(&plain, [2u8; 32]);
        assert_ne!(a.chunks[0], b.chunks[0]);

        // Same empty successor, different position.
        let twice: Vec<&[u8]> = vec![b"same", b"", b"same", b""];
        let chain = seal(&twice, [3u8; 32]);
        assert_ne!(chain.chunks[0], chain.chunks[2]);
        let opened = chain.open().unwrap();
        assert_eq!(opened[0], b"same");
        assert_eq!(opened[2], b"same");
        assert!(opened[1].is_empty() && opened[3].is_empty());
    }

    #[test]
    fn test_wrong_tail_key_breaks_root() {
        let mut chain = sealed();
        chain.tail_key[0] ^= 1;
        assert_eq!(chain.open(), Err(CascadeError::RootMismatch));
    }

    #[test]
    fn test_open_unchecked_ignores_digests() {
        let mut chain = sealed();
        chain.chunks[3][0] ^= 0x01;
        let opened = chain.open_unchecked();
        assert_eq!(opened[3][0], b'l' ^ 0x01);
        assert_eq!(opened[1], bodies()[1]);
    }
}
