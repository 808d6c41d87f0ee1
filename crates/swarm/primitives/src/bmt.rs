//! Binary Merkle Tree hashing of chunk payloads.
//!
//! A payload of up to [`CHUNK_SIZE`] bytes is zero-padded and split into
//! 32-byte segments. Pairs of segments are hashed level by level until a
//! single root remains, and the chunk address is `keccak256(span || root)`.

use alloy_primitives::{B256, Keccak256, keccak256};

use crate::{CHUNK_SIZE, SEGMENT_SIZE, SPAN_SIZE};

const SEGMENT_PAIR_SIZE: usize = 2 * SEGMENT_SIZE;

/// Little-endian span prefix.
pub type Span = [u8; SPAN_SIZE];

/// Encodes a payload length as a span.
pub fn span(length: u64) -> Span {
    length.to_le_bytes()
}

/// Computes the BMT root of a payload.
///
/// Payloads longer than [`CHUNK_SIZE`] are truncated; callers validate sizes.
pub fn root(payload: &[u8]) -> B256 {
    let mut buffer = [0u8; CHUNK_SIZE];
    for (dst, src) in buffer.iter_mut().zip(payload) {
        *dst = *src;
    }

    let mut level: Vec<B256> = buffer.chunks_exact(SEGMENT_PAIR_SIZE).map(keccak256).collect();
    while level.len() > 1 {
        level = level
            .chunks_exact(2)
            .map(|pair| {
                let mut hasher = Keccak256::new();
                for node in pair {
                    hasher.update(node);
                }
                hasher.finalize()
            })
            .collect();
    }

    level.first().copied().unwrap_or_default()
}

/// Computes the content address of `span || payload`.
pub fn hash(span: &Span, payload: &[u8]) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(span);
    hasher.update(root(payload));
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_is_significant_only_through_span() {
        let short = b"foo".to_vec();
        let mut padded = short.clone();
        padded.extend_from_slice(&[0u8; 5]);

        // zero padding yields the same tree root
        assert_eq!(root(&short), root(&padded));

        // but the span differs, so the address differs
        assert_ne!(
            hash(&span(short.len() as u64), &short),
            hash(&span(padded.len() as u64), &padded)
        );
    }

    #[test]
    fn test_hash_changes_with_content() {
        let a = hash(&span(3), b"foo");
        let b = hash(&span(3), b"bar");
        assert_ne!(a, b);
        assert_eq!(a, hash(&span(3), b"foo"));
    }

    #[test]
    fn test_last_segment_affects_root() {
        let mut data = vec![0u8; CHUNK_SIZE];
        let before = root(&data);
        data[CHUNK_SIZE - 1] = 1;
        assert_ne!(before, root(&data));
    }
}
