use alloy_primitives::{B256, Keccak256, Signature};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::{Batch, BatchId, PostageError};
use crate::ChunkAddress;

// Size of components in a `PostageStamp`
const BATCH_ID_SIZE: usize = std::mem::size_of::<B256>();
const BUCKET_INDEX_SIZE: usize = std::mem::size_of::<u32>();
const BUCKET_SLOT_SIZE: usize = std::mem::size_of::<u32>();
const TIMESTAMP_SIZE: usize = std::mem::size_of::<u64>();
const SIGNATURE_SIZE: usize = 65;

/// Total size of a serialized `PostageStamp`.
pub const POSTAGE_STAMP_SIZE: usize =
    BATCH_ID_SIZE + BUCKET_INDEX_SIZE + BUCKET_SLOT_SIZE + TIMESTAMP_SIZE + SIGNATURE_SIZE;

/// A batch owner's signed authorisation to store one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostageStamp {
    batch_id: BatchId,
    bucket_index: u32,
    bucket_slot: u32,
    timestamp: u64,
    signature: Signature,
}

impl PostageStamp {
    pub fn new(
        batch_id: BatchId,
        bucket_index: u32,
        bucket_slot: u32,
        timestamp: u64,
        signature: Signature,
    ) -> Self {
        Self {
            batch_id,
            bucket_index,
            bucket_slot,
            timestamp,
            signature,
        }
    }

    pub fn batch_id(&self) -> &BatchId {
        &self.batch_id
    }

    pub fn bucket_index(&self) -> u32 {
        self.bucket_index
    }

    pub fn bucket_slot(&self) -> u32 {
        self.bucket_slot
    }

    /// Bucket and slot packed as `bucket << 32 | slot`.
    pub fn index(&self) -> u64 {
        ((self.bucket_index as u64) << 32) | self.bucket_slot as u64
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Digest the batch owner signs for a given chunk.
    pub fn digest(
        address: &ChunkAddress,
        batch_id: &BatchId,
        index: u64,
        timestamp: u64,
    ) -> B256 {
        let mut hasher = Keccak256::new();
        hasher.update(address);
        hasher.update(batch_id);
        hasher.update(index.to_be_bytes());
        hasher.update(timestamp.to_be_bytes());
        hasher.finalize()
    }

    /// Hash identifying this stamp.
    pub fn hash(&self) -> B256 {
        let mut hasher = Keccak256::new();
        hasher.update(self.batch_id);
        hasher.update(self.bucket_index.to_be_bytes());
        hasher.update(self.bucket_slot.to_be_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(self.signature.as_bytes());
        hasher.finalize()
    }

    /// Checks that this stamp authorises `address` under `batch`.
    pub fn verify(&self, address: &ChunkAddress, batch: &Batch) -> Result<(), PostageError> {
        let expected = to_bucket(batch.bucket_depth(), address);
        if self.bucket_index != expected {
            return Err(PostageError::BucketMismatch {
                expected,
                actual: self.bucket_index,
            });
        }

        let capacity = batch.max_collisions();
        if self.bucket_slot as u64 >= capacity {
            return Err(PostageError::SlotOutOfRange {
                slot: self.bucket_slot,
                capacity,
            });
        }

        let digest = Self::digest(address, &self.batch_id, self.index(), self.timestamp);
        let recovered = self.signature.recover_address_from_msg(digest.as_slice())?;
        if recovered != batch.owner() {
            return Err(PostageError::OwnerMismatch {
                owner: batch.owner(),
                recovered,
            });
        }

        Ok(())
    }
}

impl From<&PostageStamp> for Bytes {
    fn from(stamp: &PostageStamp) -> Self {
        let mut buf = BytesMut::with_capacity(POSTAGE_STAMP_SIZE);
        buf.put_slice(stamp.batch_id.as_slice());
        buf.put_u32(stamp.bucket_index);
        buf.put_u32(stamp.bucket_slot);
        buf.put_u64(stamp.timestamp);
        buf.put_slice(&stamp.signature.as_bytes());
        buf.freeze()
    }
}

impl TryFrom<&[u8]> for PostageStamp {
    type Error = PostageError;

    fn try_from(buf: &[u8]) -> Result<Self, Self::Error> {
        if buf.len() != POSTAGE_STAMP_SIZE {
            return Err(PostageError::IncorrectSize(buf.len(), POSTAGE_STAMP_SIZE));
        }

        let (batch_id, rest) = buf.split_at(BATCH_ID_SIZE);
        let (bucket_index, rest) = rest.split_at(BUCKET_INDEX_SIZE);
        let (bucket_slot, rest) = rest.split_at(BUCKET_SLOT_SIZE);
        let (timestamp, signature) = rest.split_at(TIMESTAMP_SIZE);

        let be_u32 = |b: &[u8]| {
            <[u8; 4]>::try_from(b)
                .map(u32::from_be_bytes)
                .map_err(|_| PostageError::IncorrectSize(buf.len(), POSTAGE_STAMP_SIZE))
        };

        Ok(Self {
            batch_id: BatchId::from_slice(batch_id),
            bucket_index: be_u32(bucket_index)?,
            bucket_slot: be_u32(bucket_slot)?,
            timestamp: <[u8; 8]>::try_from(timestamp)
                .map(u64::from_be_bytes)
                .map_err(|_| PostageError::IncorrectSize(buf.len(), POSTAGE_STAMP_SIZE))?,
            signature: Signature::try_from(signature)?,
        })
    }
}

/// Returns the collision bucket for a chunk address: its first
/// `bucket_depth` bits read as a big-endian integer.
pub fn to_bucket(bucket_depth: u8, address: &ChunkAddress) -> u32 {
    if bucket_depth == 0 {
        return 0;
    }
    let bytes = address.as_bytes();
    let prefix = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    prefix >> (32 - bucket_depth.min(32) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;

    fn test_signature() -> Signature {
        Signature::new(U256::from(1u64), U256::from(2u64), false)
    }

    #[test]
    fn test_to_bucket_takes_leading_bits() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0b1010_0000;
        bytes[1] = 0xff;
        let addr = ChunkAddress::new(bytes);

        assert_eq!(to_bucket(0, &addr), 0);
        assert_eq!(to_bucket(1, &addr), 1);
        assert_eq!(to_bucket(3, &addr), 0b101);
        assert_eq!(to_bucket(16, &addr), 0xa0ff);
    }

    #[test]
    fn test_index_packs_bucket_and_slot() {
        let stamp = PostageStamp::new(B256::ZERO, 3, 7, 0, test_signature());
        assert_eq!(stamp.index(), (3u64 << 32) | 7);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let stamp = PostageStamp::new(
            B256::repeat_byte(9),
            0xabcd,
            2,
            1_700_000_000,
            test_signature(),
        );
        let bytes = Bytes::from(&stamp);
        assert_eq!(bytes.len(), POSTAGE_STAMP_SIZE);
        assert_eq!(PostageStamp::try_from(bytes.as_ref()).unwrap(), stamp);
    }

    #[test]
    fn test_wrong_size_rejected() {
        assert!(matches!(
            PostageStamp::try_from(&[0u8; 10][..]),
            Err(PostageError::IncorrectSize(10, POSTAGE_STAMP_SIZE))
        ));
    }
}
