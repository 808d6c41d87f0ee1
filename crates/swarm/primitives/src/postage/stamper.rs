use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

use alloy_signer::SignerSync;
use parking_lot::Mutex;

use super::{Batch, PostageError, PostageStamp, to_bucket};
use crate::ChunkAddress;

#[derive(Default)]
struct StamperState {
    /// Next free slot per bucket.
    buckets: HashMap<u32, u32>,
    /// Last timestamp issued, kept strictly increasing.
    last_timestamp: u64,
}

/// Issues stamps for a batch owned by a local signer.
///
/// Slots are handed out sequentially per bucket. A full bucket on a mutable
/// batch wraps to slot 0; on an immutable batch it is an error.
pub struct BatchStamper<S> {
    batch: Batch,
    signer: S,
    state: Mutex<StamperState>,
}

impl<S: SignerSync> BatchStamper<S> {
    pub fn new(batch: Batch, signer: S) -> Self {
        Self {
            batch,
            signer,
            state: Mutex::new(StamperState::default()),
        }
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    /// Stamps `address` with the next slot of its bucket.
    pub fn stamp(&self, address: &ChunkAddress) -> Result<PostageStamp, PostageError> {
        let bucket = to_bucket(self.batch.bucket_depth(), address);
        let capacity = self.batch.max_collisions();

        let (slot, timestamp) = {
            let mut state = self.state.lock();
            let next = state.buckets.entry(bucket).or_insert(0);
            if *next as u64 >= capacity {
                if self.batch.immutable() {
                    return Err(PostageError::BucketFull(bucket));
                }
                *next = 0;
            }
            let slot = *next;
            *next += 1;

            let timestamp = now_nanos().max(state.last_timestamp + 1);
            state.last_timestamp = timestamp;
            (slot, timestamp)
        };

        let stamp_index = ((bucket as u64) << 32) | slot as u64;
        let digest = PostageStamp::digest(address, self.batch.id(), stamp_index, timestamp);
        let signature = self.signer.sign_message_sync(digest.as_slice())?;

        Ok(PostageStamp::new(
            *self.batch.id(),
            bucket,
            slot,
            timestamp,
            signature,
        ))
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;
    use alloy_signer_local::PrivateKeySigner;
    use assert_matches::assert_matches;

    fn stamper(immutable: bool) -> BatchStamper<PrivateKeySigner> {
        let signer = PrivateKeySigner::random();
        let batch = Batch::new(B256::repeat_byte(1), signer.address(), 3, 2, immutable).unwrap();
        BatchStamper::new(batch, signer)
    }

    #[test]
    fn test_issued_stamp_verifies() {
        let stamper = stamper(false);
        let addr = ChunkAddress::new([0x42; 32]);
        let stamp = stamper.stamp(&addr).unwrap();

        assert_eq!(stamp.bucket_index(), to_bucket(2, &addr));
        stamp.verify(&addr, stamper.batch()).unwrap();

        // signature binds the address
        let other = ChunkAddress::new([0x43; 32]);
        assert!(stamp.verify(&other, stamper.batch()).is_err());
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let stamper = stamper(false);
        let addr = ChunkAddress::new([0x01; 32]);
        let a = stamper.stamp(&addr).unwrap();
        let b = stamper.stamp(&addr).unwrap();
        assert!(b.timestamp() > a.timestamp());
        assert_eq!(b.bucket_slot(), a.bucket_slot() + 1);
    }

    #[test]
    fn test_mutable_batch_wraps_full_bucket() {
        let stamper = stamper(false);
        let addr = ChunkAddress::new([0x00; 32]);
        for _ in 0..2 {
            stamper.stamp(&addr).unwrap();
        }
        assert_eq!(stamper.stamp(&addr).unwrap().bucket_slot(), 0);
    }

    #[test]
    fn test_immutable_batch_rejects_full_bucket() {
        let stamper = stamper(true);
        let addr = ChunkAddress::new([0x00; 32]);
        for _ in 0..2 {
            stamper.stamp(&addr).unwrap();
        }
        assert_matches!(stamper.stamp(&addr), Err(PostageError::BucketFull(0)));
    }

    #[test]
    fn test_wrong_owner_rejected() {
        let stamper = stamper(false);
        let addr = ChunkAddress::new([0x42; 32]);
        let stamp = stamper.stamp(&addr).unwrap();

        let foreign = Batch::new(
            *stamper.batch().id(),
            PrivateKeySigner::random().address(),
            3,
            2,
            false,
        )
        .unwrap();
        assert_matches!(
            stamp.verify(&addr, &foreign),
            Err(PostageError::OwnerMismatch { .. })
        );
    }
}
