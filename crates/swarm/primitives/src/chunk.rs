//! Chunks: the unit of storage.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{ChunkAddress, CHUNK_SIZE, MAX_CHUNK_DATA_SIZE, PostageStamp, SPAN_SIZE, bmt};

/// Errors building or inspecting a chunk.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    /// Payload exceeds the chunk size.
    #[error("payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Data is too short to carry a span.
    #[error("chunk data of {0} bytes is shorter than the span")]
    TooShort(usize),
}

/// An immutable chunk: address, `span || payload` data and an optional stamp.
///
/// Content-addressed chunks are built with [`Chunk::content`], which derives
/// the address from the data. [`Chunk::new`] trusts the caller, which is how
/// single-owner chunks and chunks read back from storage are assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    address: ChunkAddress,
    data: Bytes,
    stamp: Option<PostageStamp>,
}

impl Chunk {
    /// Assemble a chunk from an address and data without verification.
    pub fn new(address: ChunkAddress, data: impl Into<Bytes>) -> Self {
        Self {
            address,
            data: data.into(),
            stamp: None,
        }
    }

    /// Build a content-addressed chunk from a payload.
    pub fn content(payload: &[u8]) -> Result<Self, ChunkError> {
        if payload.len() > CHUNK_SIZE {
            return Err(ChunkError::PayloadTooLarge {
                size: payload.len(),
                max: CHUNK_SIZE,
            });
        }

        let span = bmt::span(payload.len() as u64);
        let mut data = BytesMut::with_capacity(SPAN_SIZE + payload.len());
        data.put_slice(&span);
        data.put_slice(payload);

        Ok(Self {
            address: bmt::hash(&span, payload).into(),
            data: data.freeze(),
            stamp: None,
        })
    }

    /// Attach a postage stamp.
    pub fn with_stamp(mut self, stamp: PostageStamp) -> Self {
        self.stamp = Some(stamp);
        self
    }

    /// Drop the stamp, keeping address and data.
    pub fn without_stamp(mut self) -> Self {
        self.stamp = None;
        self
    }

    pub fn address(&self) -> &ChunkAddress {
        &self.address
    }

    /// `span || payload`.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn stamp(&self) -> Option<&PostageStamp> {
        self.stamp.as_ref()
    }

    /// Payload without the span prefix.
    pub fn payload(&self) -> Result<&[u8], ChunkError> {
        self.data
            .get(SPAN_SIZE..)
            .ok_or(ChunkError::TooShort(self.data.len()))
    }

    /// Span value (payload length of the subtree this chunk covers).
    pub fn span(&self) -> Result<u64, ChunkError> {
        let span = self
            .data
            .get(..SPAN_SIZE)
            .and_then(|s| <[u8; SPAN_SIZE]>::try_from(s).ok())
            .ok_or(ChunkError::TooShort(self.data.len()))?;
        Ok(u64::from_le_bytes(span))
    }

    /// Check that the address is the BMT hash of the data.
    pub fn is_valid_content(&self) -> bool {
        if self.data.len() > MAX_CHUNK_DATA_SIZE {
            return false;
        }
        match (self.data.get(..SPAN_SIZE), self.payload()) {
            (Some(span), Ok(payload)) => {
                let mut s = [0u8; SPAN_SIZE];
                s.copy_from_slice(span);
                ChunkAddress::from(bmt::hash(&s, payload)) == self.address
            }
            _ => false,
        }
    }
}
