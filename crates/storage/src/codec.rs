//! Key and value codecs.
//!
//! Keys are encoded so that byte-wise ordering equals logical ordering:
//! integers are big-endian and tuples concatenate their parts. Values carry
//! no ordering requirement and are usually postcard-encoded.

use std::fmt::Debug;

use crate::DatabaseError;

/// Trait that will transform the data to be saved in the DB.
pub trait Encode: Send + Sync + Sized + Debug {
    /// Encoded type.
    type Encoded: AsRef<[u8]> + Into<Vec<u8>> + Send + Sync + Ord + Debug;

    /// Encodes data going into the database.
    fn encode(self) -> Self::Encoded;
}

/// Trait that will transform the data to be read from the DB.
pub trait Decode: Send + Sync + Sized + Debug {
    /// Decodes data coming from the database.
    fn decode(value: &[u8]) -> Result<Self, DatabaseError>;

    /// Decodes owned data coming from the database.
    fn decode_owned(value: Vec<u8>) -> Result<Self, DatabaseError> {
        Self::decode(&value)
    }
}

/// Keys whose encoding always has the same length.
///
/// Only fixed-size keys may appear before the last element of a tuple key,
/// since decoding splits the tuple at known offsets.
pub trait FixedSize {
    /// Encoded length in bytes.
    const SIZE: usize;
}

/// Trait that will transform the data to be saved in the DB in a compact format.
pub trait Compress: Send + Sync + Sized + Debug {
    /// Compresses data going into the database.
    fn compress(&self) -> Result<Vec<u8>, DatabaseError>;
}

/// Trait that will transform the data to be read from the DB.
pub trait Decompress: Send + Sync + Sized + Debug {
    /// Decompresses data coming from the database.
    fn decompress(value: &[u8]) -> Result<Self, DatabaseError>;
}

/// Generic trait that enforces the database key to implement [`Encode`] and [`Decode`].
pub trait Key: Encode + Decode + Ord + Clone {}

impl<T> Key for T where T: Encode + Decode + Ord + Clone {}

/// Generic trait that enforces the database value to implement [`Compress`] and [`Decompress`].
pub trait Value: Compress + Decompress {}

impl<T> Value for T where T: Compress + Decompress {}

fn fixed<const N: usize>(value: &[u8]) -> Result<[u8; N], DatabaseError> {
    <[u8; N]>::try_from(value).map_err(|_| DatabaseError::Decode)
}

macro_rules! impl_uint {
    ($($ty:ty),*) => {
        $(
            impl Encode for $ty {
                type Encoded = [u8; std::mem::size_of::<$ty>()];

                fn encode(self) -> Self::Encoded {
                    self.to_be_bytes()
                }
            }

            impl Decode for $ty {
                fn decode(value: &[u8]) -> Result<Self, DatabaseError> {
                    fixed(value).map(<$ty>::from_be_bytes)
                }
            }

            impl FixedSize for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();
            }

            impl Compress for $ty {
                fn compress(&self) -> Result<Vec<u8>, DatabaseError> {
                    Ok(self.to_be_bytes().to_vec())
                }
            }

            impl Decompress for $ty {
                fn decompress(value: &[u8]) -> Result<Self, DatabaseError> {
                    Self::decode(value)
                }
            }
        )*
    };
}

impl_uint!(u8, u16, u32, u64);

impl Encode for () {
    type Encoded = [u8; 0];

    fn encode(self) -> Self::Encoded {
        []
    }
}

impl Decode for () {
    fn decode(value: &[u8]) -> Result<Self, DatabaseError> {
        if value.is_empty() {
            Ok(())
        } else {
            Err(DatabaseError::Decode)
        }
    }
}

impl FixedSize for () {
    const SIZE: usize = 0;
}

impl Compress for () {
    fn compress(&self) -> Result<Vec<u8>, DatabaseError> {
        Ok(Vec::new())
    }
}

impl Decompress for () {
    fn decompress(_: &[u8]) -> Result<Self, DatabaseError> {
        Ok(())
    }
}

impl<A, B> Encode for (A, B)
where
    A: Encode + FixedSize,
    B: Encode,
{
    type Encoded = Vec<u8>;

    fn encode(self) -> Self::Encoded {
        let mut out = Vec::with_capacity(A::SIZE + 32);
        out.extend_from_slice(self.0.encode().as_ref());
        out.extend_from_slice(self.1.encode().as_ref());
        out
    }
}

impl<A, B> Decode for (A, B)
where
    A: Decode + FixedSize,
    B: Decode,
{
    fn decode(value: &[u8]) -> Result<Self, DatabaseError> {
        let (a, b) = value.split_at_checked(A::SIZE).ok_or(DatabaseError::Decode)?;
        Ok((A::decode(a)?, B::decode(b)?))
    }
}

impl<A: FixedSize, B: FixedSize> FixedSize for (A, B) {
    const SIZE: usize = A::SIZE + B::SIZE;
}

impl<A, B, C> Encode for (A, B, C)
where
    A: Encode + FixedSize,
    B: Encode + FixedSize,
    C: Encode,
{
    type Encoded = Vec<u8>;

    fn encode(self) -> Self::Encoded {
        let mut out = Vec::with_capacity(A::SIZE + B::SIZE + 32);
        out.extend_from_slice(self.0.encode().as_ref());
        out.extend_from_slice(self.1.encode().as_ref());
        out.extend_from_slice(self.2.encode().as_ref());
        out
    }
}

impl<A, B, C> Decode for (A, B, C)
where
    A: Decode + FixedSize,
    B: Decode + FixedSize,
    C: Decode,
{
    fn decode(value: &[u8]) -> Result<Self, DatabaseError> {
        let (a, rest) = value.split_at_checked(A::SIZE).ok_or(DatabaseError::Decode)?;
        let (b, c) = rest.split_at_checked(B::SIZE).ok_or(DatabaseError::Decode)?;
        Ok((A::decode(a)?, B::decode(b)?, C::decode(c)?))
    }
}

impl<A: FixedSize, B: FixedSize, C: FixedSize> FixedSize for (A, B, C) {
    const SIZE: usize = A::SIZE + B::SIZE + C::SIZE;
}

#[cfg(feature = "alloy")]
mod alloy_impls {
    use alloy_primitives::B256;

    use super::*;

    impl Encode for B256 {
        type Encoded = [u8; 32];

        fn encode(self) -> Self::Encoded {
            self.0
        }
    }

    impl Decode for B256 {
        fn decode(value: &[u8]) -> Result<Self, DatabaseError> {
            fixed(value).map(B256::new)
        }
    }

    impl FixedSize for B256 {
        const SIZE: usize = 32;
    }

    impl Compress for B256 {
        fn compress(&self) -> Result<Vec<u8>, DatabaseError> {
            Ok(self.to_vec())
        }
    }

    impl Decompress for B256 {
        fn decompress(value: &[u8]) -> Result<Self, DatabaseError> {
            Self::decode(value)
        }
    }
}

#[cfg(feature = "swarm")]
mod swarm_impls {
    use vertex_swarm_primitives::SwarmAddress;

    use super::*;

    impl Encode for SwarmAddress {
        type Encoded = [u8; 32];

        fn encode(self) -> Self::Encoded {
            *self.as_bytes()
        }
    }

    impl Decode for SwarmAddress {
        fn decode(value: &[u8]) -> Result<Self, DatabaseError> {
            fixed(value).map(SwarmAddress::new)
        }
    }

    impl FixedSize for SwarmAddress {
        const SIZE: usize = 32;
    }

    impl Compress for SwarmAddress {
        fn compress(&self) -> Result<Vec<u8>, DatabaseError> {
            Ok(self.as_bytes().to_vec())
        }
    }

    impl Decompress for SwarmAddress {
        fn decompress(value: &[u8]) -> Result<Self, DatabaseError> {
            Self::decode(value)
        }
    }
}

/// Implements [`Compress`] and [`Decompress`] through postcard for serde types.
#[macro_export]
macro_rules! postcard_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::Compress for $ty {
                fn compress(&self) -> Result<Vec<u8>, $crate::DatabaseError> {
                    $crate::__private::postcard::to_allocvec(self)
                        .map_err(|e| $crate::DatabaseError::Encode(e.to_string()))
                }
            }

            impl $crate::Decompress for $ty {
                fn decompress(value: &[u8]) -> Result<Self, $crate::DatabaseError> {
                    $crate::__private::postcard::from_bytes(value)
                        .map_err(|_| $crate::DatabaseError::Decode)
                }
            }
        )*
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        refs: u32,
        name: String,
    }

    postcard_value!(Record);

    #[test]
    fn test_postcard_value() {
        let record = Record {
            refs: 3,
            name: "chunk".into(),
        };
        let bytes = record.compress().unwrap();
        assert_eq!(Record::decompress(&bytes).unwrap(), record);
        assert_matches!(Record::decompress(&[0xff]), Err(DatabaseError::Decode));
    }

    #[test]
    fn test_tuple_decode_rejects_short_input() {
        assert_matches!(<(u64, u8)>::decode(&[1, 2, 3]), Err(DatabaseError::Decode));
        assert_matches!(<()>::decode(&[1]), Err(DatabaseError::Decode));
    }

    proptest! {
        #[test]
        fn proptest_u64_order_preserved(a: u64, b: u64) {
            prop_assert_eq!(a.cmp(&b), a.encode().cmp(&b.encode()));
        }

        #[test]
        fn proptest_tuple_order_preserved(a: (u8, u64, u32), b: (u8, u64, u32)) {
            let ea = a.encode();
            let eb = b.encode();
            prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
            prop_assert_eq!(<(u8, u64, u32)>::decode(&ea).unwrap(), a);
        }
    }
}
