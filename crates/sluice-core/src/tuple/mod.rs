//! Tuple record codec and the capability traits that interpret tuples.
//!
//! The sorted aggregator never looks inside keys or values; ordering is
//! delegated to a [`Comparator`] and per-key combining to an optional
//! [`Accumulator`]. Records use one framing in memory blocks and in spill
//! files alike, so spilling is a straight copy of encoded bytes:
//!
//! ```text
//! u32 key_len | key bytes | u32 value_len | value bytes
//! ```
//!
//! Length fields are written in the byte order configured at construction.

mod accumulator;
mod comparator;

pub use accumulator::{Accumulator, IntSumAccumulator, LongSumAccumulator};
pub use comparator::{BytewiseComparator, Comparator, StringComparator};

/// Size in bytes of each record length field.
pub const LENGTH_FIELD: usize = 4;

/// Byte order for record length fields and numeric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian encoding.
    Little,
    /// Big-endian encoding.
    Big,
}

impl ByteOrder {
    /// Writes a `u32` into the first four bytes of `dst`.
    #[inline]
    pub fn write_u32(self, dst: &mut [u8], v: u32) {
        let bytes = match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        };
        dst[..4].copy_from_slice(&bytes);
    }

    /// Reads a `u32` from the first four bytes of `src`.
    #[inline]
    #[must_use]
    pub fn read_u32(self, src: &[u8]) -> u32 {
        let bytes: [u8; 4] = src[..4].try_into().expect("length field present");
        match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        }
    }

    /// Writes an `i32` into the first four bytes of `dst`.
    #[inline]
    pub fn write_i32(self, dst: &mut [u8], v: i32) {
        let bytes = match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        };
        dst[..4].copy_from_slice(&bytes);
    }

    /// Reads an `i32` from the first four bytes of `src`.
    #[inline]
    #[must_use]
    pub fn read_i32(self, src: &[u8]) -> i32 {
        let bytes: [u8; 4] = src[..4].try_into().expect("value field present");
        match self {
            ByteOrder::Little => i32::from_le_bytes(bytes),
            ByteOrder::Big => i32::from_be_bytes(bytes),
        }
    }

    /// Writes an `i64` into the first eight bytes of `dst`.
    #[inline]
    pub fn write_i64(self, dst: &mut [u8], v: i64) {
        let bytes = match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        };
        dst[..8].copy_from_slice(&bytes);
    }

    /// Reads an `i64` from the first eight bytes of `src`.
    #[inline]
    #[must_use]
    pub fn read_i64(self, src: &[u8]) -> i64 {
        let bytes: [u8; 8] = src[..8].try_into().expect("value field present");
        match self {
            ByteOrder::Little => i64::from_le_bytes(bytes),
            ByteOrder::Big => i64::from_be_bytes(bytes),
        }
    }
}

/// Encoded size of a record with the given key and value.
#[inline]
#[must_use]
pub fn record_len(key: &[u8], value: &[u8]) -> usize {
    2 * LENGTH_FIELD + key.len() + value.len()
}

/// Encodes one record into `dst`, which must be exactly `record_len` bytes.
///
/// # Panics
///
/// Panics if `dst` is not exactly the encoded record size, or a length does
/// not fit in `u32`; ingestion reserves the exact size first.
pub fn encode_record(order: ByteOrder, dst: &mut [u8], key: &[u8], value: &[u8]) {
    assert_eq!(dst.len(), record_len(key, value), "reservation mismatch");
    let key_len = u32::try_from(key.len()).expect("key length fits u32");
    let value_len = u32::try_from(value.len()).expect("value length fits u32");

    order.write_u32(&mut dst[..LENGTH_FIELD], key_len);
    let mut at = LENGTH_FIELD;
    dst[at..at + key.len()].copy_from_slice(key);
    at += key.len();
    order.write_u32(&mut dst[at..at + LENGTH_FIELD], value_len);
    at += LENGTH_FIELD;
    dst[at..at + value.len()].copy_from_slice(value);
}

/// Decodes the record starting at the head of `src`.
///
/// Returns `(key, value, consumed)`. `src` must begin at a record boundary
/// of bytes previously written by [`encode_record`].
#[must_use]
pub fn decode_record(order: ByteOrder, src: &[u8]) -> (&[u8], &[u8], usize) {
    let key_len = order.read_u32(src) as usize;
    let key_start = LENGTH_FIELD;
    let value_len_at = key_start + key_len;
    let value_len = order.read_u32(&src[value_len_at..]) as usize;
    let value_start = value_len_at + LENGTH_FIELD;
    (
        &src[key_start..key_start + key_len],
        &src[value_start..value_start + value_len],
        value_start + value_len,
    )
}

/// Byte range of the value field within an encoded record at `offset`.
#[must_use]
pub fn value_range(order: ByteOrder, src: &[u8], offset: usize) -> std::ops::Range<usize> {
    let key_len = order.read_u32(&src[offset..]) as usize;
    let value_len_at = offset + LENGTH_FIELD + key_len;
    let value_len = order.read_u32(&src[value_len_at..]) as usize;
    let value_start = value_len_at + LENGTH_FIELD;
    value_start..value_start + value_len
}
